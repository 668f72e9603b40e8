/*!
 * Common test utilities for the namesake test suite
 */

use anyhow::Result;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use namesake::database::models::{now_timestamp, ChapterContextRecord, ChapterRecord, WorkRecord};
use namesake::database::Repository;
use namesake::errors::ProviderError;
use namesake::extraction::EntityExtractor;
use namesake::jobs::{JobRunner, RetryPolicy};
use namesake::providers::mock::{last_user_message, MockProvider};
use namesake::providers::{CompletionRequest, ProviderRegistry, RequestBudget};
use namesake::registry::{EntityRegistry, SqliteKeywordIndex};
use namesake::translation::ChapterTranslator;

/// Names the scripted provider recognizes: source, category, translation
pub const GLOSSARY: &[(&str, &str, &str)] = &[
    ("李伟", "character", "Li Wei"),
    ("王芳", "character", "Wang Fang"),
    ("天元宗", "place", "Tianyuan Sect"),
    ("筑基", "term", "Foundation Establishment"),
];

/// Install env_logger once; later calls are no-ops
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Creates a temporary directory for test files
pub fn create_temp_dir() -> Result<TempDir> {
    Ok(TempDir::new()?)
}

/// Creates a test file with the given content in the specified directory
pub fn create_test_file(dir: &Path, filename: &str, content: &str) -> Result<PathBuf> {
    let file_path = dir.join(filename);
    std::fs::write(&file_path, content)?;
    Ok(file_path)
}

/// Extraction response in the shape the model is asked for
pub fn extraction_reply(characters: &[&str], places: &[&str], terms: &[&str], summary: &str) -> String {
    json!({
        "characters": characters,
        "places": places,
        "terms": terms,
        "summary": summary,
    })
    .to_string()
}

/// Translation response in the shape the model is asked for
pub fn translation_reply(title: &str, content: &str, mappings: &[(&str, &str)], summary: &str) -> String {
    let mappings: serde_json::Map<String, Value> = mappings
        .iter()
        .map(|(source, target)| (source.to_string(), Value::String(target.to_string())))
        .collect();
    json!({
        "title": title,
        "content": content,
        "entity_mappings": mappings,
        "summary": summary,
    })
    .to_string()
}

/// The JSON user prompt of a request
pub fn user_payload(request: &CompletionRequest) -> Value {
    serde_json::from_str(&last_user_message(request)).unwrap_or(Value::Null)
}

/// Whether a request is an extraction request
pub fn is_extraction(request: &CompletionRequest) -> bool {
    user_payload(request)["task"] == "extract_entities"
}

/// Answers extraction and translation requests from `GLOSSARY`
///
/// Extraction lists every glossary name found in the chapter text.
/// Translation replaces every glossary name with its translation and maps
/// each one it replaced.
pub fn story_responder(request: &CompletionRequest) -> Result<String, ProviderError> {
    let payload = user_payload(request);
    match payload["task"].as_str() {
        Some("extract_entities") => {
            let text = payload["chapter_text"].as_str().unwrap_or_default();
            let found = |category: &str| -> Vec<&str> {
                GLOSSARY
                    .iter()
                    .filter(|(name, kind, _)| *kind == category && text.contains(name))
                    .map(|(name, _, _)| *name)
                    .collect()
            };
            let summary: String = text.chars().take(12).collect();
            Ok(extraction_reply(
                &found("character"),
                &found("place"),
                &found("term"),
                &format!("摘要：{}", summary),
            ))
        }
        Some("translate_chapter") => {
            let title = payload["chapter"]["title"].as_str().unwrap_or_default();
            let mut content = payload["chapter"]["content"].as_str().unwrap_or_default().to_string();
            let mut mappings = Vec::new();
            for (name, _, translated) in GLOSSARY {
                if content.contains(name) {
                    content = content.replace(name, translated);
                    mappings.push((*name, *translated));
                }
            }
            Ok(translation_reply(
                &format!("Chapter: {}", title),
                &content,
                &mappings,
                &format!("Summary of {}", title),
            ))
        }
        _ => Err(ProviderError::InvalidRequest("Unknown task".to_string())),
    }
}

/// Mock provider backed by `story_responder`
pub fn story_provider() -> MockProvider {
    MockProvider::working(story_responder)
}

/// In-memory pipeline wired around one mock provider
pub struct TestPipeline {
    pub repo: Repository,
    pub registry: Arc<EntityRegistry>,
    pub extractor: EntityExtractor,
    pub translator: ChapterTranslator,
    pub runner: JobRunner,
    pub provider: MockProvider,
}

/// Retry policy with no delays, so retried jobs are due immediately
pub fn immediate_retries() -> RetryPolicy {
    RetryPolicy {
        retry_backoff_ms: 0,
        max_backoff_ms: 0,
        parse_retry_limit: 1,
        jitter: false,
    }
}

pub fn pipeline(provider: MockProvider) -> TestPipeline {
    init_test_logger();
    let repo = Repository::new_in_memory().expect("Failed to create in-memory repository");
    let providers = Arc::new(ProviderRegistry::new().with_provider("mock", Arc::new(provider.clone())));
    let budget = Arc::new(RequestBudget::unthrottled(4));
    let registry = Arc::new(
        EntityRegistry::new(repo.clone()).with_keyword_index(Arc::new(SqliteKeywordIndex::new(repo.clone()))),
    );
    let extractor = EntityExtractor::new(providers.clone(), budget.clone());
    let translator = ChapterTranslator::new(registry.clone(), providers, budget);
    let runner = JobRunner::new(registry.clone(), extractor.clone(), translator.clone())
        .with_policy(immediate_retries())
        .with_worker_count(2);

    TestPipeline {
        repo,
        registry,
        extractor,
        translator,
        runner,
        provider,
    }
}

/// Create a Chinese work with an English edition and the given chapters
pub async fn seed_work(repo: &Repository, chapters: &[&str]) -> Result<(WorkRecord, Vec<ChapterRecord>)> {
    let work = repo.create_work("天元传", "zh").await?;
    repo.create_edition(work.id, "en").await?;
    let mut records = Vec::new();
    for (index, content) in chapters.iter().enumerate() {
        let number = index as i64 + 1;
        records.push(
            repo.add_source_chapter(work.id, number, &format!("第{}章", number), content)
                .await?,
        );
    }
    Ok((work, records))
}

/// Store an extraction result for `chapter` as if extraction had run
pub async fn save_context(
    repo: &Repository,
    chapter: &ChapterRecord,
    characters: &[&str],
    places: &[&str],
    terms: &[&str],
    summary: &str,
) -> Result<()> {
    let list = |names: &[&str]| names.iter().map(|n| n.to_string()).collect::<Vec<_>>();
    repo.save_chapter_context(&ChapterContextRecord {
        chapter_id: chapter.id,
        characters: list(characters),
        places: list(places),
        terms: list(terms),
        summary: summary.to_string(),
        source_hash: chapter.content_hash.clone(),
        updated_at: now_timestamp(),
    })
    .await
}
