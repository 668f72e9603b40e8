/*!
 * Chapter translation service.
 *
 * Translates one source chapter into one target language:
 * 1. Build the context (vocabulary, earlier summaries, style hints)
 * 2. Ask the provider for `{title, content, entity_mappings, summary}`
 * 3. Check that every expected name came back with a translation
 * 4. Store the chapter and merge the name mappings in one transaction
 *
 * Nothing is written unless the response parses and has content.
 */

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

use crate::app_config::Config;
use crate::database::models::{ChapterRecord, TranslatedChapterInput};
use crate::database::Repository;
use crate::errors::{Diagnostics, PipelineError, DEFAULT_DIAGNOSTIC_CHARS};
use crate::language_utils;
use crate::providers::{CompletionRequest, ProviderRegistry, RequestBudget, TokenUsage};
use crate::registry::{merge_translations_in, EntityConflict, EntityRegistry, MergeStats};
use crate::translation::context::{ContextBuilder, TranslationContext};
use crate::translation::json::{self, ResponseFault};
use crate::translation::prompts::TranslationPromptBuilder;

/// Result of a stored translation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranslationOutcome {
    pub source_chapter_id: i64,
    pub target_chapter_id: i64,
    pub work_id: i64,
    pub chapter_number: i64,
    pub language: String,
    /// Expected names the response gave no translation for
    pub missing_entities: Vec<String>,
    /// Proposed names that disagreed with established ones
    pub conflicting_entities: Vec<EntityConflict>,
    pub merge: MergeStats,
    pub usage: TokenUsage,
}

/// Decoded translation response
#[derive(Debug, Clone, PartialEq)]
struct ParsedTranslation {
    title: Option<String>,
    content: String,
    entity_mappings: BTreeMap<String, String>,
    summary: Option<String>,
}

fn parse_translation(raw: &str) -> Result<ParsedTranslation, ResponseFault> {
    let map = json::parse_object(raw).map_err(ResponseFault::Unparseable)?;

    let content = json::optional_string(&map, "content")
        .map_err(ResponseFault::Invalid)?
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ResponseFault::Invalid("Response has no translated content".to_string()))?;

    Ok(ParsedTranslation {
        title: json::optional_string(&map, "title")
            .map_err(ResponseFault::Invalid)?
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty()),
        content,
        entity_mappings: entity_mappings(&map).map_err(ResponseFault::Invalid)?,
        summary: json::optional_string(&map, "summary")
            .map_err(ResponseFault::Invalid)?
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })
}

/// Read `entity_mappings` as an object or a list of `{source, target}` pairs
///
/// Absent means no mappings; entries with empty or null translations are dropped.
fn entity_mappings(map: &Map<String, Value>) -> Result<BTreeMap<String, String>, String> {
    let mut mappings = BTreeMap::new();
    let mut add = |source: &str, target: &str| {
        let (source, target) = (source.trim(), target.trim());
        if !source.is_empty() && !target.is_empty() {
            mappings.insert(source.to_string(), target.to_string());
        }
    };

    match map.get("entity_mappings") {
        None | Some(Value::Null) => {}
        Some(Value::Object(entries)) => {
            for (source, target) in entries {
                match target {
                    Value::String(target) => add(source, target),
                    Value::Null => {}
                    _ => return Err(format!("Mapping for '{}' must be a string", source)),
                }
            }
        }
        Some(Value::Array(items)) => {
            for item in items {
                let source = item
                    .get("source")
                    .or_else(|| item.get("source_name"))
                    .and_then(Value::as_str);
                let target = item
                    .get("target")
                    .or_else(|| item.get("translated_name"))
                    .and_then(Value::as_str);
                match (source, target) {
                    (Some(source), Some(target)) => add(source, target),
                    _ => return Err("Mapping list entries need 'source' and 'target' strings".to_string()),
                }
            }
        }
        Some(_) => return Err("'entity_mappings' must be an object".to_string()),
    }

    Ok(mappings)
}

/// Names the translation must account for, in first-seen order
///
/// The chapter's own extracted names, plus vocabulary names that occur in
/// the chapter text.
pub fn expected_entities(extracted: &[String], context: &TranslationContext, text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    extracted
        .iter()
        .map(String::as_str)
        .chain(
            context
                .vocabulary
                .iter()
                .map(|entry| entry.source_name.as_str())
                .filter(|name| text.contains(name)),
        )
        .filter(|name| !name.is_empty() && seen.insert(*name))
        .map(str::to_string)
        .collect()
}

/// Proposed names that contradict established translations, in strict mode
#[derive(Debug, Error)]
#[error("Conflicting entity mappings: {}", describe_conflicts(.0))]
struct RejectedConflicts(Vec<EntityConflict>);

fn describe_conflicts(conflicts: &[EntityConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} ('{}', established '{}')", c.source_name, c.proposed, c.established))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Warning stored with the chapter when names are missing or contradict the registry
pub fn validation_warning(missing: &[String], conflicts: &[EntityConflict]) -> Option<String> {
    let mut parts = Vec::new();
    if !missing.is_empty() {
        parts.push(format!(
            "Missing translations for {} entities: {}",
            missing.len(),
            missing.join(", ")
        ));
    }
    if !conflicts.is_empty() {
        parts.push(format!(
            "Conflicting translations for {} entities: {}",
            conflicts.len(),
            describe_conflicts(conflicts)
        ));
    }
    (!parts.is_empty()).then(|| parts.join("; "))
}

/// Translates source chapters and stores the results
#[derive(Debug, Clone)]
pub struct ChapterTranslator {
    repo: Repository,
    registry: Arc<EntityRegistry>,
    context_builder: ContextBuilder,
    providers: Arc<ProviderRegistry>,
    budget: Arc<RequestBudget>,
    provider_name: Option<String>,
    temperature: f32,
    max_tokens: u32,
    strict_entity_validation: bool,
    override_entity_translations: bool,
    error_detail_max_chars: usize,
}

impl ChapterTranslator {
    pub fn new(
        registry: Arc<EntityRegistry>,
        providers: Arc<ProviderRegistry>,
        budget: Arc<RequestBudget>,
    ) -> Self {
        let repo = registry.repository().clone();
        Self {
            context_builder: ContextBuilder::new(repo.clone()),
            repo,
            registry,
            providers,
            budget,
            provider_name: None,
            temperature: 0.3,
            max_tokens: 8192,
            strict_entity_validation: false,
            override_entity_translations: false,
            error_detail_max_chars: DEFAULT_DIAGNOSTIC_CHARS,
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<EntityRegistry>,
        providers: Arc<ProviderRegistry>,
        budget: Arc<RequestBudget>,
    ) -> Self {
        let context_builder = ContextBuilder::from_config(config, registry.repository().clone());
        Self {
            context_builder,
            temperature: config.translation.common.temperature,
            max_tokens: config.translation.common.max_tokens,
            strict_entity_validation: config.pipeline.strict_entity_validation,
            override_entity_translations: config.pipeline.override_entity_translations,
            error_detail_max_chars: config.pipeline.error_detail_max_chars,
            ..Self::new(registry, providers, budget)
        }
    }

    /// Use a specific registered provider instead of the default
    pub fn with_provider(mut self, name: impl Into<String>) -> Self {
        self.provider_name = Some(name.into());
        self
    }

    /// Fail instead of warning when an expected name has no mapping
    pub fn with_strict_entity_validation(mut self, strict: bool) -> Self {
        self.strict_entity_validation = strict;
        self
    }

    /// Let new mappings replace established non-manual translations
    pub fn with_override_entity_translations(mut self, override_existing: bool) -> Self {
        self.override_entity_translations = override_existing;
        self
    }

    pub fn with_context_builder(mut self, builder: ContextBuilder) -> Self {
        self.context_builder = builder;
        self
    }

    /// Translate source chapter `chapter_id` into `target_language`
    pub async fn translate_chapter(
        &self,
        chapter_id: i64,
        target_language: &str,
    ) -> Result<TranslationOutcome, PipelineError> {
        let max_chars = self.error_detail_max_chars;
        let target_language = language_utils::normalize_to_part1_or_part2t(target_language)
            .map_err(|e| PipelineError::InvalidRequest(e.to_string()))?;

        let chapter = self.source_chapter(chapter_id).await?;
        let work = self
            .repo
            .get_work(chapter.work_id)
            .await?
            .ok_or_else(|| PipelineError::InvalidRequest(format!("Work {} not found", chapter.work_id)))?;
        if language_utils::language_codes_match(&work.source_language, &target_language) {
            return Err(PipelineError::InvalidRequest(format!(
                "Chapter {} is already in {}",
                chapter_id, target_language
            )));
        }

        let context = self
            .context_builder
            .build(chapter.work_id, chapter.number, &target_language)
            .await?;
        let extracted = self
            .repo
            .get_chapter_context(chapter.id)
            .await?
            .map(|ctx| [ctx.characters, ctx.places, ctx.terms].concat())
            .unwrap_or_default();

        let (system_prompt, user_prompt) = TranslationPromptBuilder::new(
            &language_utils::prompt_language_name(&work.source_language),
            &language_utils::prompt_language_name(&target_language),
        )
        .with_context(&context)
        .with_chapter(&chapter.title, &chapter.content)
        .build()
        .map_err(|e| PipelineError::InvalidRequest(format!("{:#}", e)))?;
        let request = CompletionRequest::new()
            .system(system_prompt)
            .user(user_prompt)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens);
        let rendered = request.render();

        let provider = match &self.provider_name {
            Some(name) => self.providers.get(name),
            None => self.providers.default_provider(),
        }
        .map_err(|source| PipelineError::Provider {
            source,
            diagnostics: Diagnostics::new(&rendered, None, max_chars),
        })?;

        debug!(
            "Translating chapter {} ({} → {}) with {}",
            chapter.number,
            work.source_language,
            target_language,
            provider.name()
        );
        let response = self
            .budget
            .call(provider.as_ref(), request)
            .await
            .map_err(|source| PipelineError::Provider {
                source,
                diagnostics: Diagnostics::new(&rendered, None, max_chars),
            })?;
        let diagnostics = || Diagnostics::new(&rendered, Some(&response.content), max_chars);

        let parsed = parse_translation(&response.content).map_err(|fault| {
            warn!("Translation of chapter {} rejected: {:?}", chapter_id, fault);
            fault.into_error(diagnostics())
        })?;

        let expected = expected_entities(&extracted, &context, &chapter.content);
        let missing: Vec<String> = expected
            .into_iter()
            .filter(|name| !parsed.entity_mappings.contains_key(name))
            .collect();

        if !missing.is_empty() && self.strict_entity_validation {
            return Err(PipelineError::Validation {
                message: format!("Missing entity mappings: {}", missing.join(", ")),
                diagnostics: diagnostics(),
            });
        }

        let title = parsed
            .title
            .clone()
            .or_else(|| (!chapter.slot_title.is_empty()).then(|| chapter.slot_title.clone()))
            .unwrap_or_else(|| chapter.title.clone());
        let mut input = TranslatedChapterInput {
            work_id: chapter.work_id,
            slot_id: chapter.slot_id,
            language: target_language.clone(),
            title,
            content: parsed.content.clone(),
            summary: parsed.summary.clone(),
            entity_validation_warning: None,
            missing_entities: missing.clone(),
        };

        // Conflicts are only known once the registry row is read under the work lock
        let (target_chapter_id, merge, warning) = {
            let _guard = self.registry.lock_work(chapter.work_id).await;
            let work_id = chapter.work_id;
            let language = target_language.clone();
            let mappings = parsed.entity_mappings.clone();
            let override_existing = self.override_entity_translations;
            let strict = self.strict_entity_validation;
            self.repo
                .db()
                .transaction_async(move |tx| {
                    let merge = merge_translations_in(tx, work_id, &language, &mappings, override_existing)?;
                    if strict && !merge.conflicts.is_empty() {
                        return Err(RejectedConflicts(merge.conflicts).into());
                    }
                    let warning = validation_warning(&input.missing_entities, &merge.conflicts);
                    input.entity_validation_warning = warning.clone();
                    let target_id = Repository::upsert_translated_chapter_sync(tx, &input)?;
                    Ok((target_id, merge, warning))
                })
                .await
                .map_err(|source| match source.downcast::<RejectedConflicts>() {
                    Ok(rejected) => PipelineError::Validation {
                        message: rejected.to_string(),
                        diagnostics: diagnostics(),
                    },
                    Err(source) => PipelineError::Storage {
                        source,
                        diagnostics: Some(diagnostics()),
                    },
                })?
        };

        if let Some(warning) = &warning {
            warn!("Chapter {} ({}): {}", chapter.number, target_language, warning);
        }
        info!(
            "Stored chapter {} in {} ({} new names, {} missing, {} conflicting)",
            chapter.number,
            target_language,
            merge.inserted,
            missing.len(),
            merge.conflicts.len()
        );

        Ok(TranslationOutcome {
            source_chapter_id: chapter.id,
            target_chapter_id,
            work_id: chapter.work_id,
            chapter_number: chapter.number,
            language: target_language,
            missing_entities: missing,
            conflicting_entities: merge.conflicts.clone(),
            merge,
            usage: response.usage,
        })
    }

    async fn source_chapter(&self, chapter_id: i64) -> Result<ChapterRecord, PipelineError> {
        let chapter = self
            .repo
            .get_chapter(chapter_id)
            .await?
            .ok_or_else(|| PipelineError::InvalidRequest(format!("Chapter {} not found", chapter_id)))?;
        if !chapter.is_source {
            return Err(PipelineError::InvalidRequest(format!(
                "Chapter {} is not a source chapter",
                chapter_id
            )));
        }
        Ok(chapter)
    }
}
