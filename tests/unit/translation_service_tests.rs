/*!
 * Tests for the chapter translation service
 */

use std::collections::BTreeMap;

use namesake::database::models::ChapterRecord;
use namesake::errors::{PipelineError, ProviderError};
use namesake::providers::mock::{last_user_message, MockProvider, MockReply};

use crate::common::{pipeline, save_context, seed_work, story_provider, translation_reply, TestPipeline};

/// Two chapters with contexts, a rebuilt registry and "李伟 → Li Wei" established
async fn prepared(provider: MockProvider) -> (TestPipeline, Vec<ChapterRecord>) {
    let p = pipeline(provider);
    let (work, chapters) = seed_work(&p.repo, &["李伟拜入天元宗。", "李伟回到天元宗，开始筑基。"])
        .await
        .unwrap();
    save_context(&p.repo, &chapters[0], &["李伟"], &["天元宗"], &[], "李伟入门").await.unwrap();
    save_context(&p.repo, &chapters[1], &["李伟"], &["天元宗"], &["筑基"], "李伟筑基").await.unwrap();
    p.registry.rebuild(work.id).await.unwrap();
    let established: BTreeMap<String, String> = [("李伟".to_string(), "Li Wei".to_string())].into();
    p.registry.merge_translations(work.id, "en", &established, false).await.unwrap();
    (p, chapters)
}

/// The prompt carries established names and the result is stored with its mappings
#[tokio::test]
async fn test_translateChapter_shouldUseAndExtendVocabulary() {
    let (p, chapters) = prepared(story_provider()).await;

    let outcome = p.translator.translate_chapter(chapters[1].id, "en").await.unwrap();

    let prompt = last_user_message(&p.provider.requests()[0]);
    assert!(prompt.contains("李伟 → Li Wei"), "prompt was: {}", prompt);
    assert_eq!(outcome.language, "en");
    assert_eq!(outcome.chapter_number, 2);
    assert!(outcome.missing_entities.is_empty());
    assert!(outcome.conflicting_entities.is_empty());
    assert_eq!(outcome.merge.inserted, 2);

    let stored = p
        .repo
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.id, outcome.target_chapter_id);
    assert!(!stored.is_source);
    assert_eq!(stored.title, "Chapter: 第2章");
    assert!(stored.content.contains("Li Wei") && stored.content.contains("Tianyuan Sect"));
    assert_eq!(stored.summary.as_deref(), Some("Summary of 第2章"));
    assert!(stored.entity_validation_warning.is_none());

    let views = p.repo.entity_views(outcome.work_id, "en", None).await.unwrap();
    let sect = views.iter().find(|v| v.source_name == "天元宗").unwrap();
    assert_eq!(sect.translated_name.as_deref(), Some("Tianyuan Sect"));
}

/// A name the response forgot to map is recorded but does not block the chapter
#[tokio::test]
async fn test_translateChapter_withOmittedName_shouldStoreWarning() {
    let reply = translation_reply(
        "Return",
        "Li Wei returned to the Tianyuan Sect.",
        &[("天元宗", "Tianyuan Sect"), ("筑基", "Foundation Establishment")],
        "Li Wei returns",
    );
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(reply)])).await;

    let outcome = p.translator.translate_chapter(chapters[1].id, "en").await.unwrap();

    assert_eq!(outcome.missing_entities, vec!["李伟".to_string()]);
    let stored = p
        .repo
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.missing_entities, vec!["李伟".to_string()]);
    let warning = stored.entity_validation_warning.unwrap();
    assert!(warning.contains("李伟"));
    assert!(warning.starts_with("Missing translations for 1 entities"));
}

/// Strict validation turns an omission into a failure and stores nothing
#[tokio::test]
async fn test_translateChapter_strictWithOmittedName_shouldFail() {
    let reply = translation_reply("Return", "Li Wei returned.", &[], "");
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(reply)])).await;
    let translator = p.translator.clone().with_strict_entity_validation(true);

    let err = translator.translate_chapter(chapters[1].id, "en").await.unwrap_err();

    assert!(matches!(err, PipelineError::Validation { .. }));
    assert!(err.to_string().contains("李伟"));
    assert!(p
        .repo
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .is_none());
}

/// Replies that are not JSON fail with the raw reply kept for diagnosis
#[tokio::test]
async fn test_translateChapter_withMalformedReply_shouldFailWithoutWriting() {
    let raw = "Sorry, I cannot produce JSON today.";
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(raw.to_string())])).await;

    let err = p.translator.translate_chapter(chapters[1].id, "en").await.unwrap_err();

    assert!(matches!(err, PipelineError::ResponseParsing { .. }));
    let diagnostics = err.diagnostics().unwrap();
    assert_eq!(diagnostics.raw_response.as_deref(), Some(raw));
    assert!(diagnostics.prompt.contains("李伟"));
    assert!(p
        .repo
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .is_none());
}

/// JSON with empty content is rejected
#[tokio::test]
async fn test_translateChapter_withEmptyContent_shouldFailValidation() {
    let reply = translation_reply("Title", "   ", &[("李伟", "Li Wei")], "");
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(reply)])).await;

    let err = p.translator.translate_chapter(chapters[0].id, "en").await.unwrap_err();

    assert!(matches!(err, PipelineError::Validation { .. }));
}

/// A different translation for an established name is reported, not applied
#[tokio::test]
async fn test_translateChapter_withConflictingName_shouldKeepEstablished() {
    let reply = translation_reply(
        "Return",
        "Lee Way returned to the Tianyuan Sect.",
        &[("李伟", "Lee Way"), ("天元宗", "Tianyuan Sect"), ("筑基", "Foundation Establishment")],
        "",
    );
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(reply)])).await;

    let outcome = p.translator.translate_chapter(chapters[1].id, "en").await.unwrap();

    assert_eq!(outcome.conflicting_entities.len(), 1);
    let conflict = &outcome.conflicting_entities[0];
    assert_eq!(
        (conflict.source_name.as_str(), conflict.established.as_str(), conflict.proposed.as_str()),
        ("李伟", "Li Wei", "Lee Way")
    );
    let views = p.repo.entity_views(outcome.work_id, "en", None).await.unwrap();
    let li = views.iter().find(|v| v.source_name == "李伟").unwrap();
    assert_eq!(li.translated_name.as_deref(), Some("Li Wei"));

    let stored = p
        .repo
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .unwrap();
    let warning = stored.entity_validation_warning.unwrap();
    assert!(warning.starts_with("Conflicting translations for 1 entities"), "{}", warning);
    assert!(warning.contains("李伟") && warning.contains("Lee Way") && warning.contains("Li Wei"));
}

/// Strict validation refuses a conflicting name and stores nothing
#[tokio::test]
async fn test_translateChapter_withConflictingNameAndStrict_shouldRejectAndStoreNothing() {
    let reply = translation_reply(
        "Return",
        "Lee Way returned to the Tianyuan Sect.",
        &[("李伟", "Lee Way"), ("天元宗", "Tianyuan Sect"), ("筑基", "Foundation Establishment")],
        "",
    );
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(reply)])).await;
    let translator = p.translator.with_strict_entity_validation(true);

    let err = translator.translate_chapter(chapters[1].id, "en").await.unwrap_err();

    match err {
        PipelineError::Validation { message, diagnostics } => {
            assert!(message.contains("李伟"), "{}", message);
            assert!(diagnostics.raw_response.is_some());
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(p
        .repo
        .get_chapter_in_language(chapters[1].slot_id, "en")
        .await
        .unwrap()
        .is_none());
    let views = p.repo.entity_views(chapters[1].work_id, "en", None).await.unwrap();
    let sect = views.iter().find(|v| v.source_name == "天元宗").unwrap();
    assert!(sect.translated_name.is_none());
}

/// A missing title falls back to the source chapter title
#[tokio::test]
async fn test_translateChapter_withoutTitle_shouldFallBackToSourceTitle() {
    let reply = r#"{"content": "Li Wei joined the Tianyuan Sect.", "entity_mappings": [{"source": "李伟", "target": "Li Wei"}, {"source": "天元宗", "target": "Tianyuan Sect"}]}"#;
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Text(reply.to_string())])).await;

    let outcome = p.translator.translate_chapter(chapters[0].id, "en").await.unwrap();

    assert!(outcome.missing_entities.is_empty());
    let stored = p
        .repo
        .get_chapter_in_language(chapters[0].slot_id, "en")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.title, "第1章");
    assert!(stored.summary.is_none());
}

/// Provider failures keep their classification
#[tokio::test]
async fn test_translateChapter_withProviderFailure_shouldReturnProviderError() {
    let (p, chapters) = prepared(MockProvider::scripted(vec![MockReply::Error(ProviderError::from_status(
        503, "overloaded",
    ))]))
    .await;

    let err = p.translator.translate_chapter(chapters[0].id, "en").await.unwrap_err();

    match err {
        PipelineError::Provider { source, diagnostics } => {
            assert!(source.is_transient());
            assert!(diagnostics.raw_response.is_none());
            assert!(!diagnostics.prompt.is_empty());
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

/// Translating into the source language or from a translated chapter is refused
#[tokio::test]
async fn test_translateChapter_withInvalidTarget_shouldRejectRequest() {
    let (p, chapters) = prepared(story_provider()).await;

    let same = p.translator.translate_chapter(chapters[0].id, "zho").await.unwrap_err();
    assert!(matches!(same, PipelineError::InvalidRequest(_)));

    let unparseable = p.translator.translate_chapter(chapters[0].id, "klingon").await.unwrap_err();
    assert!(matches!(unparseable, PipelineError::InvalidRequest(_)));

    let outcome = p.translator.translate_chapter(chapters[0].id, "en").await.unwrap();
    let from_translation = p
        .translator
        .translate_chapter(outcome.target_chapter_id, "fr")
        .await
        .unwrap_err();
    assert!(matches!(from_translation, PipelineError::InvalidRequest(ref m) if m.contains("not a source chapter")));

    let unknown = p.translator.translate_chapter(9999, "en").await.unwrap_err();
    assert!(matches!(unknown, PipelineError::InvalidRequest(ref m) if m.contains("not found")));
    assert_eq!(p.provider.request_count(), 1);
}
