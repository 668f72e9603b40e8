/*!
 * End-to-end pipeline tests: extraction, registry, translation
 */

use namesake::database::models::{JobKind, JobStatus};
use namesake::providers::mock::last_user_message;

use crate::common::{is_extraction, pipeline, seed_work, story_provider, user_payload};

/// Names established by chapter 1 reach the prompt of chapter 2
#[tokio::test]
async fn test_pipeline_shouldCarryNamesAcrossChapters() {
    let mut p = pipeline(story_provider());
    p.runner = p.runner.clone().with_worker_count(1);
    let (work, chapters) = seed_work(
        &p.repo,
        &["李伟拜入天元宗，结识王芳。", "李伟闭关，终于筑基。"],
    )
    .await
    .unwrap();
    let runner = &p.runner;

    runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();
    assert_eq!(runner.process_batch(10).await.unwrap().succeeded, 1);
    runner.enqueue(JobKind::Extraction, chapters[1].id, None).await.unwrap();
    assert_eq!(runner.process_batch(10).await.unwrap().succeeded, 2);
    assert_eq!(runner.process_batch(10).await.unwrap().succeeded, 1);

    let requests: Vec<_> = p.provider.requests().into_iter().filter(|r| !is_extraction(r)).collect();
    assert_eq!(requests.len(), 2);
    let first = user_payload(&requests[0]);
    assert_eq!(first["chapter"]["title"], "第1章");
    let second_prompt = last_user_message(&requests[1]);
    assert!(second_prompt.contains("李伟 → Li Wei"), "prompt was: {}", second_prompt);
    assert!(second_prompt.contains("Summary of 第1章"));

    for chapter in &chapters {
        let translated = p
            .repo
            .get_chapter_in_language(chapter.slot_id, "en")
            .await
            .unwrap()
            .unwrap();
        assert!(translated.content.contains("Li Wei"));
        assert!(translated.missing_entities.is_empty());
    }

    let views = p.repo.entity_views(work.id, "en", None).await.unwrap();
    assert_eq!(views.len(), 4);
    assert!(views.iter().all(|v| v.translated_name.is_some()));
    let stats = p.repo.job_stats().await.unwrap();
    assert_eq!((stats.done, stats.dead), (4, 0));
}

/// Editing a chapter re-runs extraction and the registry follows the new text
#[tokio::test]
async fn test_pipeline_afterChapterEdit_shouldReextractAndPruneRegistry() {
    let p = pipeline(story_provider());
    let (work, _) = seed_work(&p.repo, &["李伟拜入天元宗。", "王芳下山。"]).await.unwrap();
    p.runner.enqueue_stale_extractions(work.id).await.unwrap();
    p.runner.process_batch(10).await.unwrap();
    assert_eq!(p.repo.list_entities(work.id).await.unwrap().len(), 3);

    let edited = p.repo.add_source_chapter(work.id, 2, "第2章", "李伟下山。").await.unwrap();
    let stale = p.runner.enqueue_stale_extractions(work.id).await.unwrap();
    assert_eq!(stale.len(), 1);
    p.runner.process_batch(10).await.unwrap();

    let entities = p.repo.list_entities(work.id).await.unwrap();
    let names: Vec<&str> = entities.iter().map(|e| e.source_name.as_str()).collect();
    assert_eq!(names.len(), 2);
    assert!(!names.contains(&"王芳"));
    let context = p.repo.get_chapter_context(edited.id).await.unwrap().unwrap();
    assert_eq!(context.source_hash, edited.content_hash);
}

/// A hand-set translation wins over whatever the model proposes
#[tokio::test]
async fn test_pipeline_withManualTranslation_shouldKeepIt() {
    let p = pipeline(story_provider());
    let (work, chapters) = seed_work(&p.repo, &["李伟拜入天元宗。"]).await.unwrap();
    p.runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();
    p.runner.process_batch(10).await.unwrap();
    p.repo.set_entity_translation(work.id, "李伟", "en", "Wei Li", true).await.unwrap();

    let report = p.runner.process_batch(10).await.unwrap();
    assert_eq!(report.succeeded, 1);

    let prompt = last_user_message(p.provider.requests().last().unwrap());
    assert!(prompt.contains("李伟 → Wei Li"));
    let views = p.repo.entity_views(work.id, "en", None).await.unwrap();
    let li = views.iter().find(|v| v.source_name == "李伟").unwrap();
    assert_eq!(li.translated_name.as_deref(), Some("Wei Li"));
    assert!(li.is_manual);
    assert_eq!(p.repo.list_jobs(Some(JobStatus::Done)).await.unwrap().len(), 2);
}
