/*!
 * Tests for the job runner: enqueueing, claiming, retries and hooks
 */

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use namesake::database::models::{now_timestamp, ChapterRecord, JobKind, JobStatus};
use namesake::database::Repository;
use namesake::errors::ProviderError;
use namesake::jobs::{ChapterHook, ChapterTranslated};
use namesake::providers::mock::{MockProvider, MockReply};

use crate::common::{extraction_reply, is_extraction, pipeline, seed_work, story_provider, TestPipeline};

/// Hook that remembers every event it receives
#[derive(Debug, Default)]
struct RecordingHook {
    events: Mutex<Vec<ChapterTranslated>>,
}

#[async_trait]
impl ChapterHook for RecordingHook {
    async fn chapter_translated(&self, event: &ChapterTranslated) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Hook that always fails
#[derive(Debug)]
struct BrokenHook;

#[async_trait]
impl ChapterHook for BrokenHook {
    async fn chapter_translated(&self, _event: &ChapterTranslated) -> Result<()> {
        Err(anyhow::anyhow!("search index offline"))
    }
}

/// Run one batch and check `job_id` was buried without a retry or a model call
async fn assert_rejected_on_first_attempt(p: &TestPipeline, job_id: &str, message: &str) {
    let requests_before = p.provider.request_count();

    let report = p.runner.process_batch(10).await.unwrap();

    assert_eq!((report.attempted, report.dead, report.failed), (1, 1, 0));
    let stored = p.repo.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.parse_failures, 0);
    let error: serde_json::Value = serde_json::from_str(&stored.last_error.unwrap()).unwrap();
    assert_eq!(error["kind"], "invalid_request");
    assert!(error["message"].as_str().unwrap().contains(message), "{}", error["message"]);
    assert_eq!(p.provider.request_count(), requests_before);
    assert_eq!(p.runner.process_batch(10).await.unwrap().attempted, 0);
}

/// Run `sql` with foreign keys off, leaving rows that point at nothing
async fn orphan(repo: &Repository, sql: &'static str, id: i64) {
    repo.db()
        .execute_async(move |conn| {
            conn.execute_batch("PRAGMA foreign_keys=OFF;")?;
            conn.execute(sql, [id])?;
            conn.execute_batch("PRAGMA foreign_keys=ON;")?;
            Ok(())
        })
        .await
        .unwrap();
}

/// A work with source chapters only, so extraction enqueues no translations
async fn untranslated_work(repo: &Repository, count: usize) -> Vec<ChapterRecord> {
    let work = repo.create_work("孤本", "zh").await.unwrap();
    let mut chapters = Vec::new();
    for number in 1..=count as i64 {
        chapters.push(
            repo.add_source_chapter(work.id, number, &format!("第{}章", number), "李伟拜入天元宗。")
                .await
                .unwrap(),
        );
    }
    chapters
}

/// Enqueueing the same target twice returns the active job
#[tokio::test]
async fn test_enqueue_withActiveJob_shouldDeduplicate() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 1).await;

    let first = p.runner.enqueue(JobKind::Translation, chapters[0].id, Some("en")).await.unwrap();
    let again = p.runner.enqueue(JobKind::Translation, chapters[0].id, Some("eng")).await.unwrap();
    let other = p.runner.enqueue(JobKind::Translation, chapters[0].id, Some("fr")).await.unwrap();

    assert!(first.created);
    assert!(!again.created);
    assert_eq!(first.job_id, again.job_id);
    assert!(other.created);
    assert_eq!(p.repo.list_jobs(Some(JobStatus::Pending)).await.unwrap().len(), 2);
}

/// A second request while the first job is running joins it; the model is called once
#[tokio::test]
async fn test_enqueue_whileJobInProgress_shouldReturnRunningJob() {
    let p = pipeline(story_provider());
    let (_, chapters) = seed_work(&p.repo, &["李伟拜入天元宗。"]).await.unwrap();
    let first = p.runner.enqueue(JobKind::Translation, chapters[0].id, Some("en")).await.unwrap();
    assert!(p.repo.claim_job(&first.job_id, "other-runner", &now_timestamp()).await.unwrap());
    let running = p.repo.get_job(&first.job_id).await.unwrap().unwrap();
    assert_eq!(running.status, JobStatus::InProgress);

    let again = p.runner.enqueue(JobKind::Translation, chapters[0].id, Some("en")).await.unwrap();

    assert!(!again.created);
    assert_eq!(again.job_id, first.job_id);
    assert_eq!(p.runner.process_batch(10).await.unwrap().attempted, 0);

    let job_id = first.job_id.clone();
    p.repo
        .db()
        .execute_async(move |conn| {
            conn.execute(
                "UPDATE jobs SET claimed_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                [job_id],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    let runner = p.runner.clone().with_stale_after(Duration::from_secs(60));
    while runner.process_batch(10).await.unwrap().attempted > 0 {}

    assert_eq!(p.provider.request_count(), 1);
    let jobs = p.repo.list_jobs(None).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Done);
}

/// Translation jobs without a language are rejected at enqueue time
#[tokio::test]
async fn test_enqueue_translationWithoutLanguage_shouldFail() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 1).await;

    assert!(p.runner.enqueue(JobKind::Translation, chapters[0].id, None).await.is_err());
}

/// Overlapping batches never run the same job twice
#[tokio::test]
async fn test_processBatch_concurrentRunners_shouldRunEachJobOnce() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 4).await;
    for chapter in &chapters {
        p.runner.enqueue(JobKind::Extraction, chapter.id, None).await.unwrap();
    }
    let other = p.runner.clone();

    let (a, b) = tokio::join!(p.runner.process_batch(10), other.process_batch(10));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(p.provider.request_count(), 4);
    assert_eq!(p.repo.list_jobs(Some(JobStatus::Done)).await.unwrap().len(), 4);
    assert_eq!(a.attempted - a.skipped + b.attempted - b.skipped, 4);
}

/// Transient failures are retried until attempts run out
#[tokio::test]
async fn test_processBatch_transientFailure_shouldRetryThenDie() {
    let p = pipeline(MockProvider::failing());
    let runner = p.runner.clone().with_max_attempts(2);
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();

    let first = runner.process_batch(10).await.unwrap();
    assert_eq!((first.attempted, first.failed), (1, 1));
    let stored = p.repo.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempts, 1);
    assert!(stored.last_error.unwrap().contains("provider_transient"));

    let second = runner.process_batch(10).await.unwrap();
    assert_eq!(second.dead, 1);
    let stored = p.repo.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert_eq!(stored.attempts, 2);

    let third = runner.process_batch(10).await.unwrap();
    assert_eq!(third.attempted, 0);
    assert_eq!(p.provider.request_count(), 2);
}

/// Permanent provider failures are not retried
#[tokio::test]
async fn test_processBatch_permanentFailure_shouldDieImmediately() {
    let p = pipeline(MockProvider::scripted(vec![MockReply::Error(ProviderError::from_status(
        401, "invalid key",
    ))]));
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = p.runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();

    let report = p.runner.process_batch(10).await.unwrap();

    assert_eq!(report.dead, 1);
    let stored = p.repo.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert!(stored.last_error.unwrap().contains("provider_permanent"));
}

/// Unparseable output gets exactly one more try
#[tokio::test]
async fn test_processBatch_parseFailure_shouldRetryOnce() {
    let p = pipeline(MockProvider::working(|_| Ok("no structure here".to_string())));
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = p.runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();

    let first = p.runner.process_batch(10).await.unwrap();
    assert_eq!(first.failed, 1);
    let second = p.runner.process_batch(10).await.unwrap();
    assert_eq!(second.dead, 1);

    let stored = p.repo.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Dead);
    assert_eq!(stored.parse_failures, 1);
    assert_eq!(stored.attempts, 2);
    let error: serde_json::Value = serde_json::from_str(&stored.last_error.unwrap()).unwrap();
    assert_eq!(error["kind"], "response_parsing");
    assert_eq!(error["raw_response"], "no structure here");
}

/// A retried parse failure can still succeed
#[tokio::test]
async fn test_processBatch_parseFailureThenValid_shouldSucceed() {
    let p = pipeline(MockProvider::scripted(vec![
        MockReply::Text("garbage".to_string()),
        MockReply::Text(extraction_reply(&["李伟"], &["天元宗"], &[], "李伟入门")),
    ]));
    let chapters = untranslated_work(&p.repo, 1).await;
    p.runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();

    assert_eq!(p.runner.process_batch(10).await.unwrap().failed, 1);
    assert_eq!(p.runner.process_batch(10).await.unwrap().succeeded, 1);

    let context = p.repo.get_chapter_context(chapters[0].id).await.unwrap().unwrap();
    assert_eq!(context.characters, vec!["李伟"]);
    assert_eq!(context.source_hash, chapters[0].content_hash);
    assert_eq!(p.repo.list_entities(chapters[0].work_id).await.unwrap().len(), 2);
}

/// Extraction feeds the registry and queues translations; hooks see each stored chapter
#[tokio::test]
async fn test_processBatch_extractionThenTranslation_shouldCallHooks() {
    let p = pipeline(story_provider());
    let hook = Arc::new(RecordingHook::default());
    let runner = p.runner.clone().with_hook(hook.clone()).with_hook(Arc::new(BrokenHook));
    let (work, _) = seed_work(&p.repo, &["李伟拜入天元宗。", "王芳开始筑基。"]).await.unwrap();

    let queued = runner.enqueue_stale_extractions(work.id).await.unwrap();
    assert_eq!(queued.len(), 2);

    let extraction = runner.process_batch(10).await.unwrap();
    assert_eq!(extraction.succeeded, 2);
    assert_eq!(p.repo.list_entities(work.id).await.unwrap().len(), 4);
    assert!(runner.enqueue_stale_extractions(work.id).await.unwrap().is_empty());

    let translation = runner.process_batch(10).await.unwrap();
    assert_eq!(translation.succeeded, 2);

    let events = hook.events.lock().clone();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.language == "en" && e.work_id == work.id));
    let mut numbers: Vec<i64> = events.iter().map(|e| e.chapter_number).collect();
    numbers.sort();
    assert_eq!(numbers, vec![1, 2]);
}

/// Work-wide enqueueing covers editions and extra languages, never the source
#[tokio::test]
async fn test_enqueueTranslationsForWork_shouldTargetEveryLanguage() {
    let p = pipeline(story_provider());
    let runner = p.runner.clone().with_auto_translate_languages(vec!["de".to_string()]);
    let (work, _) = seed_work(&p.repo, &["一", "二"]).await.unwrap();

    let outcomes = runner
        .enqueue_translations_for_work(work.id, &["fra".to_string(), "chi".to_string(), "??".to_string()])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 6);
    let mut languages: Vec<String> = p
        .repo
        .list_jobs(None)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|job| job.target_language)
        .collect();
    languages.sort();
    languages.dedup();
    assert_eq!(languages, vec!["de", "en", "fr"]);
}

/// Jobs whose claim expired are released and run again
#[tokio::test]
async fn test_processBatch_withStaleClaim_shouldRecoverJob() {
    let p = pipeline(story_provider());
    let runner = p.runner.clone().with_stale_after(Duration::from_secs(60));
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();

    assert!(p.repo.claim_job(&job.job_id, "crashed-runner", &now_timestamp()).await.unwrap());
    let job_id = job.job_id.clone();
    p.repo
        .db()
        .execute_async(move |conn| {
            conn.execute(
                "UPDATE jobs SET claimed_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                [job_id],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    let report = runner.process_batch(10).await.unwrap();

    assert_eq!(report.succeeded, 1);
    let stored = p.repo.get_job(&job.job_id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Done);
    assert_eq!(stored.attempts, 2);
}

/// The scheduler drains the queue and stops when asked
#[tokio::test]
async fn test_runScheduled_shouldProcessUntilShutdown() {
    let p = pipeline(story_provider());
    let (work, _) = seed_work(&p.repo, &["李伟拜入天元宗。"]).await.unwrap();
    p.runner.enqueue_stale_extractions(work.id).await.unwrap();

    p.runner
        .run_scheduled(
            Duration::from_millis(20),
            10,
            tokio::time::sleep(Duration::from_millis(500)),
        )
        .await
        .unwrap();

    let stats = p.repo.job_stats().await.unwrap();
    assert_eq!(stats.done, 2);
    assert_eq!(stats.pending + stats.failed + stats.in_progress, 0);
    let requests = p.provider.requests();
    assert_eq!(requests.iter().filter(|r| is_extraction(r)).count(), 1);
}

/// Translating a chapter that is itself a translation can never succeed
#[tokio::test]
async fn test_processBatch_translationOfTranslatedChapter_shouldDieOnFirstAttempt() {
    let p = pipeline(story_provider());
    let (_, chapters) = seed_work(&p.repo, &["李伟拜入天元宗。"]).await.unwrap();
    let translated = p.translator.translate_chapter(chapters[0].id, "en").await.unwrap();
    let job = p
        .runner
        .enqueue(JobKind::Translation, translated.target_chapter_id, Some("fr"))
        .await
        .unwrap();

    assert_rejected_on_first_attempt(&p, &job.job_id, "not a source chapter").await;
}

/// A translation job stored without a language is buried, not retried
#[tokio::test]
async fn test_processBatch_translationWithoutLanguage_shouldDieOnFirstAttempt() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 1).await;
    let chapter_id = chapters[0].id;
    p.repo
        .db()
        .execute_async(move |conn| {
            conn.execute(
                "INSERT INTO jobs (id, kind, chapter_id, target_language, status, max_attempts,
                                   next_run_at, created_at, updated_at)
                 VALUES ('no-language', 'translation', ?1, '', 'pending', 3,
                         '2000-01-01T00:00:00.000Z', '2000-01-01T00:00:00.000Z', '2000-01-01T00:00:00.000Z')",
                [chapter_id],
            )?;
            Ok(())
        })
        .await
        .unwrap();

    assert_rejected_on_first_attempt(&p, "no-language", "no target language").await;
}

/// Translating into the work's own language is buried, not retried
#[tokio::test]
async fn test_processBatch_translationIntoSourceLanguage_shouldDieOnFirstAttempt() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = p.runner.enqueue(JobKind::Translation, chapters[0].id, Some("zho")).await.unwrap();

    assert_rejected_on_first_attempt(&p, &job.job_id, "already in zh").await;
}

/// A job whose chapter was removed is buried, not retried
#[tokio::test]
async fn test_processBatch_withDeletedChapter_shouldDieOnFirstAttempt() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = p.runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();
    orphan(&p.repo, "DELETE FROM chapters WHERE id = ?1", chapters[0].id).await;

    assert_rejected_on_first_attempt(&p, &job.job_id, "not found").await;
}

/// A job whose work was removed is buried, not retried
#[tokio::test]
async fn test_processBatch_withDeletedWork_shouldDieOnFirstAttempt() {
    let p = pipeline(story_provider());
    let chapters = untranslated_work(&p.repo, 1).await;
    let job = p.runner.enqueue(JobKind::Extraction, chapters[0].id, None).await.unwrap();
    orphan(&p.repo, "DELETE FROM works WHERE id = ?1", chapters[0].work_id).await;

    assert_rejected_on_first_attempt(&p, &job.job_id, "Work").await;
}
