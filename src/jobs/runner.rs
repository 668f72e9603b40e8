/*!
 * Job runner.
 *
 * Jobs live in the `jobs` table. A batch recovers expired claims, selects the
 * due jobs and runs up to `worker_count` of them at once. Each job is claimed
 * with a compare-and-set update first, so overlapping batches, scheduled or
 * manual, never run the same job or two jobs of one chapter together.
 */

use anyhow::{anyhow, Result};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::app_config::Config;
use crate::database::models::{
    now_timestamp, timestamp, ChapterContextRecord, ChapterRecord, EnqueueOutcome, JobKind, JobRecord,
};
use crate::database::Repository;
use crate::errors::PipelineError;
use crate::extraction::EntityExtractor;
use crate::jobs::hooks::{ChapterHook, ChapterTranslated};
use crate::jobs::retry::{is_parse_failure, Disposition, RetryPolicy};
use crate::language_utils;
use crate::registry::EntityRegistry;
use crate::translation::ChapterTranslator;

/// Counts for one `process_batch` call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    /// Jobs this batch tried to claim
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed and scheduled for another attempt
    pub failed: usize,
    pub dead: usize,
    /// Claim lost to another runner or to a running job of the same chapter
    pub skipped: usize,
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted: {}, succeeded: {}, failed: {}, dead: {}, skipped: {}",
            self.attempted, self.succeeded, self.failed, self.dead, self.skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobResult {
    Succeeded,
    Failed,
    Dead,
    Skipped,
}

/// Runs extraction and translation jobs
#[derive(Debug, Clone)]
pub struct JobRunner {
    repo: Repository,
    registry: Arc<EntityRegistry>,
    extractor: EntityExtractor,
    translator: ChapterTranslator,
    policy: RetryPolicy,
    hooks: Vec<Arc<dyn ChapterHook>>,
    worker_count: usize,
    max_attempts: u32,
    auto_translate_languages: Vec<String>,
    /// Claims older than this are considered abandoned
    stale_after: Duration,
}

impl JobRunner {
    pub fn new(registry: Arc<EntityRegistry>, extractor: EntityExtractor, translator: ChapterTranslator) -> Self {
        Self {
            repo: registry.repository().clone(),
            registry,
            extractor,
            translator,
            policy: RetryPolicy::default(),
            hooks: Vec::new(),
            worker_count: 4,
            max_attempts: 3,
            auto_translate_languages: Vec::new(),
            stale_after: Duration::from_secs(1800),
        }
    }

    pub fn from_config(
        config: &Config,
        registry: Arc<EntityRegistry>,
        extractor: EntityExtractor,
        translator: ChapterTranslator,
    ) -> Self {
        Self {
            policy: RetryPolicy::from_config(config),
            worker_count: config.pipeline.worker_count.max(1),
            max_attempts: config.pipeline.max_attempts.max(1),
            auto_translate_languages: config.pipeline.auto_translate_languages.clone(),
            stale_after: Duration::from_secs(config.pipeline.stale_job_secs),
            ..Self::new(registry, extractor, translator)
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Register a hook called after each committed translation
    pub fn with_hook(mut self, hook: Arc<dyn ChapterHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_auto_translate_languages(mut self, languages: Vec<String>) -> Self {
        self.auto_translate_languages = languages;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    // =========================================================================
    // Enqueueing
    // =========================================================================

    /// Enqueue one job; returns the existing job when an active one covers it
    pub async fn enqueue(
        &self,
        kind: JobKind,
        chapter_id: i64,
        target_language: Option<&str>,
    ) -> Result<EnqueueOutcome> {
        self.repo
            .enqueue_job(kind, chapter_id, target_language, self.max_attempts)
            .await
    }

    /// Enqueue extraction for source chapters without a current context
    pub async fn enqueue_stale_extractions(&self, work_id: i64) -> Result<Vec<EnqueueOutcome>> {
        let mut outcomes = Vec::new();
        for chapter_id in self.repo.chapters_needing_extraction(work_id).await? {
            outcomes.push(self.enqueue(JobKind::Extraction, chapter_id, None).await?);
        }
        let created = outcomes.iter().filter(|o| o.created).count();
        if created > 0 {
            info!("Enqueued {} extraction jobs for work {}", created, work_id);
        }
        Ok(outcomes)
    }

    /// Enqueue translation of every source chapter of a work
    ///
    /// Targets every non-source edition, the configured automatic languages
    /// and `extra_languages`.
    pub async fn enqueue_translations_for_work(
        &self,
        work_id: i64,
        extra_languages: &[String],
    ) -> Result<Vec<EnqueueOutcome>> {
        let languages = self.target_languages(work_id, extra_languages).await?;
        let mut outcomes = Vec::new();
        for chapter in self.repo.list_source_chapters(work_id).await? {
            for language in &languages {
                outcomes.push(
                    self.enqueue(JobKind::Translation, chapter.id, Some(language))
                        .await?,
                );
            }
        }
        Ok(outcomes)
    }

    async fn target_languages(&self, work_id: i64, extra_languages: &[String]) -> Result<Vec<String>> {
        let work = self
            .repo
            .get_work(work_id)
            .await?
            .ok_or_else(|| anyhow!("Work {} not found", work_id))?;

        let mut languages = BTreeSet::new();
        for edition in self.repo.list_editions(work_id).await? {
            if !edition.is_source {
                languages.insert(edition.language);
            }
        }
        for language in self.auto_translate_languages.iter().chain(extra_languages) {
            match language_utils::normalize_to_part1_or_part2t(language) {
                Ok(code) => {
                    languages.insert(code);
                }
                Err(e) => warn!("Skipping target language '{}': {}", language, e),
            }
        }
        languages.retain(|lang| !language_utils::language_codes_match(lang, &work.source_language));
        Ok(languages.into_iter().collect())
    }

    // =========================================================================
    // Processing
    // =========================================================================

    /// Run up to `max_jobs` due jobs, `worker_count` at a time
    pub async fn process_batch(&self, max_jobs: usize) -> Result<BatchReport> {
        let stale_after = chrono::Duration::from_std(self.stale_after)?;
        let recovered = self
            .repo
            .recover_stale_jobs(&timestamp(Utc::now() - stale_after))
            .await?;
        if recovered > 0 {
            warn!("Released {} jobs with expired claims", recovered);
        }

        let due = self.repo.due_jobs(&now_timestamp(), max_jobs).await?;
        if due.is_empty() {
            debug!("No due jobs");
            return Ok(BatchReport::default());
        }

        let runner_id = format!("runner-{}", Uuid::new_v4());
        debug!("{} processing {} due jobs", runner_id, due.len());

        let results: Vec<JobResult> = stream::iter(due)
            .map(|job| self.run_job(job, &runner_id))
            .buffer_unordered(self.worker_count)
            .collect()
            .await;

        let mut report = BatchReport {
            attempted: results.len(),
            ..Default::default()
        };
        for result in results {
            match result {
                JobResult::Succeeded => report.succeeded += 1,
                JobResult::Failed => report.failed += 1,
                JobResult::Dead => report.dead += 1,
                JobResult::Skipped => report.skipped += 1,
            }
        }
        info!("Batch finished: {}", report);
        Ok(report)
    }

    /// Call `process_batch` every `interval` until `shutdown` resolves
    ///
    /// A batch in flight when shutdown fires is finished first.
    pub async fn run_scheduled<F>(&self, interval: Duration, max_jobs: usize, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Scheduler stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    match self.process_batch(max_jobs).await {
                        Ok(report) if report.attempted > 0 => debug!("Scheduled batch: {}", report),
                        Ok(_) => {}
                        Err(e) => error!("Scheduled batch failed: {:#}", e),
                    }
                }
            }
        }
    }

    async fn run_job(&self, job: JobRecord, runner_id: &str) -> JobResult {
        match self.repo.claim_job(&job.id, runner_id, &now_timestamp()).await {
            Ok(true) => {}
            Ok(false) => {
                let conflict = PipelineError::ConcurrencyConflict(format!(
                    "job {} or chapter {} is held by another runner",
                    job.id, job.chapter_id
                ));
                debug!("Skipping: {}", conflict);
                return JobResult::Skipped;
            }
            Err(e) => {
                warn!("Could not claim job {}: {:#}", job.id, e);
                return JobResult::Skipped;
            }
        }
        let job = JobRecord {
            attempts: job.attempts + 1,
            ..job
        };

        let outcome = match job.kind {
            JobKind::Extraction => self.run_extraction(job.chapter_id).await,
            JobKind::Translation => match job.target_language.as_deref() {
                Some(language) => self.run_translation(job.chapter_id, language).await,
                None => Err(PipelineError::InvalidRequest(
                    "Translation job has no target language".to_string(),
                )),
            },
        };

        match outcome {
            Ok(()) => match self.repo.complete_job(&job.id, runner_id).await {
                Ok(true) => JobResult::Succeeded,
                Ok(false) => {
                    warn!("Job {} finished after its claim expired", job.id);
                    JobResult::Skipped
                }
                Err(e) => {
                    error!("Could not mark job {} done: {:#}", job.id, e);
                    JobResult::Failed
                }
            },
            Err(e) => self.handle_failure(&job, runner_id, e).await,
        }
    }

    async fn handle_failure(&self, job: &JobRecord, runner_id: &str, error: PipelineError) -> JobResult {
        let detail = error.detail().to_json();

        let stored = match self.policy.decide(&error, job) {
            Disposition::Retry { delay } => {
                let next_run_at = timestamp(Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64));
                warn!(
                    "{} job {} failed (attempt {}/{}), retrying at {}: {}",
                    job.kind, job.id, job.attempts, job.max_attempts, next_run_at, error
                );
                self.repo
                    .fail_job(&job.id, runner_id, &detail, &next_run_at, is_parse_failure(&error))
                    .await
                    .map(|ok| ok.then_some(JobResult::Failed))
            }
            Disposition::Dead => {
                error!(
                    "{} job {} is dead after {} attempts: {}",
                    job.kind, job.id, job.attempts, error
                );
                self.repo
                    .bury_job(&job.id, runner_id, &detail)
                    .await
                    .map(|ok| ok.then_some(JobResult::Dead))
            }
        };

        match stored {
            Ok(Some(result)) => result,
            Ok(None) => {
                warn!("Job {} lost its claim before the failure was recorded", job.id);
                JobResult::Skipped
            }
            Err(e) => {
                error!("Could not record failure of job {}: {:#}", job.id, e);
                JobResult::Failed
            }
        }
    }

    /// Extract, store the context, rebuild the registry, then enqueue translations
    async fn run_extraction(&self, chapter_id: i64) -> Result<(), PipelineError> {
        let chapter = self.source_chapter(chapter_id).await?;
        let work = self
            .repo
            .get_work(chapter.work_id)
            .await?
            .ok_or_else(|| PipelineError::InvalidRequest(format!("Work {} not found", chapter.work_id)))?;

        let result = self
            .extractor
            .extract(&chapter.content, &work.source_language)
            .await?;

        self.repo
            .save_chapter_context(&ChapterContextRecord {
                chapter_id: chapter.id,
                characters: result.characters,
                places: result.places,
                terms: result.terms,
                summary: result.summary,
                source_hash: chapter.content_hash.clone(),
                updated_at: now_timestamp(),
            })
            .await?;
        self.registry.rebuild(chapter.work_id).await?;

        for language in self.target_languages(chapter.work_id, &[]).await? {
            self.enqueue(JobKind::Translation, chapter.id, Some(&language))
                .await?;
        }
        Ok(())
    }

    async fn run_translation(&self, chapter_id: i64, language: &str) -> Result<(), PipelineError> {
        let outcome = self.translator.translate_chapter(chapter_id, language).await?;

        let event = ChapterTranslated {
            work_id: outcome.work_id,
            source_chapter_id: outcome.source_chapter_id,
            target_chapter_id: outcome.target_chapter_id,
            chapter_number: outcome.chapter_number,
            language: outcome.language,
            missing_entities: outcome.missing_entities,
        };
        for hook in &self.hooks {
            if let Err(e) = hook.chapter_translated(&event).await {
                warn!("Hook {:?} failed for chapter {}: {:#}", hook, chapter_id, e);
            }
        }
        Ok(())
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
