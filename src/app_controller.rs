use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::app_config::Config;
use crate::database::connection::DatabaseStats;
use crate::database::models::{JobKind, JobStats};
use crate::database::{DatabaseConnection, Repository};
use crate::errors::AppError;
use crate::extraction::EntityExtractor;
use crate::jobs::{BatchReport, JobRunner, LoggingHook};
use crate::providers::{ProviderRegistry, RequestBudget};
use crate::registry::{EntityRegistry, RebuildStats, SqliteKeywordIndex};
use crate::translation::ChapterTranslator;

// @module: Application controller wiring storage, providers and the job runner

/// File extensions picked up by `import_directory`
const CHAPTER_EXTENSIONS: &[&str] = &["txt", "md"];

/// Result of importing a directory of chapters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub work_id: i64,
    pub chapters: usize,
    /// Extraction jobs created for the new chapters
    pub jobs: usize,
}

/// Main application controller
pub struct Controller {
    config: Config,
    repo: Repository,
    registry: Arc<EntityRegistry>,
    providers: Arc<ProviderRegistry>,
    runner: JobRunner,
}

impl Controller {
    /// Open the configured database and build every service from `config`
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        config
            .validate()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let db = match &config.database_path {
            Some(path) => DatabaseConnection::new(path)?,
            None => DatabaseConnection::new_default()?,
        };
        let providers = Arc::new(ProviderRegistry::from_config(&config.translation));
        Ok(Self::with_components(config, Repository::new(db), providers))
    }

    /// Build the services around an existing repository and provider registry
    pub fn with_components(config: Config, repo: Repository, providers: Arc<ProviderRegistry>) -> Self {
        let budget = Arc::new(RequestBudget::from_config(&config));
        let registry = Arc::new(
            EntityRegistry::new(repo.clone()).with_keyword_index(Arc::new(SqliteKeywordIndex::new(repo.clone()))),
        );
        let extractor = EntityExtractor::from_config(&config, providers.clone(), budget.clone());
        let translator = ChapterTranslator::from_config(&config, registry.clone(), providers.clone(), budget);
        let runner = JobRunner::from_config(&config, registry.clone(), extractor, translator)
            .with_hook(Arc::new(LoggingHook));

        Self {
            config,
            repo,
            registry,
            providers,
            runner,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn repository(&self) -> &Repository {
        &self.repo
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Create a work from a directory with one text file per chapter
    ///
    /// Files are numbered in file name order; each file stem becomes the
    /// chapter title. Extraction jobs are enqueued for every chapter.
    pub async fn import_directory(
        &self,
        dir: &Path,
        title: Option<&str>,
        source_language: &str,
        target_languages: &[String],
    ) -> Result<ImportSummary> {
        if !dir.is_dir() {
            return Err(anyhow!("Input directory does not exist: {:?}", dir));
        }

        let files: Vec<_> = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .filter(|path| {
                path.is_file()
                    && path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| CHAPTER_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            })
            .collect();
        if files.is_empty() {
            return Err(anyhow!("No chapter files found in {:?}", dir));
        }

        let title = match title {
            Some(title) => title.to_string(),
            None => dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "Untitled".to_string()),
        };
        let work = self.repo.create_work(&title, source_language).await?;
        for language in target_languages {
            self.repo.create_edition(work.id, language).await?;
        }

        for (index, path) in files.iter().enumerate() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read chapter file: {}", path.display()))?;
            let chapter_title = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.repo
                .add_source_chapter(work.id, index as i64 + 1, &chapter_title, &content)
                .await?;
        }

        let jobs = self
            .runner
            .enqueue_stale_extractions(work.id)
            .await?
            .iter()
            .filter(|o| o.created)
            .count();
        info!(
            "Imported '{}' as work {} with {} chapters",
            work.title,
            work.id,
            files.len()
        );

        Ok(ImportSummary {
            work_id: work.id,
            chapters: files.len(),
            jobs,
        })
    }

    /// Enqueue jobs for a work; returns how many new jobs were created
    pub async fn enqueue(&self, work_id: i64, kind: JobKind, languages: &[String]) -> Result<usize> {
        let outcomes = match kind {
            JobKind::Extraction => self.runner.enqueue_stale_extractions(work_id).await?,
            JobKind::Translation => {
                self.runner
                    .enqueue_translations_for_work(work_id, languages)
                    .await?
            }
        };
        let created = outcomes.iter().filter(|o| o.created).count();
        if created < outcomes.len() {
            info!("{} jobs were already queued", outcomes.len() - created);
        }
        Ok(created)
    }

    /// Run one batch with a spinner on the terminal
    pub async fn process(&self, max_jobs: usize) -> Result<BatchReport> {
        let start_time = Instant::now();
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(120));
        spinner.set_message(format!("Processing up to {} jobs", max_jobs));

        let result = self.runner.process_batch(max_jobs).await;

        match &result {
            Ok(report) => spinner.finish_with_message(format!(
                "{} in {:.1}s",
                report,
                start_time.elapsed().as_secs_f64()
            )),
            Err(_) => spinner.abandon_with_message("Batch failed"),
        }
        result
    }

    /// Rebuild one work's registry, or every work's when `work_id` is `None`
    pub async fn rebuild(&self, work_id: Option<i64>, rebuild_keywords: bool) -> Result<Vec<(i64, RebuildStats)>> {
        match work_id {
            Some(work_id) => {
                let stats = self
                    .registry
                    .rebuild_with_keywords(work_id, rebuild_keywords)
                    .await?;
                Ok(vec![(work_id, stats)])
            }
            None => self.registry.rebuild_all(rebuild_keywords).await,
        }
    }

    /// Process batches on a schedule until Ctrl-C
    pub async fn run_worker(&self, interval: Duration, max_jobs: usize) -> Result<()> {
        info!(
            "Worker started: every {}s, up to {} jobs per batch",
            interval.as_secs(),
            max_jobs
        );
        self.runner
            .run_scheduled(interval, max_jobs, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await
    }

    /// Send a minimal request to a provider
    pub async fn check_provider(&self, name: Option<&str>) -> Result<(), AppError> {
        let provider = match name {
            Some(name) => self.providers.get(name)?,
            None => self.providers.default_provider()?,
        };
        provider.test_connection().await?;
        info!("Provider {} is reachable", provider.name());
        Ok(())
    }

    pub async fn job_stats(&self) -> Result<JobStats> {
        self.repo.job_stats().await
    }

    pub fn database_stats(&self) -> Result<DatabaseStats> {
        self.repo.db().stats()
    }
}
