// Module-specific lints configuration
#![allow(clippy::uninlined_format_args)]

use anyhow::{anyhow, Context, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use log::{warn, Level, LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use namesake::app_config::{self, Config, TranslationProvider};
use namesake::app_controller::Controller;
use namesake::database::models::JobKind;

/// CLI Wrapper for TranslationProvider to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliTranslationProvider {
    Ollama,
    OpenAI,
    Anthropic,
    LMStudio,
}

impl From<CliTranslationProvider> for TranslationProvider {
    fn from(cli_provider: CliTranslationProvider) -> Self {
        match cli_provider {
            CliTranslationProvider::Ollama => TranslationProvider::Ollama,
            CliTranslationProvider::OpenAI => TranslationProvider::OpenAI,
            CliTranslationProvider::Anthropic => TranslationProvider::Anthropic,
            CliTranslationProvider::LMStudio => TranslationProvider::LMStudio,
        }
    }
}

/// CLI Wrapper for LogLevel to implement ValueEnum
#[derive(Debug, Clone, ValueEnum)]
enum CliLogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<CliLogLevel> for app_config::LogLevel {
    fn from(cli_level: CliLogLevel) -> Self {
        match cli_level {
            CliLogLevel::Error => app_config::LogLevel::Error,
            CliLogLevel::Warn => app_config::LogLevel::Warn,
            CliLogLevel::Info => app_config::LogLevel::Info,
            CliLogLevel::Debug => app_config::LogLevel::Debug,
            CliLogLevel::Trace => app_config::LogLevel::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliJobKind {
    Extraction,
    Translation,
}

impl From<CliJobKind> for JobKind {
    fn from(kind: CliJobKind) -> Self {
        match kind {
            CliJobKind::Extraction => JobKind::Extraction,
            CliJobKind::Translation => JobKind::Translation,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a work from a directory of chapter files
    Import {
        /// Directory with one .txt or .md file per chapter
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Source language code (e.g., 'zh', 'ja', 'ko')
        #[arg(short, long)]
        source_language: String,

        /// Target language codes to create editions for
        #[arg(short, long, value_delimiter = ',')]
        target_language: Vec<String>,

        /// Work title; the directory name when omitted
        #[arg(long)]
        title: Option<String>,
    },

    /// Enqueue extraction or translation jobs for a work
    Enqueue {
        #[arg(short, long)]
        work: i64,

        #[arg(short, long, value_enum)]
        kind: CliJobKind,

        /// Additional target languages for translation jobs
        #[arg(short, long, value_delimiter = ',')]
        target_language: Vec<String>,
    },

    /// Run one batch of due jobs
    Process {
        /// Maximum jobs to run in this batch
        #[arg(long)]
        max_jobs: Option<usize>,
    },

    /// Rebuild the entity registry from chapter contexts
    Rebuild {
        #[arg(short, long, conflicts_with = "all", required_unless_present = "all")]
        work: Option<i64>,

        #[arg(long)]
        all: bool,

        /// Refresh the keyword index afterwards
        #[arg(long)]
        rebuild_keywords: bool,
    },

    /// Process batches on a schedule until Ctrl-C
    Worker {
        /// Seconds between batches
        #[arg(long)]
        interval_secs: Option<u64>,

        #[arg(long)]
        max_jobs: Option<usize>,
    },

    /// Check that a provider is reachable
    Check {
        /// Provider name; the configured default when omitted
        #[arg(long)]
        provider_name: Option<String>,
    },

    /// Generate shell completions for namesake
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// namesake - entity-consistent translation of serialized fiction
///
/// Extracts character, place and term names from each chapter, keeps one
/// translation per name across a work, and translates chapters with that
/// vocabulary using AI providers (Ollama, OpenAI, Anthropic, LM Studio).
#[derive(Parser, Debug)]
#[command(name = "namesake")]
#[command(version)]
#[command(about = "Entity-consistent translation pipeline for serialized fiction")]
#[command(long_about = "namesake imports serialized fiction chapter by chapter, extracts named entities, \
keeps their translations consistent across the whole work and translates chapters with an LLM.

EXAMPLES:
    namesake import ./novel -s zh -t en         # Import chapters and queue extraction
    namesake process --max-jobs 20              # Run one batch of due jobs
    namesake enqueue -w 1 -k translation -t fr  # Queue French translations of work 1
    namesake rebuild --all --rebuild-keywords   # Recompute every registry
    namesake worker --interval-secs 30          # Keep processing until Ctrl-C
    namesake completions bash > namesake.bash   # Generate bash completions

CONFIGURATION:
    Configuration is stored in conf.json by default. You can specify a different
    config file with --config-path. If the config file doesn't exist, a default one
    will be created automatically.")]
struct CommandLineOptions {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "conf.json", global = true, env = "NAMESAKE_CONFIG")]
    config_path: String,

    /// Translation provider to use
    #[arg(short, long, value_enum, global = true)]
    provider: Option<CliTranslationProvider>,

    /// Model name to use
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// SQLite database file
    #[arg(long, global = true, env = "NAMESAKE_DATABASE")]
    database: Option<String>,

    /// Set logging level
    #[arg(short, long, value_enum, global = true)]
    log_level: Option<CliLogLevel>,
}

// @struct: Custom logger implementation
struct CustomLogger {
    level: LevelFilter,
}

impl CustomLogger {
    // @initializes: Global logger
    fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
        log::set_boxed_logger(Box::new(CustomLogger { level: LevelFilter::Trace }))?;
        log::set_max_level(level);
        Ok(())
    }

    // @returns: Emoji and ANSI colour for a level
    fn decoration(level: Level) -> (&'static str, &'static str) {
        match level {
            Level::Error => ("❌ ", "1;31"),
            Level::Warn => ("🚧 ", "1;33"),
            Level::Info => (" ", "1;32"),
            Level::Debug => ("🔍 ", "1;36"),
            Level::Trace => ("📋 ", "1;35"),
        }
    }
}

impl Log for CustomLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let now = chrono::Local::now().format("%H:%M:%S.%3f");
            let (emoji, colour) = Self::decoration(record.level());
            let _ = writeln!(
                std::io::stderr(),
                "\x1B[{}m{} {} {}\x1B[0m",
                colour,
                now,
                emoji,
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Info until the configuration says otherwise
    CustomLogger::init(LevelFilter::Info)?;

    let cli = CommandLineOptions::parse();

    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = CommandLineOptions::command();
        generate(*shell, &mut cmd, "namesake", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let controller = Controller::from_config(config.clone())?;

    match cli.command {
        Commands::Import {
            dir,
            source_language,
            target_language,
            title,
        } => {
            let summary = controller
                .import_directory(&dir, title.as_deref(), &source_language, &target_language)
                .await?;
            println!(
                "work: {}, chapters: {}, extraction jobs: {}",
                summary.work_id, summary.chapters, summary.jobs
            );
        }
        Commands::Enqueue {
            work,
            kind,
            target_language,
        } => {
            let created = controller.enqueue(work, kind.into(), &target_language).await?;
            println!("enqueued: {}", created);
        }
        Commands::Process { max_jobs } => {
            let report = controller
                .process(max_jobs.unwrap_or(config.pipeline.max_jobs))
                .await?;
            println!(
                "attempted: {}, succeeded: {}, failed: {}, dead: {}",
                report.attempted, report.succeeded, report.failed, report.dead
            );
            if report.skipped > 0 {
                println!("skipped: {}", report.skipped);
            }
        }
        Commands::Rebuild {
            work,
            all,
            rebuild_keywords,
        } => {
            let target = if all { None } else { work };
            for (work_id, stats) in controller.rebuild(target, rebuild_keywords).await? {
                println!("work {}: {}", work_id, stats);
            }
        }
        Commands::Worker {
            interval_secs,
            max_jobs,
        } => {
            let interval = Duration::from_secs(interval_secs.unwrap_or(config.pipeline.schedule_interval_secs));
            controller
                .run_worker(interval, max_jobs.unwrap_or(config.pipeline.max_jobs))
                .await?;
            println!("{}", controller.job_stats().await?);
        }
        Commands::Check { provider_name } => {
            controller
                .check_provider(provider_name.as_deref())
                .await
                .map_err(|e| anyhow!("Provider check failed: {}", e))?;
            println!("ok");
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(cli: &CommandLineOptions) -> Result<Config> {
    // If log level is set via command line, apply it immediately
    if let Some(level) = &cli.log_level {
        let level: app_config::LogLevel = level.clone().into();
        log::set_max_level(level.into());
    }

    let (mut config, created) = Config::load_or_create(&cli.config_path)?;
    if created {
        warn!("Config file not found at '{}', created a default config.", cli.config_path);
    }

    // Override config with CLI options if provided
    if let Some(provider) = &cli.provider {
        config.translation.provider = provider.clone().into();
    }
    if let Some(model) = &cli.model {
        let provider_str = config.translation.provider.to_lowercase_string();
        match config
            .translation
            .available_providers
            .iter_mut()
            .find(|p| p.provider_type == provider_str)
        {
            Some(provider_config) => provider_config.model = model.clone(),
            None => warn!("No provider entry for '{}' in the config; --model ignored", provider_str),
        }
    }
    if let Some(database) = &cli.database {
        config.database_path = Some(database.clone());
    }
    match &cli.log_level {
        Some(level) => config.log_level = level.clone().into(),
        None => log::set_max_level(config.log_level.into()),
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}
