use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::default::Default;
use std::path::Path;

/// Application configuration module
/// This module handles loading, validating and saving the JSON configuration
/// that drives providers, the pipeline and the job runner.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Provider selection and provider settings
    #[serde(default)]
    pub translation: TranslationConfig,

    /// Extraction, translation and job runner settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// SQLite database file; the platform data directory is used when absent
    #[serde(default)]
    pub database_path: Option<String>,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,
}

/// Translation provider type
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum TranslationProvider {
    // @provider: Ollama
    #[default]
    Ollama,
    // @provider: OpenAI
    OpenAI,
    // @provider: Anthropic
    Anthropic,
    // @provider: LM Studio (OpenAI-compatible local server)
    LMStudio,
}

impl TranslationProvider {
    /// Every variant, in declaration order
    pub const ALL: [TranslationProvider; 4] = [
        Self::Ollama,
        Self::OpenAI,
        Self::Anthropic,
        Self::LMStudio,
    ];

    // @returns: Capitalized provider name
    pub fn display_name(&self) -> &str {
        match self {
            Self::Ollama => "Ollama",
            Self::OpenAI => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::LMStudio => "LM Studio",
        }
    }

    // @returns: Lowercase provider identifier
    pub fn to_lowercase_string(&self) -> String {
        match self {
            Self::Ollama => "ollama".to_string(),
            Self::OpenAI => "openai".to_string(),
            Self::Anthropic => "anthropic".to_string(),
            Self::LMStudio => "lmstudio".to_string(),
        }
    }

    /// Whether the backend refuses requests without an API key
    pub fn requires_api_key(&self) -> bool {
        matches!(self, Self::OpenAI | Self::Anthropic)
    }
}

impl std::fmt::Display for TranslationProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_lowercase_string())
    }
}

impl std::str::FromStr for TranslationProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "lmstudio" => Ok(Self::LMStudio),
            _ => Err(anyhow!("Invalid provider type: {}", s)),
        }
    }
}

/// Provider configuration wrapper
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    // @field: Provider type identifier
    #[serde(rename = "type")]
    pub provider_type: String,

    // @field: Model name
    #[serde(default = "String::new")]
    pub model: String,

    // @field: API key
    #[serde(default = "String::new")]
    pub api_key: String,

    // @field: Service URL
    #[serde(default = "String::new")]
    pub endpoint: String,

    // @field: Max concurrent requests against this backend
    #[serde(default = "default_concurrent_requests")]
    pub concurrent_requests: usize,

    // @field: Timeout seconds for one call
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    // @field: Rate limit (requests per minute)
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

impl ProviderConfig {
    // @param provider_type: Provider enum
    // @returns: Provider config with defaults
    pub fn new(provider_type: TranslationProvider) -> Self {
        match provider_type {
            TranslationProvider::Ollama => Self {
                provider_type: "ollama".to_string(),
                model: default_ollama_model(),
                api_key: String::new(),
                endpoint: default_ollama_endpoint(),
                concurrent_requests: default_concurrent_requests(),
                timeout_secs: default_local_timeout_secs(),
                rate_limit: None,
            },
            TranslationProvider::OpenAI => Self {
                provider_type: "openai".to_string(),
                model: default_openai_model(),
                api_key: String::new(),
                endpoint: default_openai_endpoint(),
                concurrent_requests: default_concurrent_requests(),
                timeout_secs: default_timeout_secs(),
                rate_limit: Some(60),
            },
            TranslationProvider::Anthropic => Self {
                provider_type: "anthropic".to_string(),
                model: default_anthropic_model(),
                api_key: String::new(),
                endpoint: default_anthropic_endpoint(),
                concurrent_requests: default_concurrent_requests(),
                timeout_secs: default_timeout_secs(),
                // Slightly below the published 50 requests per minute
                rate_limit: Some(45),
            },
            TranslationProvider::LMStudio => Self {
                provider_type: "lmstudio".to_string(),
                model: default_lmstudio_model(),
                api_key: String::new(),
                endpoint: default_lmstudio_endpoint(),
                concurrent_requests: default_concurrent_requests(),
                timeout_secs: default_local_timeout_secs(),
                rate_limit: None,
            },
        }
    }
}

/// Provider selection and settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranslationConfig {
    /// Provider used by extraction and translation
    #[serde(default)]
    pub provider: TranslationProvider,

    /// Available translation providers
    #[serde(default)]
    pub available_providers: Vec<ProviderConfig>,

    /// Common generation settings
    #[serde(default)]
    pub common: TranslationCommonConfig,
}

/// Generation settings applicable to all providers
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TranslationCommonConfig {
    /// Temperature for chapter translation (0.0 to 1.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Temperature for entity extraction, kept low so reruns agree
    #[serde(default)]
    pub extraction_temperature: f32,

    /// Completion token limit for one chapter
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for TranslationCommonConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            extraction_temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

/// Pipeline and job runner settings
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Attempts before a job is marked dead
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Retries granted to a job whose model output failed to parse or validate
    #[serde(default = "default_parse_retry_limit")]
    pub parse_retry_limit: u32,

    /// Base of the exponential backoff between attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Upper bound on a single backoff delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Jobs processed concurrently by one batch
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs claimed by one batch invocation
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,

    /// Process-wide cap on in-flight provider calls
    #[serde(default = "default_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Minimum spacing between the start of two provider calls
    #[serde(default = "default_min_request_interval_ms")]
    pub min_request_interval_ms: u64,

    /// Number of preceding chapters summarized into a translation prompt
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,

    /// Free-form guidance appended to every translation prompt
    #[serde(default)]
    pub style_hints: Vec<String>,

    /// Reject translations that omit a mapping for an expected entity
    #[serde(default)]
    pub strict_entity_validation: bool,

    /// Let a new translation replace an established entity translation
    #[serde(default)]
    pub override_entity_translations: bool,

    /// Bound on prompt and response text kept with a failed job
    #[serde(default = "default_error_detail_max_chars")]
    pub error_detail_max_chars: usize,

    /// Target languages translated automatically after extraction
    #[serde(default)]
    pub auto_translate_languages: Vec<String>,

    /// In-progress jobs older than this are considered abandoned
    #[serde(default = "default_stale_job_secs")]
    pub stale_job_secs: u64,

    /// Interval between batches in worker mode
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            parse_retry_limit: default_parse_retry_limit(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            worker_count: default_worker_count(),
            max_jobs: default_max_jobs(),
            max_concurrent_requests: default_concurrent_requests(),
            min_request_interval_ms: default_min_request_interval_ms(),
            summary_window: default_summary_window(),
            style_hints: Vec::new(),
            strict_entity_validation: false,
            override_entity_translations: false,
            error_detail_max_chars: default_error_detail_max_chars(),
            auto_translate_languages: Vec::new(),
            stale_job_secs: default_stale_job_secs(),
            schedule_interval_secs: default_schedule_interval_secs(),
        }
    }
}

/// Log verbosity level
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

fn default_concurrent_requests() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_local_timeout_secs() -> u64 {
    300
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_max_attempts() -> u32 {
    5
}

fn default_parse_retry_limit() -> u32 {
    1
}

fn default_retry_backoff_ms() -> u64 {
    30_000 // doubled on each attempt
}

fn default_max_backoff_ms() -> u64 {
    3_600_000
}

fn default_worker_count() -> usize {
    4
}

fn default_max_jobs() -> usize {
    50
}

fn default_min_request_interval_ms() -> u64 {
    250
}

fn default_summary_window() -> usize {
    3
}

fn default_error_detail_max_chars() -> usize {
    crate::errors::DEFAULT_DIAGNOSTIC_CHARS
}

fn default_stale_job_secs() -> u64 {
    1800
}

fn default_schedule_interval_secs() -> u64 {
    60
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_anthropic_endpoint() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_lmstudio_endpoint() -> String {
    // LM Studio default server (OpenAI compatible) runs on port 1234 under /v1
    "http://localhost:1234/v1".to_string()
}

fn default_ollama_model() -> String {
    "qwen2.5:14b".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_anthropic_model() -> String {
    "claude-3-5-haiku-latest".to_string()
}

fn default_lmstudio_model() -> String {
    // Placeholder; users should set to the loaded model name in LM Studio
    "local-model".to_string()
}

impl Config {
    /// Load a configuration file, writing a default one when it does not exist
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<(Self, bool)> {
        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to open config file: {}", path.display()))?;
            let config: Config = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            return Ok((config, false));
        }

        let config = Config::default();
        let config_json = serde_json::to_string_pretty(&config)
            .context("Failed to serialize default config to JSON")?;
        std::fs::write(path, config_json)
            .with_context(|| format!("Failed to write default config to file: {}", path.display()))?;
        Ok((config, true))
    }

    /// Validate the configuration for consistency and required values
    pub fn validate(&self) -> Result<()> {
        if self.translation.provider.requires_api_key() && self.translation.get_api_key().is_empty() {
            return Err(anyhow!(
                "Translation API key is required for {} provider",
                self.translation.provider.display_name()
            ));
        }

        let pipeline = &self.pipeline;
        if pipeline.max_attempts == 0 {
            return Err(anyhow!("pipeline.max_attempts must be at least 1"));
        }
        if pipeline.worker_count == 0 || pipeline.max_concurrent_requests == 0 {
            return Err(anyhow!("pipeline.worker_count and pipeline.max_concurrent_requests must be at least 1"));
        }
        for language in &pipeline.auto_translate_languages {
            crate::language_utils::validate_language_code(language)
                .with_context(|| format!("Invalid language in pipeline.auto_translate_languages: {}", language))?;
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            translation: TranslationConfig::default(),
            pipeline: PipelineConfig::default(),
            database_path: None,
            log_level: LogLevel::default(),
        }
    }
}

impl TranslationConfig {
    /// Get the active provider configuration from the available_providers array
    pub fn get_active_provider_config(&self) -> Option<&ProviderConfig> {
        self.get_provider_config(&self.provider)
    }

    /// Get a specific provider configuration by type
    pub fn get_provider_config(&self, provider_type: &TranslationProvider) -> Option<&ProviderConfig> {
        let provider_str = provider_type.to_lowercase_string();
        self.available_providers.iter()
            .find(|p| p.provider_type == provider_str)
    }

    /// Resolved settings for a provider, filling blanks with that provider's defaults
    pub fn resolved_provider_config(&self, provider_type: TranslationProvider) -> ProviderConfig {
        let defaults = ProviderConfig::new(provider_type);
        let Some(configured) = self.get_provider_config(&provider_type) else {
            return defaults;
        };

        let mut resolved = configured.clone();
        if resolved.model.is_empty() {
            resolved.model = defaults.model;
        }
        if resolved.endpoint.is_empty() {
            resolved.endpoint = defaults.endpoint;
        }
        if resolved.timeout_secs == 0 {
            resolved.timeout_secs = defaults.timeout_secs;
        }
        resolved
    }

    /// Get the model for the active provider
    pub fn get_model(&self) -> String {
        self.resolved_provider_config(self.provider).model
    }

    /// Get the API key for the active provider
    pub fn get_api_key(&self) -> String {
        self.get_active_provider_config()
            .map(|p| p.api_key.clone())
            .unwrap_or_default()
    }

    /// Get the endpoint for the active provider
    pub fn get_endpoint(&self) -> String {
        self.resolved_provider_config(self.provider).endpoint
    }

    /// Get the call timeout for the active provider
    pub fn get_timeout_secs(&self) -> u64 {
        self.resolved_provider_config(self.provider).timeout_secs
    }

    /// Get the rate limit for the active provider
    pub fn get_rate_limit(&self) -> Option<u32> {
        match self.get_active_provider_config() {
            Some(provider_config) => provider_config.rate_limit,
            None => ProviderConfig::new(self.provider).rate_limit,
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            provider: TranslationProvider::default(),
            available_providers: TranslationProvider::ALL
                .iter()
                .map(|p| ProviderConfig::new(*p))
                .collect(),
            common: TranslationCommonConfig::default(),
        }
    }
}
