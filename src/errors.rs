/*!
 * Error types for the namesake pipeline.
 *
 * Provider failures are classified as transient or permanent so the job
 * runner can decide between backing off and giving up. Pipeline errors
 * carry the prompt and raw model response that produced them, truncated,
 * so a dead job can be diagnosed from its stored error alone.
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default bound applied to prompts and responses kept in error diagnostics
pub const DEFAULT_DIAGNOSTIC_CHARS: usize = 16_000;

/// Whether retrying the same call can reasonably succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    /// Timeouts, connection failures, rate limiting, server errors
    Transient,
    /// Authentication failures and malformed requests
    Permanent,
}

/// Errors that can occur when working with provider APIs
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Error when making an API request fails
    #[error("API request failed: {0}")]
    RequestFailed(String),

    /// Error when parsing the vendor response envelope fails
    #[error("Failed to parse API response: {0}")]
    ParseError(String),

    /// Error returned by the API itself
    #[error("API responded with error: {status_code} - {message}")]
    ApiError {
        /// HTTP status code
        status_code: u16,
        /// Error message from the API
        message: String,
    },

    /// Error establishing or maintaining a connection
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error related to rate limiting
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Error with authentication
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// The call did not finish within the configured bound
    #[error("Provider call timed out after {0} ms")]
    Timeout(u64),

    /// The request itself is unusable (bad model name, oversized prompt, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// No provider is registered under the requested name
    #[error("Provider '{0}' is not configured")]
    NotConfigured(String),
}

impl ProviderError {
    /// Build the error matching an unsuccessful HTTP status
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status_code {
            401 | 403 => Self::AuthenticationError(message),
            429 => Self::RateLimitExceeded(message),
            _ => Self::ApiError { status_code, message },
        }
    }

    /// Classify the error for retry decisions
    pub fn kind(&self) -> ProviderErrorKind {
        match self {
            Self::RequestFailed(_)
            | Self::ParseError(_)
            | Self::ConnectionError(_)
            | Self::RateLimitExceeded(_)
            | Self::Timeout(_) => ProviderErrorKind::Transient,
            Self::AuthenticationError(_) | Self::InvalidRequest(_) | Self::NotConfigured(_) => {
                ProviderErrorKind::Permanent
            }
            Self::ApiError { status_code, .. } => match status_code {
                408 | 429 => ProviderErrorKind::Transient,
                500..=599 => ProviderErrorKind::Transient,
                _ => ProviderErrorKind::Permanent,
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ProviderErrorKind::Transient
    }

    /// HTTP status associated with the failure, when there is one
    pub fn http_status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status_code, .. } => Some(*status_code),
            Self::RateLimitExceeded(_) => Some(429),
            Self::AuthenticationError(_) => Some(401),
            _ => None,
        }
    }
}

/// Prompt and raw response captured alongside a pipeline failure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub prompt: String,
    pub raw_response: Option<String>,
}

impl Diagnostics {
    /// Capture diagnostics, truncating each part to `max_chars` characters
    pub fn new(prompt: &str, raw_response: Option<&str>, max_chars: usize) -> Self {
        Self {
            prompt: truncate_chars(prompt, max_chars),
            raw_response: raw_response.map(|r| truncate_chars(r, max_chars)),
        }
    }
}

/// Truncate on a character boundary, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("…[truncated]");
    truncated
}

/// Errors raised by extraction, translation and job execution
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The provider call failed
    #[error("Provider error: {source}")]
    Provider {
        #[source]
        source: ProviderError,
        diagnostics: Diagnostics,
    },

    /// The model answered but the answer is not the expected JSON
    #[error("Failed to parse model response: {message}")]
    ResponseParsing {
        message: String,
        diagnostics: Diagnostics,
    },

    /// The answer parsed but violates a required shape or rule
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        diagnostics: Diagnostics,
    },

    /// The job names a chapter, work or language it can never run against
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Another worker owns the job or the chapter
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Database failure; the enclosing transaction was rolled back
    #[error("Storage error: {source}")]
    Storage {
        #[source]
        source: anyhow::Error,
        /// Present when the failure happened after the model answered
        diagnostics: Option<Diagnostics>,
    },
}

impl From<anyhow::Error> for PipelineError {
    fn from(source: anyhow::Error) -> Self {
        Self::Storage {
            source,
            diagnostics: None,
        }
    }
}

impl PipelineError {
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Self::Provider { diagnostics, .. }
            | Self::ResponseParsing { diagnostics, .. }
            | Self::Validation { diagnostics, .. } => Some(diagnostics),
            Self::Storage { diagnostics, .. } => diagnostics.as_ref(),
            Self::InvalidRequest(_) | Self::ConcurrencyConflict(_) => None,
        }
    }

    /// Stable identifier stored with failed jobs
    pub fn kind_label(&self) -> &'static str {
        match self {
            Self::Provider { source, .. } => match source.kind() {
                ProviderErrorKind::Transient => "provider_transient",
                ProviderErrorKind::Permanent => "provider_permanent",
            },
            Self::ResponseParsing { .. } => "response_parsing",
            Self::Validation { .. } => "validation",
            Self::InvalidRequest(_) => "invalid_request",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Storage { .. } => "storage",
        }
    }

    /// Serializable snapshot for `jobs.last_error`
    pub fn detail(&self) -> ErrorDetail {
        let diagnostics = self.diagnostics();
        ErrorDetail {
            kind: self.kind_label().to_string(),
            message: self.to_string(),
            http_status: match self {
                Self::Provider { source, .. } => source.http_status(),
                _ => None,
            },
            prompt: diagnostics.map(|d| d.prompt.clone()),
            raw_response: diagnostics.and_then(|d| d.raw_response.clone()),
        }
    }
}

/// Error record persisted with a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl ErrorDetail {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }
}

/// Main application error type that wraps all other errors
#[derive(Error, Debug)]
pub enum AppError {
    /// Error from a file operation
    #[error("File error: {0}")]
    File(String),

    /// Invalid or unusable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Error from a provider
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Error from the pipeline
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    /// Any other error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        Self::Unknown(error.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(error: std::io::Error) -> Self {
        Self::File(error.to_string())
    }
}
