/*!
 * Provider implementations for the LLM backends.
 *
 * Every backend is reached through the object-safe `Provider` trait with one
 * request and one response shape, so extraction and translation never branch
 * on vendor details:
 * - OpenAI: chat completions API (also LM Studio and other compatible servers)
 * - Anthropic: messages API
 * - Ollama: local chat API
 * - Mock: scripted responses for tests
 *
 * `ProviderRegistry` maps names to providers and is built once at startup.
 * `RequestBudget` bounds concurrency, spacing and duration of every call.
 */

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

use crate::errors::ProviderError;

pub mod anthropic;
pub mod budget;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod registry;

pub use budget::RequestBudget;
pub use registry::ProviderRegistry;

/// Author of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Chat message object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// Uniform completion request accepted by every provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionRequest {
    /// Ordered conversation
    pub messages: Vec<ChatMessage>,
    /// Model override; the provider's configured model when absent
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Completion token limit
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a system message
    pub fn system(self, content: impl Into<String>) -> Self {
        self.add_message(Role::System, content)
    }

    /// Add a user message
    pub fn user(self, content: impl Into<String>) -> Self {
        self.add_message(Role::User, content)
    }

    /// Add a message to the request
    pub fn add_message(mut self, role: Role, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage {
            role,
            content: content.into(),
        });
        self
    }

    /// Set the model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Set the temperature
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the completion token limit
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Concatenated system message content
    pub fn system_prompt(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        if parts.is_empty() { None } else { Some(parts.join("\n\n")) }
    }

    /// Flat rendering of the whole conversation, kept with errors for diagnosis
    pub fn render(&self) -> String {
        self.messages
            .iter()
            .map(|m| format!("[{}]\n{}", m.role.as_str(), m.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Token accounting reported by the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Uniform completion response returned by every provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: TokenUsage,
}

/// Common trait for all LLM providers
///
/// Implementations perform a single attempt per call. Retrying is the job
/// runner's decision, driven by `ProviderError::kind`.
#[async_trait]
pub trait Provider: Send + Sync + Debug {
    /// Name the provider is registered under
    fn name(&self) -> &str;

    /// Complete a request using this provider
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Test the connection to the provider
    async fn test_connection(&self) -> Result<(), ProviderError>;
}

/// Map a transport failure from reqwest onto the provider taxonomy
pub(crate) fn map_transport_error(error: reqwest::Error, timeout_secs: u64) -> ProviderError {
    if error.is_timeout() {
        ProviderError::Timeout(timeout_secs * 1000)
    } else if error.is_connect() {
        ProviderError::ConnectionError(error.to_string())
    } else if error.is_decode() {
        ProviderError::ParseError(error.to_string())
    } else {
        ProviderError::RequestFailed(error.to_string())
    }
}

/// Turn an unsuccessful HTTP response into a classified error
pub(crate) async fn error_from_response(vendor: &str, response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Failed to get error response text".to_string());
    log::error!("{} API error ({}): {}", vendor, status, error_text);
    ProviderError::from_status(status.as_u16(), error_text)
}

/// HTTP client with pooled keep-alive connections and a per-call timeout
pub(crate) fn http_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
        .pool_idle_timeout(std::time::Duration::from_secs(90))
        .tcp_keepalive(std::time::Duration::from_secs(60))
        .build()
        .unwrap_or_default()
}
