use async_trait::async_trait;
use log::{debug, error};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::providers::{
    error_from_response, http_client, map_transport_error, CompletionRequest, CompletionResponse,
    Provider, TokenUsage,
};

/// Ollama client for interacting with a local Ollama server
#[derive(Debug)]
pub struct Ollama {
    name: String,
    /// Base URL of the Ollama API
    base_url: String,
    /// HTTP client for making requests
    client: Client,
    model: String,
    timeout_secs: u64,
}

/// Generation options for the Ollama API
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct GenerationOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    /// Maximum number of tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// Chat message object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaMessage {
    /// Role of the message sender (system, user, assistant, or tool)
    pub role: String,
    /// Content of the message
    pub content: String,
}

/// Chat request for the Ollama API
#[derive(Debug, Serialize)]
pub struct ChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerationOptions>,
    /// Always false; the adapter reads one JSON body
    stream: bool,
}

/// Chat response from the Ollama API
#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    pub model: String,
    pub message: OllamaMessage,
    pub done: bool,
    #[serde(default)]
    pub done_reason: Option<String>,
    /// Number of prompt tokens
    #[serde(default)]
    pub prompt_eval_count: Option<u64>,
    /// Number of generated tokens
    #[serde(default)]
    pub eval_count: Option<u64>,
}

impl ChatRequest {
    pub fn from_completion(request: &CompletionRequest, default_model: &str) -> Self {
        let options = if request.temperature.is_some() || request.max_tokens.is_some() {
            Some(GenerationOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            })
        } else {
            None
        };

        Self {
            model: request.model.clone().unwrap_or_else(|| default_model.to_string()),
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            options,
            stream: false,
        }
    }
}

impl Ollama {
    /// Create a new Ollama client from an endpoint such as `http://localhost:11434`
    ///
    /// A bare host gets the `http` scheme and the default port.
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: Self::normalize_base_url(&endpoint.into()),
            client: http_client(timeout_secs),
            model: model.into(),
            timeout_secs,
        }
    }

    /// Add scheme and port where they are missing
    pub fn normalize_base_url(endpoint: &str) -> String {
        const DEFAULT_PORT: u16 = 11434;
        let endpoint = endpoint.trim().trim_end_matches('/');
        if endpoint.is_empty() {
            return format!("http://localhost:{}", DEFAULT_PORT);
        }

        let with_scheme = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };

        let has_explicit_port = with_scheme
            .split("://")
            .nth(1)
            .is_some_and(|authority| authority.contains(':'));

        match url::Url::parse(&with_scheme) {
            Ok(url) if has_explicit_port || url.path() != "/" => with_scheme,
            Ok(_) => format!("{}:{}", with_scheme, DEFAULT_PORT),
            Err(e) => {
                error!("Malformed Ollama endpoint '{}': {}, falling back to localhost", endpoint, e);
                format!("http://localhost:{}", DEFAULT_PORT)
            }
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Chat with the Ollama API
    pub async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let url = format!("{}/api/chat", self.base_url);

        let response = self.client.post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(error_from_response("Ollama", response).await);
        }

        response.json::<ChatResponse>().await
            .map_err(|e| ProviderError::ParseError(format!("Failed to parse Ollama chat response: {}", e)))
    }

    /// Get the Ollama API version
    pub async fn version(&self) -> Result<String, ProviderError> {
        let url = format!("{}/api/version", self.base_url);
        let response: serde_json::Value = self.client.get(&url)
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?
            .json()
            .await
            .map_err(|e| ProviderError::ParseError(format!("Failed to parse Ollama version response: {}", e)))?;

        response["version"].as_str()
            .map(|v| v.to_string())
            .ok_or_else(|| ProviderError::ParseError("Invalid version format in response".to_string()))
    }

    pub fn into_completion(response: ChatResponse) -> CompletionResponse {
        CompletionResponse {
            content: response.message.content,
            finish_reason: response.done_reason.or_else(|| response.done.then(|| "stop".to_string())),
            usage: TokenUsage::new(
                response.prompt_eval_count.unwrap_or(0),
                response.eval_count.unwrap_or(0),
            ),
        }
    }
}

#[async_trait]
impl Provider for Ollama {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let chat_request = ChatRequest::from_completion(&request, &self.model);
        debug!("Ollama chat request to model {} at {}", chat_request.model, self.base_url);
        let response = self.chat(&chat_request).await?;
        Ok(Self::into_completion(response))
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let version = self.version().await?;
        debug!("Connected to Ollama {}", version);
        Ok(())
    }
}
