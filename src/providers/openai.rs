use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::ProviderError;
use crate::providers::{
    error_from_response, http_client, map_transport_error, CompletionRequest, CompletionResponse,
    Provider, TokenUsage,
};

/// OpenAI client for the chat completions API
///
/// Any server speaking the same protocol (LM Studio, vLLM, llama.cpp server)
/// works with a different endpoint and an empty API key.
#[derive(Debug)]
pub struct OpenAI {
    /// Registry name
    name: String,
    /// HTTP client for API requests
    client: Client,
    /// API key for authentication, may be empty for local servers
    api_key: String,
    /// Base URL, e.g. `https://api.openai.com/v1`
    endpoint: String,
    /// Model used when the request does not name one
    model: String,
    timeout_secs: u64,
}

/// OpenAI chat completion request
#[derive(Debug, Serialize)]
pub struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

/// OpenAI message format
#[derive(Debug, Serialize, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

/// OpenAI chat completion response
#[derive(Debug, Deserialize)]
pub struct OpenAIResponse {
    pub choices: Vec<OpenAIChoice>,
    #[serde(default)]
    pub usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIChoice {
    pub message: OpenAIMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OpenAIUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
}

impl OpenAIRequest {
    /// Translate the uniform request into the vendor shape
    pub fn from_completion(request: &CompletionRequest, default_model: &str) -> Self {
        Self {
            model: request.model.clone().unwrap_or_else(|| default_model.to_string()),
            messages: request
                .messages
                .iter()
                .map(|m| OpenAIMessage {
                    role: m.role.as_str().to_string(),
                    content: Some(m.content.clone()),
                })
                .collect(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        }
    }
}

impl OpenAI {
    /// Create a new OpenAI-compatible client
    pub fn new(
        name: impl Into<String>,
        api_key: impl Into<String>,
        endpoint: impl Into<String>,
        model: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        Self {
            name: name.into(),
            client: http_client(timeout_secs),
            api_key: api_key.into(),
            endpoint: endpoint.into(),
            model: model.into(),
            timeout_secs,
        }
    }

    /// Resolve `<endpoint>/chat/completions`, keeping any path prefix such as `/v1`
    pub fn completions_url(endpoint: &str) -> Result<Url, ProviderError> {
        let base = if endpoint.trim().is_empty() {
            "https://api.openai.com/v1"
        } else {
            endpoint.trim()
        };
        let mut url = Url::parse(base)
            .map_err(|e| ProviderError::InvalidRequest(format!("Invalid endpoint '{}': {}", base, e)))?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        url.join("chat/completions")
            .map_err(|e| ProviderError::InvalidRequest(format!("Invalid endpoint '{}': {}", base, e)))
    }

    /// Send a raw vendor request
    pub async fn send(&self, request: &OpenAIRequest) -> Result<OpenAIResponse, ProviderError> {
        let url = Self::completions_url(&self.endpoint)?;
        let mut builder = self.client.post(url).json(request);
        if !self.api_key.is_empty() {
            builder = builder.bearer_auth(&self.api_key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(e, self.timeout_secs))?;

        if !response.status().is_success() {
            return Err(error_from_response("OpenAI", response).await);
        }

        response
            .json::<OpenAIResponse>()
            .await
            .map_err(|e| ProviderError::ParseError(format!("Failed to parse OpenAI API response: {}", e)))
    }

    /// Extract the first choice from a vendor response
    pub fn into_completion(response: OpenAIResponse) -> Result<CompletionResponse, ProviderError> {
        let usage = response
            .usage
            .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens))
            .unwrap_or_default();
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ParseError("OpenAI response contained no choices".to_string()))?;

        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            usage,
        })
    }
}

#[async_trait]
impl Provider for OpenAI {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let vendor_request = OpenAIRequest::from_completion(&request, &self.model);
        debug!("OpenAI request to model {} with {} messages", vendor_request.model, vendor_request.messages.len());
        let response = self.send(&vendor_request).await?;
        Self::into_completion(response)
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        let request = CompletionRequest::new().user("Hello").max_tokens(5);
        self.complete(request).await.map(|_| ())
    }
}
