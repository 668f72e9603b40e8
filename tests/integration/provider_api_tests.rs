/*!
 * Integration tests for provider API interactions
 *
 * Adapters are exercised against a one-shot local HTTP server. Tests against
 * live services are ignored by default and read their settings from the
 * environment.
 */

use std::env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use namesake::errors::{ProviderError, ProviderErrorKind};
use namesake::providers::anthropic::Anthropic;
use namesake::providers::ollama::Ollama;
use namesake::providers::openai::OpenAI;
use namesake::providers::{CompletionRequest, Provider};

/// Serve one canned response; the handle yields the raw request received
async fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());

    let handle = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buffer = [0u8; 4096];
        loop {
            let read = socket.read(&mut buffer).await.unwrap();
            if read == 0 {
                break;
            }
            received.extend_from_slice(&buffer[..read]);
            let text = String::from_utf8_lossy(&received);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let content_length = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if received.len() >= header_end + 4 + content_length {
                    break;
                }
            }
        }

        let response = format!(
            "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        socket.write_all(response.as_bytes()).await.unwrap();
        socket.shutdown().await.ok();
        String::from_utf8_lossy(&received).into_owned()
    });

    (address, handle)
}

fn request() -> CompletionRequest {
    CompletionRequest::new()
        .system("Answer in JSON")
        .user("李伟")
        .temperature(0.0)
        .max_tokens(64)
}

/// OpenAI-compatible servers get the full chat request and bearer auth
#[tokio::test]
async fn test_openai_complete_shouldSendChatRequestAndReadReply() {
    let (address, server) = serve_once(
        200,
        r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\":true}"},"finish_reason":"stop"}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#,
    )
    .await;
    let provider = OpenAI::new("openai", "sk-test", format!("{}/v1", address), "gpt-4o-mini", 5);

    let response = provider.complete(request()).await.unwrap();
    let raw_request = server.await.unwrap();

    assert_eq!(response.content, r#"{"ok":true}"#);
    assert_eq!(response.usage.total_tokens, 15);
    assert!(raw_request.starts_with("POST /v1/chat/completions"));
    assert!(raw_request.to_lowercase().contains("authorization: bearer sk-test"));
    assert!(raw_request.contains("\"model\":\"gpt-4o-mini\""));
    assert!(raw_request.contains("\"role\":\"system\""));
}

/// Rate limiting is a transient failure
#[tokio::test]
async fn test_openai_complete_withRateLimit_shouldBeTransient() {
    let (address, _server) = serve_once(429, r#"{"error":{"message":"slow down"}}"#).await;
    let provider = OpenAI::new("openai", "", address, "local-model", 5);

    let err = provider.complete(request()).await.unwrap_err();

    assert!(matches!(err, ProviderError::RateLimitExceeded(ref m) if m.contains("slow down")));
    assert_eq!(err.kind(), ProviderErrorKind::Transient);
}

/// Bad credentials are permanent
#[tokio::test]
async fn test_anthropic_complete_withBadKey_shouldBePermanent() {
    let (address, server) = serve_once(401, r#"{"type":"error","error":{"type":"authentication_error"}}"#).await;
    let provider = Anthropic::new("anthropic", "bad-key", address, "claude-3-5-haiku-latest", 5);

    let err = provider.complete(request()).await.unwrap_err();
    let raw_request = server.await.unwrap();

    assert!(matches!(err, ProviderError::AuthenticationError(_)));
    assert_eq!(err.kind(), ProviderErrorKind::Permanent);
    assert!(raw_request.starts_with("POST /v1/messages"));
    assert!(raw_request.contains("\"system\":\"Answer in JSON\""));
}

/// Anthropic text blocks are joined into one reply
#[tokio::test]
async fn test_anthropic_complete_shouldJoinTextBlocks() {
    let (address, _server) = serve_once(
        200,
        r#"{"content":[{"type":"text","text":"{\"a\":"},{"type":"text","text":"1}"}],"stop_reason":"end_turn","usage":{"input_tokens":9,"output_tokens":4}}"#,
    )
    .await;
    let provider = Anthropic::new("anthropic", "key", address, "claude-3-5-haiku-latest", 5);

    let response = provider.complete(request()).await.unwrap();

    assert_eq!(response.content, r#"{"a":1}"#);
    assert_eq!(response.finish_reason.as_deref(), Some("end_turn"));
    assert_eq!(response.usage.total_tokens, 13);
}

/// Ollama replies are read from the non-streaming chat endpoint
#[tokio::test]
async fn test_ollama_complete_shouldUseChatEndpoint() {
    let (address, server) = serve_once(
        200,
        r#"{"model":"qwen2.5:14b","message":{"role":"assistant","content":"done"},"done":true,"prompt_eval_count":20,"eval_count":2}"#,
    )
    .await;
    let provider = Ollama::new("ollama", address, "qwen2.5:14b", 5);

    let response = provider.complete(request()).await.unwrap();
    let raw_request = server.await.unwrap();

    assert_eq!(response.content, "done");
    assert_eq!(response.finish_reason.as_deref(), Some("stop"));
    assert!(raw_request.starts_with("POST /api/chat"));
    assert!(raw_request.contains("\"stream\":false"));
}

/// Server errors from Ollama are retryable
#[tokio::test]
async fn test_ollama_complete_withServerError_shouldBeTransient() {
    let (address, _server) = serve_once(500, r#"{"error":"model crashed"}"#).await;
    let provider = Ollama::new("ollama", address, "qwen2.5:14b", 5);

    let err = provider.complete(request()).await.unwrap_err();

    assert_eq!(err.http_status(), Some(500));
    assert!(err.is_transient());
}

/// Nothing listening is a connection failure
#[tokio::test]
async fn test_openai_complete_withNoServer_shouldBeConnectionError() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let provider = OpenAI::new("openai", "", address, "local-model", 5);

    let err = provider.complete(request()).await.unwrap_err();

    assert!(err.is_transient());
}

/// Live check against a local Ollama server
#[tokio::test]
#[ignore]
async fn test_ollama_live_shouldAnswer() {
    let endpoint = env::var("OLLAMA_ENDPOINT").unwrap_or_else(|_| "http://localhost:11434".to_string());
    let model = env::var("OLLAMA_MODEL").unwrap_or_else(|_| "qwen2.5:7b".to_string());
    let provider = Ollama::new("ollama", endpoint, model, 120);

    provider.test_connection().await.unwrap();
    let response = provider
        .complete(CompletionRequest::new().user("Reply with the single word: ok").max_tokens(8))
        .await
        .unwrap();
    assert!(!response.content.trim().is_empty());
}

/// Live check against the OpenAI API
#[tokio::test]
#[ignore]
async fn test_openai_live_shouldAnswer() {
    let Ok(api_key) = env::var("OPENAI_API_KEY") else {
        return;
    };
    let provider = OpenAI::new("openai", api_key, "https://api.openai.com/v1", "gpt-4o-mini", 60);

    provider.test_connection().await.unwrap();
}

/// Live check against the Anthropic API
#[tokio::test]
#[ignore]
async fn test_anthropic_live_shouldAnswer() {
    let Ok(api_key) = env::var("ANTHROPIC_API_KEY") else {
        return;
    };
    let provider = Anthropic::new("anthropic", api_key, "", "claude-3-5-haiku-latest", 60);

    provider.test_connection().await.unwrap();
}
