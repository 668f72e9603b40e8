/*!
 * Tests for error types and conversions
 */

use namesake::errors::{AppError, Diagnostics, ErrorDetail, PipelineError, ProviderError, DEFAULT_DIAGNOSTIC_CHARS};

#[test]
fn test_providerError_requestFailed_shouldDisplayCorrectly() {
    let error = ProviderError::RequestFailed("Connection timeout".to_string());
    let display = format!("{}", error);
    assert!(display.contains("API request failed"));
    assert!(display.contains("Connection timeout"));
}

#[test]
fn test_providerError_apiError_shouldDisplayStatusAndMessage() {
    let error = ProviderError::ApiError {
        status_code: 503,
        message: "Overloaded".to_string(),
    };
    let display = format!("{}", error);
    assert!(display.contains("503"));
    assert!(display.contains("Overloaded"));
    assert_eq!(error.http_status(), Some(503));
}

#[test]
fn test_providerError_permanentFailures_shouldNotBeTransient() {
    assert!(!ProviderError::AuthenticationError("bad key".to_string()).is_transient());
    assert!(!ProviderError::InvalidRequest("unknown model".to_string()).is_transient());
    assert!(ProviderError::ConnectionError("refused".to_string()).is_transient());
    assert!(ProviderError::RateLimitExceeded("slow down".to_string()).is_transient());
}

#[test]
fn test_diagnostics_shouldTruncateLongPrompts() {
    let prompt = "字".repeat(50);
    let diagnostics = Diagnostics::new(&prompt, Some("short"), 10);
    assert!(diagnostics.prompt.starts_with(&"字".repeat(10)));
    assert!(diagnostics.prompt.chars().count() < 50);
    assert_eq!(diagnostics.raw_response.as_deref(), Some("short"));
    assert!(DEFAULT_DIAGNOSTIC_CHARS >= 1000);
}

#[test]
fn test_pipelineError_kindLabels_shouldBeStable() {
    let validation = PipelineError::Validation {
        message: "content is empty".to_string(),
        diagnostics: Diagnostics::default(),
    };
    assert_eq!(validation.kind_label(), "validation");

    let invalid = PipelineError::InvalidRequest("Chapter 3 not found".to_string());
    assert_eq!(invalid.kind_label(), "invalid_request");
    assert!(invalid.diagnostics().is_none());

    let conflict = PipelineError::ConcurrencyConflict("job 7 claimed elsewhere".to_string());
    assert_eq!(conflict.kind_label(), "concurrency_conflict");
    assert!(conflict.diagnostics().is_none());

    let permanent = PipelineError::Provider {
        source: ProviderError::from_status(401, "bad key"),
        diagnostics: Diagnostics::default(),
    };
    assert_eq!(permanent.kind_label(), "provider_permanent");
}

#[test]
fn test_errorDetail_shouldSkipAbsentFields() {
    let detail = PipelineError::ConcurrencyConflict("lost claim".to_string()).detail();
    let json = detail.to_json();
    assert!(!json.contains("prompt"));
    assert!(!json.contains("http_status"));

    let parsed: ErrorDetail = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.kind, "concurrency_conflict");
    assert!(parsed.message.contains("lost claim"));
}

#[test]
fn test_appError_conversions_shouldWrapSources() {
    let from_provider: AppError = ProviderError::NotConfigured("openai".to_string()).into();
    assert!(matches!(from_provider, AppError::Provider(_)));

    let from_pipeline: AppError = PipelineError::ConcurrencyConflict("x".to_string()).into();
    assert!(format!("{}", from_pipeline).contains("Pipeline error"));

    let from_io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
    assert!(matches!(from_io, AppError::File(_)));

    let from_anyhow: AppError = anyhow::anyhow!("boom").into();
    assert!(matches!(from_anyhow, AppError::Unknown(message) if message == "boom"));
}
