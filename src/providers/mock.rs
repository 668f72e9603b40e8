/*!
 * Mock provider implementations for testing.
 *
 * This module provides a provider that simulates different behaviors without
 * any network access:
 * - `MockProvider::working(responder)` - Answers every request through a closure
 * - `MockProvider::scripted(replies)` - Replays a fixed sequence of replies
 * - `MockProvider::intermittent(n)` - Fails every Nth request with a 503
 * - `MockProvider::failing()` - Always fails with a 500
 * - `MockProvider::slow(ms)` - Sleeps before answering (timeout testing)
 *
 * Clones share their counters and recorded requests.
 */

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::errors::ProviderError;
use crate::providers::{CompletionRequest, CompletionResponse, Provider, TokenUsage};

/// Closure producing the content of a reply from a request
pub type Responder = Arc<dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync>;

/// One scripted reply
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Successful completion with this content
    Text(String),
    /// Failure with this error
    Error(ProviderError),
}

/// Behavior mode for the mock provider
#[derive(Clone)]
pub enum MockBehavior {
    /// Always answers through the responder
    Working(Responder),
    /// Replays replies in order, then repeats the last one
    Scripted(Arc<Mutex<VecDeque<MockReply>>>),
    /// Fails intermittently (every Nth request), otherwise echoes
    Intermittent { fail_every: usize },
    /// Always fails with an error
    Failing,
    /// Returns an empty completion
    Empty,
    /// Sleeps before answering through the responder
    Slow { delay_ms: u64, responder: Responder },
}

impl fmt::Debug for MockBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Working(_) => write!(f, "Working"),
            Self::Scripted(replies) => write!(f, "Scripted({} left)", replies.lock().len()),
            Self::Intermittent { fail_every } => write!(f, "Intermittent {{ fail_every: {} }}", fail_every),
            Self::Failing => write!(f, "Failing"),
            Self::Empty => write!(f, "Empty"),
            Self::Slow { delay_ms, .. } => write!(f, "Slow {{ delay_ms: {} }}", delay_ms),
        }
    }
}

/// Mock provider for testing pipeline behavior
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    behavior: MockBehavior,
    /// Request counter
    request_count: Arc<AtomicUsize>,
    /// Calls currently running
    in_flight: Arc<AtomicUsize>,
    /// Highest value `in_flight` reached
    peak_in_flight: Arc<AtomicUsize>,
    /// Every request received, in order
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl MockProvider {
    /// Create a new mock provider with the specified behavior
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            name: "mock".to_string(),
            behavior,
            request_count: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register under a different name
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create a working mock provider answering through `responder`
    pub fn working<F>(responder: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self::new(MockBehavior::Working(Arc::new(responder)))
    }

    /// Create a mock that replays `replies` in order
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        Self::new(MockBehavior::Scripted(Arc::new(Mutex::new(replies.into()))))
    }

    /// Create an intermittently failing mock provider
    pub fn intermittent(fail_every: usize) -> Self {
        Self::new(MockBehavior::Intermittent { fail_every: fail_every.max(1) })
    }

    /// Create a failing mock provider that always errors
    pub fn failing() -> Self {
        Self::new(MockBehavior::Failing)
    }

    /// Create a mock that returns empty responses
    pub fn empty() -> Self {
        Self::new(MockBehavior::Empty)
    }

    /// Create a mock that waits `delay_ms` before echoing the last message
    pub fn slow(delay_ms: u64) -> Self {
        Self::new(MockBehavior::Slow {
            delay_ms,
            responder: Arc::new(|request: &CompletionRequest| Ok(last_user_message(request))),
        })
    }

    /// Number of requests received so far
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Copy of every request received
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }

    async fn respond(&self, request: &CompletionRequest, count: usize) -> Result<String, ProviderError> {
        match &self.behavior {
            MockBehavior::Working(responder) => responder(request),
            MockBehavior::Scripted(replies) => {
                let reply = {
                    let mut replies = replies.lock();
                    if replies.len() > 1 {
                        replies.pop_front()
                    } else {
                        replies.front().cloned()
                    }
                };
                match reply {
                    Some(MockReply::Text(text)) => Ok(text),
                    Some(MockReply::Error(error)) => Err(error),
                    None => Err(ProviderError::RequestFailed("Mock script is empty".to_string())),
                }
            }
            MockBehavior::Intermittent { fail_every } => {
                if count % fail_every == fail_every - 1 {
                    Err(ProviderError::ApiError {
                        message: format!("Simulated intermittent failure (request #{})", count + 1),
                        status_code: 503,
                    })
                } else {
                    Ok(last_user_message(request))
                }
            }
            MockBehavior::Failing => Err(ProviderError::ApiError {
                message: "Simulated provider failure".to_string(),
                status_code: 500,
            }),
            MockBehavior::Empty => Ok(String::new()),
            MockBehavior::Slow { delay_ms, responder } => {
                tokio::time::sleep(tokio::time::Duration::from_millis(*delay_ms)).await;
                responder(request)
            }
        }
    }
}

/// Content of the final user message, or an empty string
pub fn last_user_message(request: &CompletionRequest) -> String {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == crate::providers::Role::User)
        .map(|m| m.content.clone())
        .unwrap_or_default()
}

/// Decrements the in-flight counter however the call ends
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let count = self.request_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push(request.clone());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(self.in_flight.clone());

        let content = self.respond(&request, count).await?;
        let prompt_tokens = request.messages.iter().map(|m| m.content.len() as u64).sum();
        Ok(CompletionResponse {
            usage: TokenUsage::new(prompt_tokens, content.len() as u64),
            content,
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn test_connection(&self) -> Result<(), ProviderError> {
        match self.behavior {
            MockBehavior::Failing => Err(ProviderError::ConnectionError("Simulated connection failure".to_string())),
            _ => Ok(()),
        }
    }
}
