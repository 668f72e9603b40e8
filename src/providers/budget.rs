/*!
 * Process-wide budget for outbound provider calls.
 *
 * All workers share one budget: a semaphore caps how many calls are in
 * flight, a minimum interval spaces out call starts, and every call is bounded
 * by a timeout. A call that exceeds the timeout becomes a transient
 * `ProviderError::Timeout`, so the job runner retries it later.
 */

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;

use crate::app_config::Config;
use crate::errors::ProviderError;
use crate::providers::{CompletionRequest, CompletionResponse, Provider};

/// Shared limiter wrapped around every provider call
#[derive(Debug)]
pub struct RequestBudget {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    min_interval: Duration,
    last_start: Mutex<Option<Instant>>,
    timeout: Duration,
}

impl RequestBudget {
    pub fn new(max_concurrent: usize, min_interval: Duration, timeout: Duration) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            min_interval,
            last_start: Mutex::new(None),
            timeout,
        }
    }

    /// Budget derived from the pipeline section and the active provider
    ///
    /// A provider rate limit, when configured, widens the spacing so the
    /// requests-per-minute ceiling holds.
    pub fn from_config(config: &Config) -> Self {
        let mut min_interval = Duration::from_millis(config.pipeline.min_request_interval_ms);
        if let Some(rpm) = config.translation.get_rate_limit().filter(|rpm| *rpm > 0) {
            min_interval = min_interval.max(Duration::from_millis(60_000 / u64::from(rpm)));
        }
        Self::new(
            config.pipeline.max_concurrent_requests,
            min_interval,
            Duration::from_secs(config.translation.get_timeout_secs()),
        )
    }

    /// Unbounded spacing and a generous timeout, for tests and tools
    pub fn unthrottled(max_concurrent: usize) -> Self {
        Self::new(max_concurrent, Duration::ZERO, Duration::from_secs(600))
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls currently holding a permit
    pub fn in_flight(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Wait for a permit and the spacing interval, then run one call under the timeout
    pub async fn call(
        &self,
        provider: &dyn Provider,
        request: CompletionRequest,
    ) -> Result<CompletionResponse, ProviderError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ProviderError::RequestFailed("Request budget closed".to_string()))?;

        self.wait_for_slot().await;

        match tokio::time::timeout(self.timeout, provider.complete(request)).await {
            Ok(result) => result,
            Err(_) => {
                let millis = self.timeout.as_millis() as u64;
                warn!("{} call exceeded {} ms", provider.name(), millis);
                Err(ProviderError::Timeout(millis))
            }
        }
    }

    async fn wait_for_slot(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let mut last_start = self.last_start.lock().await;
        if let Some(last) = *last_start {
            let elapsed = last.elapsed();
            if elapsed < self.min_interval {
                let wait_time = self.min_interval - elapsed;
                debug!("Request spacing: waiting {:?}", wait_time);
                tokio::time::sleep(wait_time).await;
            }
        }
        *last_start = Some(Instant::now());
    }
}
