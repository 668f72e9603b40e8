/*!
 * Retry decisions for failed jobs.
 *
 * Transient provider failures and storage errors back off exponentially
 * until the job runs out of attempts. Unusable model output is retried a
 * small fixed number of times. Permanent provider failures and requests
 * that can never run are final.
 */

use rand::Rng;
use std::time::Duration;

use crate::app_config::Config;
use crate::database::models::JobRecord;
use crate::errors::{PipelineError, ProviderErrorKind};

/// What to do with a job after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Release the job and run it again after `delay`
    Retry { delay: Duration },
    /// Stop retrying
    Dead,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Retries allowed for parsing and validation failures
    pub parse_retry_limit: u32,
    /// Add up to a quarter of the delay at random
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_backoff_ms: 1000,
            max_backoff_ms: 60_000,
            parse_retry_limit: 1,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            retry_backoff_ms: config.pipeline.retry_backoff_ms,
            max_backoff_ms: config.pipeline.max_backoff_ms,
            parse_retry_limit: config.pipeline.parse_retry_limit,
            jitter: true,
        }
    }

    /// Policy without jitter, for predictable schedules
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Backoff before attempt `attempts + 1`, after `attempts` tries
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(20);
        let base = self
            .retry_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        let jitter = if self.jitter && base >= 4 {
            rand::rng().random_range(0..=base / 4)
        } else {
            0
        };
        Duration::from_millis(base + jitter)
    }

    /// Decide the next step for `job`, whose attempt counter already includes
    /// the attempt that just failed
    pub fn decide(&self, error: &PipelineError, job: &JobRecord) -> Disposition {
        let attempts_left = job.attempts < job.max_attempts;
        match error {
            PipelineError::InvalidRequest(_) => Disposition::Dead,
            PipelineError::Provider { source, .. } => match source.kind() {
                ProviderErrorKind::Transient if attempts_left => Disposition::Retry {
                    delay: self.backoff(job.attempts),
                },
                _ => Disposition::Dead,
            },
            PipelineError::Storage { .. } | PipelineError::ConcurrencyConflict(_) if attempts_left => {
                Disposition::Retry {
                    delay: self.backoff(job.attempts),
                }
            }
            PipelineError::ResponseParsing { .. } | PipelineError::Validation { .. }
                if attempts_left && job.parse_failures < self.parse_retry_limit =>
            {
                Disposition::Retry {
                    delay: Duration::from_millis(self.retry_backoff_ms),
                }
            }
            _ => Disposition::Dead,
        }
    }
}

/// Whether `error` counts against the parse retry limit
pub fn is_parse_failure(error: &PipelineError) -> bool {
    matches!(
        error,
        PipelineError::ResponseParsing { .. } | PipelineError::Validation { .. }
    )
}
