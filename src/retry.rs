use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{IngestError, Result};

/// Bounded exponential backoff shared by connect, download and commit.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applied to each attempt individually, not to the whole run.
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): base * 2^retry, capped.
    pub fn backoff(&self, retry: u32) -> Duration {
        let shift = retry.min(16);
        self.base_delay
            .saturating_mul(1_u32 << shift)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. Uses [`IngestError::is_retryable`].
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_classified(operation, IngestError::is_retryable, op)
            .await
    }

    /// Same as [`run`](Self::run) with a caller-supplied classification.
    pub async fn run_classified<T, F, Fut, C>(
        &self,
        operation: &str,
        classify: C,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&IngestError) -> bool,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let result = match self.attempt_timeout {
                Some(limit) => tokio::time::timeout(limit, op())
                    .await
                    .unwrap_or_else(|_| {
                        Err(IngestError::Timeout {
                            operation: operation.to_string(),
                            after: limit,
                        })
                    }),
                None => op().await,
            };

            match result {
                Ok(value) => return Ok(value),
                Err(err) if attempt < max_attempts && classify(&err) => {
                    // A provider-requested wait overrides the backoff cap.
                    let backoff = self.backoff(attempt - 1);
                    let delay = err.retry_after().map_or(backoff, |wait| wait.max(backoff));
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            attempt_timeout: config.attempt_timeout_secs.map(Duration::from_secs),
        }
    }
}
