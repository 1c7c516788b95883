//! Bounded exponential backoff for transient backend errors.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::BackendResult;

/// Retry policy applied to every backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Runs `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Returns the final result and the number of attempts made.
    pub async fn run<T, F, Fut>(&self, stack_id: &str, mut op: F) -> (BackendResult<T>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        stack = %stack_id,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Transient backend error, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
