//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, ScrapeError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_delay_ms as f64) as u64)
    }

    /// Pause before retrying after `error` on attempt `attempt`, or None if
    /// the error is not transient or attempts are used up.
    pub fn retry_delay(&self, error: &ScrapeError, attempt: u32) -> Option<Duration> {
        if error.is_transient() && attempt < self.max_attempts.max(1) {
            Some(self.delay_after(attempt))
        } else {
            None
        }
    }

    /// Run `f` until it succeeds, fails with a non-transient error, or runs
    /// out of attempts. `f` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, op: &str, mut f: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            let error = match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let Some(delay) = self.retry_delay(&error, attempt) else {
                return Err(error);
            };
            warn!(op, attempt, "Transient failure, retrying in {:?}: {}", delay, error);
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
