//! Pacing for browser actions.
//!
//! A single page is driven sequentially, so one gate is enough: every
//! navigation or click waits until `min_interval` has passed since the
//! previous one. Between work items the orchestrator adds a random pause.

mod retry;

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

pub use retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum gap between outbound-triggering actions.
    pub min_interval_ms: u64,
    /// Bounds of the random pause between work items.
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 1_500,
            jitter_min_ms: 2_000,
            jitter_max_ms: 5_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// Counters reported in the run summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitStats {
    pub total_actions: u64,
    pub total_wait: Duration,
}

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    jitter: (Duration, Duration),
    last_action: Option<Instant>,
    stats: RateLimitStats,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, jitter: (Duration, Duration)) -> Self {
        let (low, high) = jitter;
        Self {
            min_interval,
            jitter: (low.min(high), low.max(high)),
            last_action: None,
            stats: RateLimitStats::default(),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_interval_ms),
            (
                Duration::from_millis(config.jitter_min_ms),
                Duration::from_millis(config.jitter_max_ms),
            ),
        )
    }

    /// Gate with no waiting at all.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO, (Duration::ZERO, Duration::ZERO))
    }

    /// Time left before the next action may start.
    pub fn time_until_ready(&self) -> Duration {
        match self.last_action {
            Some(last) => self.min_interval.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Wait until `min_interval` has passed since the previous action, then
    /// mark a new action as started.
    pub async fn acquire(&mut self) {
        let wait = self.time_until_ready();
        if wait > Duration::ZERO {
            debug!("Rate limiting: waiting {:?}", wait);
            tokio::time::sleep(wait).await;
            self.stats.total_wait += wait;
        }
        self.last_action = Some(Instant::now());
        self.stats.total_actions += 1;
    }

    /// Sleep for a uniformly random duration within the jitter bounds.
    pub async fn jitter(&mut self) -> Duration {
        let pause = self.jitter_duration();
        if pause > Duration::ZERO {
            debug!("Pausing {:?} before next item", pause);
            tokio::time::sleep(pause).await;
            self.stats.total_wait += pause;
        }
        pause
    }

    fn jitter_duration(&self) -> Duration {
        let (low, high) = self.jitter;
        if high <= low {
            return low;
        }
        let millis = rand::rng().random_range(low.as_millis() as u64..=high.as_millis() as u64);
        Duration::from_millis(millis)
    }

    pub fn stats(&self) -> RateLimitStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_enforces_min_interval() {
        let mut limiter = RateLimiter::new(Duration::from_secs(2), (Duration::ZERO, Duration::ZERO));
        limiter.acquire().await;
        assert!(limiter.time_until_ready() > Duration::ZERO);

        let start = tokio::time::Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(1_900));

        let stats = limiter.stats();
        assert_eq!(stats.total_actions, 2);
        assert!(stats.total_wait > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_stays_within_bounds() {
        let mut limiter = RateLimiter::new(
            Duration::ZERO,
            (Duration::from_millis(300), Duration::from_millis(100)),
        );
        for _ in 0..20 {
            let pause = limiter.jitter().await;
            assert!(pause >= Duration::from_millis(100));
            assert!(pause <= Duration::from_millis(300));
        }
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let mut limiter = RateLimiter::unlimited();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.jitter().await, Duration::ZERO);
        assert_eq!(limiter.stats().total_wait, Duration::ZERO);
    }
}
