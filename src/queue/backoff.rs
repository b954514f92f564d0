//! Retry policy
//!
//! Backoff is an explicit function of the attempt number so the schedule can
//! be unit-tested without a queue or a clock: base delay doubling per failed
//! attempt, capped, with +/-10% jitter to spread thundering retries.

use std::time::Duration;

use rand::Rng;

use crate::config::QueueConfig;

/// Exponent clamp so the doubling shift can never overflow.
const MAX_BACKOFF_EXPONENT: u32 = 20;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Failure-retry ceiling: a job may be re-queued at most this many times.
    pub max_attempts: u32,
    /// Stall-retry ceiling, counted separately from failure retries.
    pub max_stalled: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &QueueConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts,
            max_stalled: cfg.max_stalled_retries,
            base_delay: Duration::from_millis(cfg.backoff_base_ms),
            max_delay: Duration::from_millis(cfg.backoff_cap_ms),
        }
    }

    /// Delay before the given attempt runs. `attempt` is 1-based: attempt 1 is
    /// the first retry after the initial execution failed.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        let cap = self.max_delay.as_millis() as u64;
        let floor = base.min(cap);

        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let raw = base.saturating_mul(1u64 << exponent).min(cap);

        let jitter = rand::thread_rng().gen_range(0.9..=1.1);
        let delayed = (raw as f64 * jitter) as u64;

        Duration::from_millis(delayed.clamp(floor, cap))
    }

    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_stalled: 1,
            base_delay: Duration::from_millis(2_000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}
