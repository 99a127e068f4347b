//! Bounded exponential-backoff retry policy for backend calls.
//!
//! `max_attempts` counts every call including the first. The delay before
//! attempt `k + 1` is `base * multiplier^(k - 1)`, clamped to `max_delay`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RetryPolicy {
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: u32,
    #[validate(range(min = 1))]
    pub base_delay_ms: u64,
    #[validate(range(min = 1))]
    pub max_delay_ms: u64,
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
    /// Upper bound on a single backend call.
    #[validate(range(min = 1))]
    pub call_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            call_timeout_secs: 10,
        }
    }
}

impl RetryPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Calculate the next backoff delay from the current one.
    ///
    /// The result is clamped to [`max_delay`](Self::max_delay).
    pub fn next_delay(&self, current: Duration) -> Duration {
        let next_ms = (current.as_millis() as f64 * self.multiplier) as u64;
        Duration::from_millis(next_ms).min(self.max_delay())
    }

    /// Every delay slept between attempts, in order.
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::with_capacity(self.max_attempts.saturating_sub(1) as usize);
        let mut delay = self.base_delay().min(self.max_delay());
        for _ in 1..self.max_attempts {
            delays.push(delay);
            delay = self.next_delay(delay);
        }
        delays
    }

    /// Total time spent sleeping when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        self.backoff_schedule().into_iter().sum()
    }

    /// Field ranges plus `base_delay <= max_delay`.
    pub fn check(&self) -> Result<(), String> {
        self.validate().map_err(|e| format!("retry: {e}"))?;
        if self.base_delay_ms > self.max_delay_ms {
            return Err("retry.base_delay_ms must not exceed retry.max_delay_ms".into());
        }
        Ok(())
    }
}
