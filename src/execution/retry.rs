//! Retry policy for transient step failures.
//!
//! Only `network` and `timeout` failures are retried. The delay doubles
//! with every retry and is capped at `max_delay_ms`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StepError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    /// Default: 3 attempts, 200ms base delay, 5s cap.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, 0, 0)
    }

    /// Whether another attempt may follow `retries_done` retries.
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        retries_done.saturating_add(1) < self.max_attempts
    }

    /// Whether `err` should be retried after `retries_done` retries.
    pub fn should_retry(&self, err: &StepError, retries_done: u32) -> bool {
        err.is_retryable() && self.allows_retry(retries_done)
    }

    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay_ms(&self, retry: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(retry))
            .min(self.max_delay_ms)
    }

    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_millis(self.delay_ms(retry))
    }
}
