//! Redelivery policy: bounded attempts, exponential backoff, equal jitter.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Deliveries (including the first) before an event is dead-lettered
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: u32,
    /// Equal jitter: half the delay is fixed, half is random
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff_ms: 200,
            max_backoff_ms: 60_000,
            multiplier: 2,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering after `attempt` failed (attempt starts at 1)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let factor = (self.multiplier.max(1) as u64).saturating_pow(exp);
        let ceiling = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms);

        if !self.jitter || ceiling < 2 {
            return Duration::from_millis(ceiling);
        }
        let half = ceiling / 2;
        let spread = rand::thread_rng().gen_range(0..=ceiling - half);
        Duration::from_millis(half + spread)
    }

    /// True once `attempt` deliveries have been used up
    #[inline]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}
