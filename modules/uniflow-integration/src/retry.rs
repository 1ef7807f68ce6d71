//! Bounded exponential backoff shared by the dispatcher and the publisher.

use std::time::Duration;

use rand::Rng;
use uniflow_common::Config;

/// Retry schedule: `base_delay * multiplier^(attempt-1)` plus jitter,
/// capped at `max_attempts` attempts total.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, multiplier: u32) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.max_integration_attempts,
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
        }
    }

    /// Delay to sleep after the given failed attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(self.multiplier.saturating_pow(exponent));
        if backoff.is_zero() {
            return backoff;
        }
        let jitter_cap = (backoff.as_millis() as u64 / 4).max(1);
        backoff + Duration::from_millis(rand::rng().random_range(0..jitter_cap))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            multiplier: 2,
        }
    }
}
