//! Backoff between broker connection attempts.
//!
//! `MaxRetries` counts every attempt, the first one included. The wait after
//! a failed attempt starts at `RetryDelayMs`, doubles after each further
//! failure up to `RetryMaxDelayMs`, and is spread by a quarter either way so
//! workers restarted together do not reconnect in lockstep.

use crate::options::QueueOptions;
use rand::Rng;
use std::time::Duration;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Fraction of the wait added or removed at random
const JITTER_FRACTION: f64 = 0.25;

/// Attempt budget and waits of [`crate::RetryingConnection`]
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectBackoff {
    attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl ConnectBackoff {
    pub fn from_options(options: &QueueOptions) -> Self {
        Self {
            attempts: options.max_retries.max(1),
            initial_delay: Duration::from_millis(options.retry_delay_ms),
            max_delay: Duration::from_millis(options.retry_max_delay_ms.max(options.retry_delay_ms)),
        }
    }

    /// Connection attempts made before giving up
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Whether failed attempt `attempt` (1-based) may be followed by another
    pub fn allows_retry_after(&self, attempt: u32) -> bool {
        attempt < self.attempts
    }

    /// Wait after failed attempt `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        let spread = base * JITTER_FRACTION;
        if spread <= 0.0 {
            return Duration::from_secs_f64(base);
        }

        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base + jitter).max(0.0))
    }

    /// `initial * 2^(attempt - 1)`, capped at the maximum delay
    fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * BACKOFF_MULTIPLIER.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}
