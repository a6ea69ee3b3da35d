//! # Redelivery Policy Module
//!
//! Backoff applied to abandoned messages before they become visible again,
//! and the delivery-count ceiling after which they are dead-lettered.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Shape of the delay curve between redelivery attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay for every attempt
    Fixed,
    /// `initial * delivery_count`
    Linear,
    /// `initial * multiplier^(delivery_count - 1)`
    Exponential,
}

/// Redelivery policy for abandoned messages
///
/// # Examples
///
/// ```rust
/// use queue_leveler_core::retry::{BackoffKind, RedeliveryPolicy};
/// use std::time::Duration;
///
/// let policy = RedeliveryPolicy::new(
///     BackoffKind::Exponential,
///     Duration::from_secs(1),
///     Duration::from_secs(60),
///     2.0,
/// );
/// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedeliveryPolicy {
    /// Delivery count at which a message is dead-lettered instead of retried
    pub max_delivery_count: u32,

    /// Curve used to compute delays
    pub backoff: BackoffKind,

    /// Base delay in milliseconds
    pub initial_delay_ms: u64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier (typically 2.0)
    pub backoff_multiplier: f64,

    /// Jitter range as a fraction of the delay (0.0 disables jitter)
    pub jitter_percent: f64,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_delivery_count: 5,
            backoff: BackoffKind::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_percent: 0.0,
        }
    }
}

impl RedeliveryPolicy {
    /// Create a policy without jitter using the default delivery ceiling
    pub fn new(
        backoff: BackoffKind,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            backoff,
            initial_delay_ms: initial_delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
            backoff_multiplier,
            ..Self::default()
        }
    }

    /// Set the delivery count that triggers dead-lettering
    pub fn with_max_delivery_count(mut self, max_delivery_count: u32) -> Self {
        self.max_delivery_count = max_delivery_count;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Base delay
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    /// Delay cap
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay before a message abandoned for the `delivery_count`-th time
    /// becomes visible again. Counts below 1 are treated as 1.
    pub fn delay_for(&self, delivery_count: u32) -> Duration {
        let attempt = delivery_count.max(1);
        let initial_secs = self.initial_delay().as_secs_f64();

        let base_secs = match self.backoff {
            BackoffKind::Fixed => initial_secs,
            BackoffKind::Linear => initial_secs * attempt as f64,
            BackoffKind::Exponential => {
                // Clamp the exponent so huge delivery counts cannot overflow to inf
                let exponent = (attempt - 1).min(1_000) as i32;
                initial_secs * self.backoff_multiplier.powi(exponent)
            }
        };

        let capped_secs = if base_secs.is_finite() {
            base_secs.min(self.max_delay().as_secs_f64())
        } else {
            self.max_delay().as_secs_f64()
        };

        let final_secs = if self.jitter_percent > 0.0 {
            Self::add_jitter(capped_secs, self.jitter_percent)
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Check if a message with `delivery_count` deliveries must be dead-lettered
    pub fn is_exhausted(&self, delivery_count: u32) -> bool {
        delivery_count >= self.max_delivery_count
    }

    /// Applies random variation in range [delay * (1-jitter), delay * (1+jitter)]
    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
