//! Per-queue circuit breakers.
//!
//! A breaker stops the processor from polling a queue whose handlers or
//! store keep failing, and lets it probe again after a cooldown.
//!
//! # Circuit Breaker States
//!
//! - **Closed**: Normal operation, polling allowed
//! - **Open**: Too many consecutive failures, polling refused until the
//!   cooldown has passed
//! - **Half-Open**: Cooldown passed, polling allowed to test recovery. Probes
//!   are not serialized; every caller is let through until a result arrives.
//!
//! Open to Half-Open is evaluated lazily in `can_execute`; there are no timers.
//!
//! # Example
//!
//! ```rust
//! use queue_leveler_core::circuit_breaker::{
//!     CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
//! };
//!
//! let registry = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
//!
//! assert!(registry.can_execute("orders"));
//! for _ in 0..5 {
//!     registry.record_failure("orders");
//! }
//! assert_eq!(registry.state("orders"), CircuitState::Open);
//! assert!(!registry.can_execute("orders"));
//! ```

use crate::error::ConfigurationError;
use crate::message::Timestamp;
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

mod breaker;
pub use breaker::QueueCircuitBreaker;

// ============================================================================
// Circuit State
// ============================================================================

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, allowing processing.
    Closed,

    /// Circuit is open, refusing processing until the cooldown passes.
    Open,

    /// Circuit is half-open, allowing probes.
    HalfOpen,
}

impl CircuitState {
    /// Check if processing is allowed in this state.
    pub fn allows_requests(&self) -> bool {
        matches!(self, Self::Closed | Self::HalfOpen)
    }

    /// Check if circuit is in failure state.
    pub fn is_failure_state(&self) -> bool {
        matches!(self, Self::Open | Self::HalfOpen)
    }

    /// Gauge value reported to metrics (0=closed, 1=open, 2=half-open).
    pub fn as_metric_value(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        write!(f, "{}", name)
    }
}

// ============================================================================
// Circuit Breaker Configuration
// ============================================================================

/// Configuration for circuit breaker behavior.
///
/// # Default Configuration
///
/// - Failure threshold: 5 consecutive failures
/// - Recovery timeout: 30 seconds
/// - Success threshold: 1 success in half-open to close
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures to trip circuit.
    pub failure_threshold: u32,

    /// Time circuit stays open before allowing probes (seconds).
    pub recovery_timeout_seconds: u64,

    /// Number of successes needed to close circuit from half-open.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_seconds: 30,
            success_threshold: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Cooldown between tripping and the first probe.
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }

    /// Validate value ranges.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.failure_threshold == 0 {
            return Err(ConfigurationError::Invalid {
                message: "circuit_breaker.failure_threshold must be at least 1".to_string(),
            });
        }
        if self.success_threshold == 0 {
            return Err(ConfigurationError::Invalid {
                message: "circuit_breaker.success_threshold must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Circuit Metrics
// ============================================================================

/// Metrics and statistics for one queue's circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitMetrics {
    /// Queue the breaker guards.
    pub queue_name: String,

    /// Current circuit state.
    pub state: CircuitState,

    /// Total outcomes recorded.
    pub total_requests: u64,

    /// Number of recorded successes.
    pub successful_requests: u64,

    /// Number of recorded failures.
    pub failed_requests: u64,

    /// Number of `can_execute` calls refused by the open circuit.
    pub rejected_requests: u64,

    /// Consecutive failures since the last success or state change.
    pub consecutive_failures: u32,

    /// Consecutive successes in half-open state.
    pub consecutive_successes: u32,

    /// Time when circuit last changed state.
    pub last_state_change: Timestamp,

    /// Time after which an open circuit allows a probe.
    pub next_attempt_time: Option<Timestamp>,
}

impl CircuitMetrics {
    /// Success rate from 0.0 to 1.0, or 1.0 if nothing recorded.
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            1.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Failure rate from 0.0 to 1.0, or 0.0 if nothing recorded.
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failed_requests as f64 / self.total_requests as f64
        }
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Lazily created circuit breakers keyed by queue name.
///
/// Breakers live for the life of the registry or until [`reset`](Self::reset).
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: RwLock<HashMap<String, Arc<QueueCircuitBreaker>>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl CircuitBreakerRegistry {
    /// Create a registry that reports nowhere.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoOpMetricsCollector))
    }

    /// Create a registry reporting state changes to `metrics`.
    pub fn with_metrics(config: CircuitBreakerConfig, metrics: Arc<dyn MetricsCollector>) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `queue_name`, created on first use.
    pub fn breaker(&self, queue_name: &str) -> Arc<QueueCircuitBreaker> {
        if let Some(breaker) = self.existing(queue_name) {
            return breaker;
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(breakers.entry(queue_name.to_string()).or_insert_with(|| {
            Arc::new(QueueCircuitBreaker::new(
                queue_name,
                self.config.clone(),
                Arc::clone(&self.metrics),
            ))
        }))
    }

    /// Whether processing of `queue_name` may proceed.
    pub fn can_execute(&self, queue_name: &str) -> bool {
        self.breaker(queue_name).can_execute()
    }

    pub fn record_success(&self, queue_name: &str) {
        self.breaker(queue_name).record_success();
    }

    pub fn record_failure(&self, queue_name: &str) {
        self.breaker(queue_name).record_failure();
    }

    /// State of `queue_name`'s breaker; `Closed` if none exists yet.
    pub fn state(&self, queue_name: &str) -> CircuitState {
        self.existing(queue_name)
            .map(|breaker| breaker.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Metrics of `queue_name`'s breaker, if one exists.
    pub fn metrics(&self, queue_name: &str) -> Option<CircuitMetrics> {
        self.existing(queue_name).map(|breaker| breaker.metrics())
    }

    /// Metrics of every breaker.
    pub fn all_metrics(&self) -> Vec<CircuitMetrics> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|breaker| breaker.metrics())
            .collect()
    }

    /// Force `queue_name`'s breaker closed and clear its counters.
    pub fn reset(&self, queue_name: &str) {
        if let Some(breaker) = self.existing(queue_name) {
            breaker.reset();
        }
    }

    fn existing(&self, queue_name: &str) -> Option<Arc<QueueCircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .cloned()
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
