//! Circuit breaker for a single queue.
//!
//! State lives behind a `RwLock` and is only touched by short synchronous
//! sections, never across an await.

use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tracing::{info, warn};

use super::{CircuitBreakerConfig, CircuitMetrics, CircuitState};
use crate::message::Timestamp;
use crate::monitoring::MetricsCollector;

// ============================================================================
// Internal State
// ============================================================================

#[derive(Debug)]
struct InternalState {
    /// Current circuit state
    current_state: CircuitState,

    /// Consecutive failures since last success or state change
    consecutive_failures: u32,

    /// Consecutive successes in half-open state
    consecutive_successes: u32,

    /// Timestamp of last state change
    last_state_change: Timestamp,

    /// Timestamp after which an open circuit allows a probe
    next_attempt_time: Option<Timestamp>,

    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    rejected_requests: u64,
}

impl InternalState {
    fn new() -> Self {
        Self {
            current_state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_state_change: Timestamp::now(),
            next_attempt_time: None,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            rejected_requests: 0,
        }
    }
}

// ============================================================================
// Queue Circuit Breaker
// ============================================================================

/// Consecutive-failure circuit breaker guarding one queue.
pub struct QueueCircuitBreaker {
    queue_name: String,
    config: CircuitBreakerConfig,
    state: RwLock<InternalState>,
    metrics: Arc<dyn MetricsCollector>,
}

impl QueueCircuitBreaker {
    /// Create a closed breaker.
    pub fn new(
        queue_name: &str,
        config: CircuitBreakerConfig,
        metrics: Arc<dyn MetricsCollector>,
    ) -> Self {
        Self {
            queue_name: queue_name.to_string(),
            config,
            state: RwLock::new(InternalState::new()),
            metrics,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Whether processing may proceed.
    ///
    /// An open circuit whose cooldown has passed moves to half-open here and
    /// returns `true`.
    pub fn can_execute(&self) -> bool {
        let mut state = self.write();

        match state.current_state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let due = state
                    .next_attempt_time
                    .map_or(true, |next| Timestamp::now() > next);
                if due {
                    self.transition_to_half_open(&mut state);
                    true
                } else {
                    state.rejected_requests += 1;
                    false
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut state = self.write();
        state.successful_requests += 1;
        state.total_requests += 1;
        state.consecutive_failures = 0;

        match state.current_state {
            CircuitState::Closed => {
                // Normal operation, no state change
            }
            CircuitState::HalfOpen => {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    self.close_circuit(&mut state);
                }
            }
            CircuitState::Open => {
                // Result of work started before the circuit tripped
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut state = self.write();
        state.failed_requests += 1;
        state.total_requests += 1;
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;

        match state.current_state {
            CircuitState::Closed => {
                if state.consecutive_failures >= self.config.failure_threshold {
                    self.trip_circuit(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                // Any failure in half-open state trips the circuit
                self.trip_circuit(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without evaluating the cooldown.
    pub fn state(&self) -> CircuitState {
        self.state
            .read()
            .map(|state| state.current_state)
            .unwrap_or(CircuitState::Open) // Fail-safe: treat lock poisoning as open
    }

    /// Current metrics.
    pub fn metrics(&self) -> CircuitMetrics {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);

        CircuitMetrics {
            queue_name: self.queue_name.clone(),
            state: state.current_state,
            total_requests: state.total_requests,
            successful_requests: state.successful_requests,
            failed_requests: state.failed_requests,
            rejected_requests: state.rejected_requests,
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_state_change: state.last_state_change,
            next_attempt_time: state.next_attempt_time,
        }
    }

    /// Force the circuit closed and clear all counters (admin operation).
    pub fn reset(&self) {
        let mut state = self.write();
        self.close_circuit(&mut state);
        state.total_requests = 0;
        state.successful_requests = 0;
        state.failed_requests = 0;
        state.rejected_requests = 0;
    }

    fn write(&self) -> RwLockWriteGuard<'_, InternalState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition circuit to open state.
    fn trip_circuit(&self, state: &mut InternalState) {
        let now = Timestamp::now();
        let next_attempt = now.add_duration(self.config.recovery_timeout());
        state.current_state = CircuitState::Open;
        state.last_state_change = now;
        state.next_attempt_time = Some(next_attempt);
        state.consecutive_successes = 0;

        warn!(
            queue_name = %self.queue_name,
            consecutive_failures = state.consecutive_failures,
            next_attempt = %next_attempt,
            "Circuit breaker opened"
        );
        self.metrics
            .record_circuit_breaker_state(&self.queue_name, CircuitState::Open.as_metric_value());
    }

    /// Transition circuit to half-open state.
    fn transition_to_half_open(&self, state: &mut InternalState) {
        state.current_state = CircuitState::HalfOpen;
        state.last_state_change = Timestamp::now();
        state.next_attempt_time = None;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;

        info!(queue_name = %self.queue_name, "Circuit breaker half-open; probing");
        self.metrics.record_circuit_breaker_state(
            &self.queue_name,
            CircuitState::HalfOpen.as_metric_value(),
        );
    }

    /// Transition circuit to closed state.
    fn close_circuit(&self, state: &mut InternalState) {
        let was = state.current_state;
        state.current_state = CircuitState::Closed;
        state.last_state_change = Timestamp::now();
        state.next_attempt_time = None;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;

        if was != CircuitState::Closed {
            info!(queue_name = %self.queue_name, previous = %was, "Circuit breaker closed");
        }
        self.metrics
            .record_circuit_breaker_state(&self.queue_name, CircuitState::Closed.as_metric_value());
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
