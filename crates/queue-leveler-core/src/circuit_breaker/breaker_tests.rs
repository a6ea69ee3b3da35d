//! Tests for the per-queue circuit breaker.
//!
//! These tests verify state transitions, metrics tracking and thread safety.

use super::*;
use crate::monitoring::{InMemoryMetricsCollector, NoOpMetricsCollector};
use std::time::Duration;

// ============================================================================
// Helper Functions
// ============================================================================

/// Create test circuit breaker with custom config
fn create_test_breaker(failure_threshold: u32, recovery_timeout_seconds: u64) -> QueueCircuitBreaker {
    let config = CircuitBreakerConfig {
        failure_threshold,
        recovery_timeout_seconds,
        success_threshold: 1,
    };
    QueueCircuitBreaker::new("orders", config, Arc::new(NoOpMetricsCollector))
}

fn trip(breaker: &QueueCircuitBreaker) {
    for _ in 0..breaker.config.failure_threshold {
        breaker.record_failure();
    }
}

// ============================================================================
// Basic State Tests
// ============================================================================

mod basic_state_tests {
    use super::*;

    /// Verify initial circuit state is Closed.
    #[test]
    fn test_initial_state_is_closed() {
        let breaker = create_test_breaker(5, 30);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());
    }

    /// Verify metrics are updated for successful operations.
    #[test]
    fn test_metrics_updated_on_success() {
        let breaker = create_test_breaker(5, 30);

        breaker.record_success();
        breaker.record_success();
        breaker.record_success();

        let metrics = breaker.metrics();
        assert_eq!(metrics.queue_name, "orders");
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.successful_requests, 3);
        assert_eq!(metrics.failed_requests, 0);
        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.success_rate(), 1.0);
    }

    /// Verify reset operation clears all state.
    #[test]
    fn test_reset_operation() {
        let breaker = create_test_breaker(2, 30);

        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.can_execute());

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 0);
        assert_eq!(metrics.consecutive_failures, 0);
        assert!(metrics.next_attempt_time.is_none());
    }
}

// ============================================================================
// Circuit Tripping Tests
// ============================================================================

mod circuit_tripping_tests {
    use super::*;

    /// Verify circuit trips after five consecutive failures.
    #[test]
    fn test_consecutive_failures_trip_circuit() {
        let breaker = create_test_breaker(5, 30);

        for _ in 0..4 {
            breaker.record_failure();
            assert_eq!(breaker.state(), CircuitState::Closed);
        }

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let metrics = breaker.metrics();
        assert_eq!(metrics.consecutive_failures, 5);
        assert!(metrics.next_attempt_time.is_some());
    }

    /// Verify open circuit refuses processing and counts rejections.
    #[test]
    fn test_open_state_rejects() {
        let breaker = create_test_breaker(2, 30);
        trip(&breaker);

        assert!(!breaker.can_execute());
        assert!(!breaker.can_execute());

        let metrics = breaker.metrics();
        assert_eq!(metrics.rejected_requests, 2);
        assert_eq!(metrics.state, CircuitState::Open);
    }

    /// Verify success resets consecutive failure counter.
    #[test]
    fn test_success_resets_failure_counter() {
        let breaker = create_test_breaker(5, 30);

        for _ in 0..3 {
            breaker.record_failure();
        }
        assert_eq!(breaker.metrics().consecutive_failures, 3);

        breaker.record_success();

        assert_eq!(breaker.metrics().consecutive_failures, 0);
        for _ in 0..4 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    /// Results of work started before the trip do not change an open circuit.
    #[test]
    fn test_outcomes_while_open_keep_circuit_open() {
        let breaker = create_test_breaker(2, 30);
        trip(&breaker);

        breaker.record_success();
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
    }
}

// ============================================================================
// Half-Open State Tests
// ============================================================================

mod half_open_tests {
    use super::*;

    /// Verify the cooldown is evaluated lazily by `can_execute`.
    #[tokio::test]
    async fn test_half_open_after_recovery_timeout() {
        let breaker = create_test_breaker(2, 0);
        trip(&breaker);
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(5)).await;

        // State only changes once someone asks
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    /// One success in half-open closes the circuit.
    #[tokio::test]
    async fn test_success_in_half_open_closes() {
        let breaker = create_test_breaker(2, 0);
        trip(&breaker);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.can_execute());

        breaker.record_success();

        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().consecutive_failures, 0);
    }

    /// One failure in half-open re-opens the circuit with a new cooldown.
    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let breaker = create_test_breaker(2, 30);
        {
            let mut state = breaker.write();
            state.current_state = CircuitState::Open;
            state.next_attempt_time = Some(Timestamp::now());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
        let next = breaker.metrics().next_attempt_time.unwrap();
        assert!(next > Timestamp::now().add_duration(Duration::from_secs(25)));
    }

    /// Half-open lets every caller through until a result arrives.
    #[tokio::test]
    async fn test_half_open_probes_are_not_serialized() {
        let breaker = create_test_breaker(1, 0);
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    /// A higher success threshold needs that many consecutive successes.
    #[tokio::test]
    async fn test_success_threshold_above_one() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_seconds: 0,
            success_threshold: 3,
        };
        let breaker = QueueCircuitBreaker::new("orders", config, Arc::new(NoOpMetricsCollector));
        breaker.record_failure();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(breaker.can_execute());

        breaker.record_success();
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}

// ============================================================================
// Metrics Reporting Tests
// ============================================================================

mod metrics_reporting_tests {
    use super::*;

    #[tokio::test]
    async fn test_state_changes_reported_to_collector() {
        let collector = Arc::new(InMemoryMetricsCollector::new());
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout_seconds: 0,
            success_threshold: 1,
        };
        let breaker = QueueCircuitBreaker::new("orders", config, collector.clone());
        let gauge = "circuit_breaker_state{orders}";

        breaker.record_failure();
        assert_eq!(collector.gauge(gauge), Some(1));

        tokio::time::sleep(Duration::from_millis(5)).await;
        breaker.can_execute();
        assert_eq!(collector.gauge(gauge), Some(2));

        breaker.record_success();
        assert_eq!(collector.gauge(gauge), Some(0));
    }
}

// ============================================================================
// Concurrency Tests
// ============================================================================

mod concurrency_tests {
    use super::*;

    /// Verify concurrent recording from many tasks is consistent.
    #[tokio::test]
    async fn test_concurrent_recording() {
        let breaker = Arc::new(create_test_breaker(1_000, 30));
        let mut handles = Vec::new();

        for i in 0..10 {
            let breaker = Arc::clone(&breaker);
            handles.push(tokio::spawn(async move {
                for _ in 0..20 {
                    if i % 2 == 0 {
                        breaker.record_success();
                    } else {
                        breaker.record_failure();
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 200);
        assert_eq!(metrics.successful_requests, 100);
        assert_eq!(metrics.failed_requests, 100);
        assert_eq!(metrics.failure_rate(), 0.5);
    }
}
