//! Metrics collection and monitoring.
//!
//! This module defines the metrics the queue, strategy and processor emit.
//! Exporters (Prometheus, StatsD, ...) implement [`MetricsCollector`] outside
//! this crate and are injected as `Arc<dyn MetricsCollector>`.
//!
//! # Best-Effort Pattern
//!
//! Metric recording never fails and never blocks processing. A collector
//! that cannot record a value drops it.
//!
//! # Examples
//!
//! ```rust
//! use queue_leveler_core::monitoring::{MetricsCollector, NoOpMetricsCollector};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let metrics: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);
//!
//! metrics.record_message_processed("orders", Duration::from_millis(40), "completed");
//! metrics.record_queue_depth("orders", 12);
//! ```

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Metrics collector for queue processing.
///
/// All methods take `&self` so one collector can be shared across the
/// polling loop, handler tasks and the health monitor.
pub trait MetricsCollector: Send + Sync {
    /// Record the resolution of one message.
    ///
    /// # Parameters
    ///
    /// - `duration`: Handler run time
    /// - `outcome`: `completed`, `abandoned`, `dead_lettered` or `unresolved`
    ///
    /// # Metrics Updated
    ///
    /// - `messages_processed_total{queue,outcome}`: Incremented by 1
    /// - `message_processing_duration_seconds{queue}`: Histogram observation
    fn record_message_processed(&self, queue_name: &str, duration: Duration, outcome: &str);

    /// Record a consumer error by category (see `ConsumerError::category`).
    ///
    /// # Metrics Updated
    ///
    /// - `consumer_errors_total{queue,category,permanent}`: Incremented by 1
    fn record_consumer_error(&self, queue_name: &str, category: &str, is_permanent: bool);

    /// Record a failed store operation seen by the processor.
    ///
    /// # Metrics Updated
    ///
    /// - `store_errors_total{queue}`: Incremented by 1
    fn record_store_error(&self, queue_name: &str);

    /// Record circuit breaker state (0=closed, 1=open, 2=half-open).
    ///
    /// # Metrics Updated
    ///
    /// - `circuit_breaker_state{queue}`: Gauge set to state value
    fn record_circuit_breaker_state(&self, queue_name: &str, state: i64);

    /// Record the strategy engaging a throttle window.
    ///
    /// # Parameters
    ///
    /// - `reason`: `error_rate`, `latency`, `backlog` or `consecutive_failures`
    ///
    /// # Metrics Updated
    ///
    /// - `throttle_events_total{queue,reason}`: Incremented by 1
    fn record_throttle(&self, queue_name: &str, reason: &str);

    /// Record a poll iteration skipped before receiving.
    ///
    /// # Parameters
    ///
    /// - `reason`: `admission`, `circuit_open` or `saturated`
    ///
    /// # Metrics Updated
    ///
    /// - `polls_skipped_total{queue,reason}`: Incremented by 1
    fn record_poll_skipped(&self, queue_name: &str, reason: &str);

    /// Record the number of handlers currently running.
    ///
    /// # Metrics Updated
    ///
    /// - `messages_in_flight{queue}`: Gauge set to count
    fn record_in_flight(&self, queue_name: &str, count: i64);

    /// Record visible plus delayed messages.
    ///
    /// # Metrics Updated
    ///
    /// - `queue_depth_messages{queue}`: Gauge set to depth value
    fn record_queue_depth(&self, queue_name: &str, depth: i64);

    /// Record dead-letter list length.
    ///
    /// # Metrics Updated
    ///
    /// - `dead_letter_queue_depth{queue}`: Gauge set to depth value
    fn record_dead_letter_queue_depth(&self, queue_name: &str, depth: i64);
}

/// No-op metrics collector.
///
/// Silently ignores all recording calls. Used when no exporter is configured
/// and in tests that don't assert on metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn record_message_processed(&self, _queue_name: &str, _duration: Duration, _outcome: &str) {
        // No-op
    }

    fn record_consumer_error(&self, _queue_name: &str, _category: &str, _is_permanent: bool) {
        // No-op
    }

    fn record_store_error(&self, _queue_name: &str) {
        // No-op
    }

    fn record_circuit_breaker_state(&self, _queue_name: &str, _state: i64) {
        // No-op
    }

    fn record_throttle(&self, _queue_name: &str, _reason: &str) {
        // No-op
    }

    fn record_poll_skipped(&self, _queue_name: &str, _reason: &str) {
        // No-op
    }

    fn record_in_flight(&self, _queue_name: &str, _count: i64) {
        // No-op
    }

    fn record_queue_depth(&self, _queue_name: &str, _depth: i64) {
        // No-op
    }

    fn record_dead_letter_queue_depth(&self, _queue_name: &str, _depth: i64) {
        // No-op
    }
}

/// Collector that keeps counters and gauges in memory.
///
/// Keys are `metric{label,...}` strings, e.g.
/// `messages_processed_total{orders,completed}`. Useful for tests and for
/// periodic log summaries when no exporter is available.
#[derive(Debug, Default)]
pub struct InMemoryMetricsCollector {
    counters: Mutex<HashMap<String, u64>>,
    gauges: Mutex<HashMap<String, i64>>,
}

impl InMemoryMetricsCollector {
    /// Create an empty collector
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, 0 when never incremented
    pub fn counter(&self, key: &str) -> u64 {
        self.counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Last value set on a gauge
    pub fn gauge(&self, key: &str) -> Option<i64> {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn increment(&self, key: String) {
        *self
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_insert(0) += 1;
    }

    fn set(&self, key: String, value: i64) {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }
}

impl MetricsCollector for InMemoryMetricsCollector {
    fn record_message_processed(&self, queue_name: &str, _duration: Duration, outcome: &str) {
        self.increment(format!("messages_processed_total{{{},{}}}", queue_name, outcome));
    }

    fn record_consumer_error(&self, queue_name: &str, category: &str, is_permanent: bool) {
        self.increment(format!(
            "consumer_errors_total{{{},{},{}}}",
            queue_name, category, is_permanent
        ));
    }

    fn record_store_error(&self, queue_name: &str) {
        self.increment(format!("store_errors_total{{{}}}", queue_name));
    }

    fn record_circuit_breaker_state(&self, queue_name: &str, state: i64) {
        self.set(format!("circuit_breaker_state{{{}}}", queue_name), state);
    }

    fn record_throttle(&self, queue_name: &str, reason: &str) {
        self.increment(format!("throttle_events_total{{{},{}}}", queue_name, reason));
    }

    fn record_poll_skipped(&self, queue_name: &str, reason: &str) {
        self.increment(format!("polls_skipped_total{{{},{}}}", queue_name, reason));
    }

    fn record_in_flight(&self, queue_name: &str, count: i64) {
        self.set(format!("messages_in_flight{{{}}}", queue_name), count);
    }

    fn record_queue_depth(&self, queue_name: &str, depth: i64) {
        self.set(format!("queue_depth_messages{{{}}}", queue_name), depth);
    }

    fn record_dead_letter_queue_depth(&self, queue_name: &str, depth: i64) {
        self.set(format!("dead_letter_queue_depth{{{}}}", queue_name), depth);
    }
}

#[cfg(test)]
#[path = "monitoring_tests.rs"]
mod tests;
