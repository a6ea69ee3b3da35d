//! Adaptive load leveling.
//!
//! [`LoadLevelingStrategy`] decides, per queue, whether the processor may
//! poll now, how many messages to take, and how long to wait between polls.
//! Decisions come from rolling metrics (in-flight load, error rate, average
//! processing time, backlog) and an adaptive throttle that grows on
//! consecutive failures and shrinks on consecutive successes.
//!
//! # Admission order
//!
//! [`LoadLevelingStrategy::should_process`] short-circuits on the first
//! failing check:
//!
//! 1. current load at or above `max_concurrent_load`
//! 2. active throttle window (cleared once it has passed)
//! 3. rolling error rate above threshold (engages throttle)
//! 4. rolling average processing time above threshold (engages throttle)
//! 5. backlog above threshold (engages throttle)
//! 6. less than `current_throttle_delay` since the last admitted poll
//!
//! State is kept per queue in its own entry; the map lock is only held to
//! look an entry up or insert it.

use crate::error::ConfigurationError;
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Thresholds and limits used by [`LoadLevelingStrategy`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadLevelingConfig {
    /// In-flight messages at which new polls are refused
    pub max_concurrent_load: usize,

    /// Rolling error rate (0.0 to 1.0) above which the queue is throttled
    pub error_rate_threshold: f64,

    /// Rolling average handler time above which the queue is throttled (milliseconds)
    pub max_average_processing_time_ms: u64,

    /// Backlog above which the queue is throttled
    pub max_backlog_size: usize,

    /// Starting and minimum throttle delay (milliseconds)
    pub initial_throttle_delay_ms: u64,

    /// Throttle delay ceiling (milliseconds)
    pub max_throttle_delay_ms: u64,

    /// Growth factor applied to the throttle delay on repeated failures
    pub throttle_multiplier: f64,

    /// Consecutive failures that engage the throttle
    pub failure_threshold: u32,

    /// Consecutive successes that shrink the throttle delay
    pub recovery_threshold: u32,

    /// Factor (0.0 to 1.0) applied to the throttle delay on recovery
    pub recovery_factor: f64,

    /// Age of samples included in rolling rates (seconds)
    pub metrics_window_seconds: u64,

    /// Samples required before error rate and latency are trusted
    pub min_samples: usize,

    /// Maximum samples retained per queue
    pub max_samples: usize,

    /// Batch size under normal load
    pub default_batch_size: usize,

    /// Batch size ceiling
    pub max_batch_size: usize,

    /// Shortest delay between polls (milliseconds)
    pub min_delay_ms: u64,

    /// Longest delay between polls (milliseconds)
    pub max_delay_ms: u64,

    /// How often the cleanup task runs (seconds)
    pub cleanup_interval_seconds: u64,

    /// Inactivity after which a queue's state is dropped (seconds)
    pub state_retention_seconds: u64,
}

impl Default for LoadLevelingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_load: 100,
            error_rate_threshold: 0.25,
            max_average_processing_time_ms: 5_000,
            max_backlog_size: 10_000,
            initial_throttle_delay_ms: 50,
            max_throttle_delay_ms: 30_000,
            throttle_multiplier: 2.0,
            failure_threshold: 3,
            recovery_threshold: 5,
            recovery_factor: 0.5,
            metrics_window_seconds: 300,
            min_samples: 10,
            max_samples: 1_000,
            default_batch_size: 10,
            max_batch_size: 100,
            min_delay_ms: 100,
            max_delay_ms: 30_000,
            cleanup_interval_seconds: 60,
            state_retention_seconds: 600,
        }
    }
}

impl LoadLevelingConfig {
    pub fn max_average_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_average_processing_time_ms)
    }

    pub fn initial_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.initial_throttle_delay_ms)
    }

    pub fn max_throttle_delay(&self) -> Duration {
        Duration::from_millis(self.max_throttle_delay_ms)
    }

    pub fn metrics_window(&self) -> Duration {
        Duration::from_secs(self.metrics_window_seconds)
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn state_retention(&self) -> Duration {
        Duration::from_secs(self.state_retention_seconds)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |message: &str| {
            Err(ConfigurationError::Invalid {
                message: format!("load_leveling: {}", message),
            })
        };

        if self.max_concurrent_load == 0 {
            return invalid("max_concurrent_load must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            return invalid("error_rate_threshold must be between 0.0 and 1.0");
        }
        if self.throttle_multiplier < 1.0 {
            return invalid("throttle_multiplier must be at least 1.0");
        }
        if !(0.0..=1.0).contains(&self.recovery_factor) {
            return invalid("recovery_factor must be between 0.0 and 1.0");
        }
        if self.initial_throttle_delay_ms > self.max_throttle_delay_ms {
            return invalid("initial_throttle_delay_ms must not exceed max_throttle_delay_ms");
        }
        if self.default_batch_size == 0 || self.default_batch_size > self.max_batch_size {
            return invalid("default_batch_size must be between 1 and max_batch_size");
        }
        if self.min_delay_ms > self.max_delay_ms {
            return invalid("min_delay_ms must not exceed max_delay_ms");
        }
        if self.failure_threshold == 0 || self.recovery_threshold == 0 {
            return invalid("failure_threshold and recovery_threshold must be at least 1");
        }
        if self.max_samples == 0 {
            return invalid("max_samples must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// Per-queue state
// ============================================================================

/// One handler run
#[derive(Debug, Clone, Copy)]
pub struct ProcessingSample {
    pub duration: Duration,
    pub success: bool,
    pub recorded_at: Instant,
}

/// Rolling metrics for one queue
#[derive(Debug, Clone)]
pub struct QueueMetrics {
    pub current_load: usize,
    pub success_count: u64,
    pub error_count: u64,
    pub backlog_size: usize,
    pub samples: VecDeque<ProcessingSample>,
    pub last_activity: Instant,
}

impl QueueMetrics {
    fn new(now: Instant) -> Self {
        Self {
            current_load: 0,
            success_count: 0,
            error_count: 0,
            backlog_size: 0,
            samples: VecDeque::new(),
            last_activity: now,
        }
    }

    /// Drop samples older than `window`. Returns how many were dropped.
    fn prune(&mut self, now: Instant, window: Duration) -> usize {
        let before = self.samples.len();
        while let Some(sample) = self.samples.front() {
            if now.saturating_duration_since(sample.recorded_at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        before - self.samples.len()
    }

    /// Failed share of retained samples; 0.0 below `min_samples`
    pub fn error_rate(&self, min_samples: usize) -> f64 {
        let total = self.samples.len();
        if total == 0 || total < min_samples {
            return 0.0;
        }
        let failures = self.samples.iter().filter(|s| !s.success).count();
        failures as f64 / total as f64
    }

    /// Mean handler time of retained samples; zero below `min_samples`
    pub fn average_processing_time(&self, min_samples: usize) -> Duration {
        let total = self.samples.len();
        if total == 0 || total < min_samples {
            return Duration::ZERO;
        }
        let sum: Duration = self.samples.iter().map(|s| s.duration).sum();
        sum / total as u32
    }
}

/// Adaptive throttle for one queue
#[derive(Debug, Clone)]
pub struct AdaptiveThrottling {
    pub is_throttled: bool,
    pub throttle_until: Option<Instant>,
    pub current_throttle_delay: Duration,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_processing_time: Option<Instant>,
}

impl AdaptiveThrottling {
    fn new(initial_delay: Duration) -> Self {
        Self {
            is_throttled: false,
            throttle_until: None,
            current_throttle_delay: initial_delay,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_processing_time: None,
        }
    }

    /// Whether a throttle window is active at `now`
    fn is_active(&self, now: Instant) -> bool {
        self.is_throttled && self.throttle_until.map_or(false, |until| until > now)
    }

    fn engage(&mut self, now: Instant) {
        self.is_throttled = true;
        self.throttle_until = Some(now + self.current_throttle_delay);
    }

    fn clear(&mut self) {
        self.is_throttled = false;
        self.throttle_until = None;
    }
}

struct QueueState {
    metrics: Mutex<QueueMetrics>,
    throttling: Mutex<AdaptiveThrottling>,
}

impl QueueState {
    fn new(config: &LoadLevelingConfig, now: Instant) -> Self {
        Self {
            metrics: Mutex::new(QueueMetrics::new(now)),
            throttling: Mutex::new(AdaptiveThrottling::new(config.initial_throttle_delay())),
        }
    }

    // Lock order is always throttling, then metrics
    fn throttling(&self) -> MutexGuard<'_, AdaptiveThrottling> {
        self.throttling.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> MutexGuard<'_, QueueMetrics> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only view of one queue's load-leveling state
#[derive(Debug, Clone, PartialEq)]
pub struct LoadLevelingSnapshot {
    pub queue_name: String,
    pub current_load: usize,
    pub success_count: u64,
    pub error_count: u64,
    pub backlog_size: usize,
    pub sample_count: usize,
    pub error_rate: f64,
    pub average_processing_time: Duration,
    pub is_throttled: bool,
    pub throttle_remaining: Option<Duration>,
    pub current_throttle_delay: Duration,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// What a cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub samples_evicted: usize,
    pub queues_dropped: usize,
}

// ============================================================================
// Strategy
// ============================================================================

/// Per-queue adaptive admission, batch sizing and poll pacing
pub struct LoadLevelingStrategy {
    config: LoadLevelingConfig,
    queues: RwLock<HashMap<String, Arc<QueueState>>>,
    metrics: Arc<dyn MetricsCollector>,
}

impl LoadLevelingStrategy {
    /// Create a strategy that reports nowhere
    pub fn new(config: LoadLevelingConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoOpMetricsCollector))
    }

    /// Create a strategy reporting throttle events to `metrics`
    pub fn with_metrics(config: LoadLevelingConfig, metrics: Arc<dyn MetricsCollector>) -> Self {
        Self {
            config,
            queues: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn config(&self) -> &LoadLevelingConfig {
        &self.config
    }

    /// Decide whether `queue_name` may poll now with `current_load` handlers
    /// in flight. Admission stamps the queue's last processing time.
    pub fn should_process(&self, queue_name: &str, current_load: usize) -> bool {
        if current_load >= self.config.max_concurrent_load {
            debug!(
                queue_name,
                current_load,
                max_concurrent_load = self.config.max_concurrent_load,
                "Admission refused; at concurrency ceiling"
            );
            return false;
        }

        let state = self.state(queue_name);
        let now = Instant::now();
        let mut throttling = state.throttling();

        if throttling.is_throttled {
            if throttling.is_active(now) {
                return false;
            }
            throttling.clear();
            info!(queue_name, "Throttle window elapsed; resuming");
        }

        let (error_rate, average, backlog) = {
            let mut metrics = state.metrics();
            metrics.current_load = current_load;
            metrics.last_activity = now;
            metrics.prune(now, self.config.metrics_window());
            (
                metrics.error_rate(self.config.min_samples),
                metrics.average_processing_time(self.config.min_samples),
                metrics.backlog_size,
            )
        };

        if error_rate > self.config.error_rate_threshold {
            throttling.engage(now);
            warn!(
                queue_name,
                error_rate,
                threshold = self.config.error_rate_threshold,
                throttle_ms = throttling.current_throttle_delay.as_millis() as u64,
                "Throttling queue; error rate above threshold"
            );
            self.metrics.record_throttle(queue_name, "error_rate");
            return false;
        }

        if average > self.config.max_average_processing_time() {
            throttling.engage(now);
            warn!(
                queue_name,
                average_ms = average.as_millis() as u64,
                threshold_ms = self.config.max_average_processing_time_ms,
                "Throttling queue; processing time above threshold"
            );
            self.metrics.record_throttle(queue_name, "latency");
            return false;
        }

        if backlog > self.config.max_backlog_size {
            throttling.engage(now);
            warn!(
                queue_name,
                backlog,
                threshold = self.config.max_backlog_size,
                "Throttling queue; backlog above threshold"
            );
            self.metrics.record_throttle(queue_name, "backlog");
            return false;
        }

        if let Some(last) = throttling.last_processing_time {
            if now.saturating_duration_since(last) < throttling.current_throttle_delay {
                return false;
            }
        }

        throttling.last_processing_time = Some(now);
        true
    }

    /// Record one handler run and adapt the throttle delay
    pub fn record_processing_time(&self, queue_name: &str, duration: Duration, success: bool) {
        let state = self.state(queue_name);
        let now = Instant::now();

        {
            let mut metrics = state.metrics();
            metrics.samples.push_back(ProcessingSample {
                duration,
                success,
                recorded_at: now,
            });
            while metrics.samples.len() > self.config.max_samples {
                metrics.samples.pop_front();
            }
            if success {
                metrics.success_count += 1;
            } else {
                metrics.error_count += 1;
            }
            metrics.last_activity = now;
        }

        let mut throttling = state.throttling();
        if success {
            throttling.consecutive_successes += 1;
            if throttling.consecutive_successes >= self.config.recovery_threshold {
                let reduced = throttling
                    .current_throttle_delay
                    .mul_f64(self.config.recovery_factor)
                    .max(self.config.initial_throttle_delay());
                if reduced < throttling.current_throttle_delay {
                    debug!(
                        queue_name,
                        throttle_ms = reduced.as_millis() as u64,
                        "Reducing throttle delay after sustained success"
                    );
                }
                throttling.current_throttle_delay = reduced;
                throttling.consecutive_successes = 0;
                throttling.consecutive_failures = 0;
            }
        } else {
            throttling.consecutive_failures += 1;
            throttling.consecutive_successes = 0;
            if throttling.consecutive_failures >= self.config.failure_threshold {
                let grown = throttling
                    .current_throttle_delay
                    .mul_f64(self.config.throttle_multiplier)
                    .min(self.config.max_throttle_delay());
                throttling.current_throttle_delay = grown;
                throttling.engage(now);
                throttling.consecutive_failures = 0;
                warn!(
                    queue_name,
                    throttle_ms = grown.as_millis() as u64,
                    "Throttling queue after consecutive failures"
                );
                self.metrics
                    .record_throttle(queue_name, "consecutive_failures");
            }
        }
    }

    /// Messages to request on the next receive
    pub fn optimal_batch_size(&self, queue_name: &str) -> usize {
        let Some(state) = self.existing(queue_name) else {
            return self.config.default_batch_size;
        };
        let now = Instant::now();

        if state.throttling().is_active(now) {
            return 1;
        }

        let (load_factor, error_rate, average) = self.pressure(&state, now);
        let half_error = self.config.error_rate_threshold / 2.0;
        let half_latency = self.config.max_average_processing_time() / 2;

        let size = if load_factor > 0.8 || error_rate > half_error || average > half_latency {
            (self.config.default_batch_size / 2).max(1)
        } else if load_factor < 0.3 {
            self.config.default_batch_size.saturating_mul(2)
        } else {
            self.config.default_batch_size
        };

        size.clamp(1, self.config.max_batch_size)
    }

    /// Delay before the next poll
    pub fn optimal_delay(&self, queue_name: &str) -> Duration {
        let min_delay = self.config.min_delay();
        let Some(state) = self.existing(queue_name) else {
            return min_delay;
        };
        let now = Instant::now();

        let (load_factor, error_rate, _) = self.pressure(&state, now);

        let mut multiplier = 1.0;
        if load_factor > 0.5 {
            multiplier *= 1.0 + (load_factor - 0.5) * 4.0;
        }
        if error_rate > 0.1 {
            multiplier *= 1.0 + error_rate * 10.0;
        }
        let mut delay = min_delay.mul_f64(multiplier.min(10.0));

        let throttling = state.throttling();
        if throttling.is_active(now) {
            delay = delay.max(throttling.current_throttle_delay);
        }

        delay.min(self.config.max_delay())
    }

    /// Set the backlog used by the admission check
    pub fn update_backlog(&self, queue_name: &str, backlog_size: usize) {
        let state = self.state(queue_name);
        let mut metrics = state.metrics();
        metrics.backlog_size = backlog_size;
        metrics.last_activity = Instant::now();
    }

    /// Current view of a queue's state, `None` if never seen
    pub fn snapshot(&self, queue_name: &str) -> Option<LoadLevelingSnapshot> {
        let state = self.existing(queue_name)?;
        let now = Instant::now();
        let throttling = state.throttling();
        let metrics = state.metrics();
        let active = throttling.is_active(now);

        Some(LoadLevelingSnapshot {
            queue_name: queue_name.to_string(),
            current_load: metrics.current_load,
            success_count: metrics.success_count,
            error_count: metrics.error_count,
            backlog_size: metrics.backlog_size,
            sample_count: metrics.samples.len(),
            error_rate: metrics.error_rate(self.config.min_samples),
            average_processing_time: metrics.average_processing_time(self.config.min_samples),
            is_throttled: active,
            throttle_remaining: throttling
                .throttle_until
                .filter(|_| active)
                .map(|until| until.saturating_duration_since(now)),
            current_throttle_delay: throttling.current_throttle_delay,
            consecutive_failures: throttling.consecutive_failures,
            consecutive_successes: throttling.consecutive_successes,
        })
    }

    /// Evict samples older than the metrics window and drop queues idle for
    /// longer than the retention period
    pub fn cleanup(&self) -> CleanupSummary {
        let now = Instant::now();
        let window = self.config.metrics_window();
        let retention = self.config.state_retention();
        let mut summary = CleanupSummary::default();

        let entries: Vec<(String, Arc<QueueState>)> = self
            .queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, state)| (name.clone(), Arc::clone(state)))
            .collect();

        let mut idle = Vec::new();
        for (name, state) in entries {
            let mut metrics = state.metrics();
            summary.samples_evicted += metrics.prune(now, window);
            if now.saturating_duration_since(metrics.last_activity) > retention {
                idle.push(name);
            }
        }

        if !idle.is_empty() {
            let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
            for name in &idle {
                queues.remove(name);
            }
            summary.queues_dropped = idle.len();
        }

        if summary.samples_evicted > 0 || summary.queues_dropped > 0 {
            debug!(
                samples_evicted = summary.samples_evicted,
                queues_dropped = summary.queues_dropped,
                "Load-leveling cleanup"
            );
        }
        summary
    }

    /// Run [`cleanup`](Self::cleanup) every `cleanup_interval` until `shutdown`
    pub fn spawn_cleanup(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.cleanup_interval());
            // First tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("Load-leveling cleanup stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        self.cleanup();
                    }
                }
            }
        })
    }

    /// Number of queues with state
    pub fn tracked_queue_count(&self) -> usize {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn pressure(&self, state: &QueueState, now: Instant) -> (f64, f64, Duration) {
        let mut metrics = state.metrics();
        metrics.prune(now, self.config.metrics_window());
        let load_factor = metrics.current_load as f64 / self.config.max_concurrent_load as f64;
        (
            load_factor,
            metrics.error_rate(self.config.min_samples),
            metrics.average_processing_time(self.config.min_samples),
        )
    }

    fn existing(&self, queue_name: &str) -> Option<Arc<QueueState>> {
        self.queues
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue_name)
            .cloned()
    }

    fn state(&self, queue_name: &str) -> Arc<QueueState> {
        if let Some(state) = self.existing(queue_name) {
            return state;
        }
        let mut queues = self.queues.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            queues
                .entry(queue_name.to_string())
                .or_insert_with(|| Arc::new(QueueState::new(&self.config, Instant::now()))),
        )
    }
}

#[cfg(test)]
#[path = "strategy_tests.rs"]
mod tests;
