//! Background message processing.
//!
//! A [`MessageProcessor`] owns the poll loop for one queue. Each iteration:
//!
//! 1. asks the [`LoadLevelingStrategy`] for admission, sleeping its delay if refused
//! 2. asks the queue's circuit breaker, sleeping a fixed cooldown if open
//! 3. sizes the batch from the strategy, clamped to free handler slots,
//!    skipping the receive entirely while every slot is taken
//! 4. receives, sleeping the empty-queue delay if nothing came back
//! 5. dispatches each message to the [`MessageConsumer`] on its own task
//!
//! Handler results resolve the message: success completes it, permanent
//! errors dead-letter it, anything else (including a panic) abandons it for
//! redelivery with backoff. Every handler result is reported to the strategy
//! and the breaker.
//!
//! Shutdown is driven by a [`CancellationToken`]: polling stops at once, then
//! the processor waits up to a grace period for running handlers. Messages
//! still in flight after that stay in the processing list and come back
//! through lease recovery.

use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::error::{ConfigurationError, ConsumerError, QueueError};
use crate::health::{HealthChecker, HealthThresholds, QueueHealthReport, QueueHealthStatus};
use crate::message::{QueueMessage, ReceiptHandle, ReceivedMessage, Timestamp};
use crate::monitoring::{MetricsCollector, NoOpMetricsCollector};
use crate::queue::{
    AbandonOutcome, MessageQueue, REASON_MAX_AGE_EXCEEDED, REASON_MAX_DELIVERY_COUNT,
};
use crate::strategy::{LoadLevelingConfig, LoadLevelingStrategy};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on concurrent handlers per processor
pub const MAX_CONCURRENT_MESSAGES: usize = 10_000;

// ============================================================================
// Consumer
// ============================================================================

/// Application handler for messages of type `T`.
///
/// Return a permanent [`ConsumerError`] (`InvalidArgument`, `Validation`,
/// `Unsupported`, `Malformed`) to dead-letter the message; any other error
/// abandons it for redelivery. Handlers must be idempotent since delivery is
/// at-least-once.
#[async_trait]
pub trait MessageConsumer<T: Send + Sync>: Send + Sync {
    async fn handle(&self, message: &QueueMessage<T>) -> Result<(), ConsumerError>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Processor loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Handlers allowed to run at once
    pub max_concurrent_messages: usize,

    /// Sleep after a receive that returned nothing (milliseconds)
    pub empty_queue_delay_ms: u64,

    /// Sleep while the circuit breaker refuses processing (milliseconds)
    pub circuit_open_delay_ms: u64,

    /// Sleep after a failed receive (milliseconds)
    pub store_error_delay_ms: u64,

    /// Messages older than this are dead-lettered instead of handled (seconds)
    pub max_message_age_seconds: Option<u64>,

    /// Time allowed for running handlers to finish on shutdown (seconds)
    pub shutdown_grace_period_seconds: u64,

    /// How often the health monitor reads queue statistics (seconds)
    pub health_check_interval_seconds: u64,

    /// Levels above which the health monitor warns
    pub health: HealthThresholds,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 10,
            empty_queue_delay_ms: 1_000,
            circuit_open_delay_ms: 5_000,
            store_error_delay_ms: 2_000,
            max_message_age_seconds: None,
            shutdown_grace_period_seconds: 30,
            health_check_interval_seconds: 30,
            health: HealthThresholds::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn empty_queue_delay(&self) -> Duration {
        Duration::from_millis(self.empty_queue_delay_ms)
    }

    pub fn circuit_open_delay(&self) -> Duration {
        Duration::from_millis(self.circuit_open_delay_ms)
    }

    pub fn store_error_delay(&self) -> Duration {
        Duration::from_millis(self.store_error_delay_ms)
    }

    pub fn max_message_age(&self) -> Option<Duration> {
        self.max_message_age_seconds.map(Duration::from_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_seconds)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrent_messages == 0
            || self.max_concurrent_messages > MAX_CONCURRENT_MESSAGES
        {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "processor.max_concurrent_messages must be between 1 and {}",
                    MAX_CONCURRENT_MESSAGES
                ),
            });
        }
        if self.health_check_interval_seconds == 0 {
            return Err(ConfigurationError::Invalid {
                message: "processor.health_check_interval_seconds must be at least 1".to_string(),
            });
        }
        self.health.validate()
    }
}

// ============================================================================
// Outcomes
// ============================================================================

/// How a dispatched message was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    /// Handler succeeded and the message was removed
    Completed,
    /// Handler failed transiently; message scheduled for redelivery
    Abandoned { delivery_count: u32 },
    /// Message moved to the dead-letter list
    DeadLettered { reason: String },
    /// Message could not be resolved (store failure, or its lease had
    /// already been recovered); lease recovery will bring it back if needed
    Unresolved { reason: String },
}

impl ProcessingOutcome {
    /// Label used in metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Abandoned { .. } => "abandoned",
            Self::DeadLettered { .. } => "dead_lettered",
            Self::Unresolved { .. } => "unresolved",
        }
    }
}

/// Result of one poll iteration
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    /// Messages handed to handler tasks
    Dispatched(usize),
    /// Strategy refused admission
    Throttled { delay: Duration },
    /// Circuit breaker refused processing
    CircuitOpen { delay: Duration },
    /// Every handler slot is taken
    Saturated { delay: Duration },
    /// Nothing to receive
    Empty { delay: Duration },
    /// Receive failed
    StoreError { delay: Duration },
}

impl PollOutcome {
    /// Time to wait before the next poll, if any
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Self::Dispatched(_) => None,
            Self::Throttled { delay }
            | Self::CircuitOpen { delay }
            | Self::Saturated { delay }
            | Self::Empty { delay }
            | Self::StoreError { delay } => Some(*delay),
        }
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Poll loop and handler dispatch for one queue
pub struct MessageProcessor<T> {
    queue: Arc<MessageQueue<T>>,
    consumer: Arc<dyn MessageConsumer<T>>,
    strategy: Arc<LoadLevelingStrategy>,
    breakers: Arc<CircuitBreakerRegistry>,
    metrics: Arc<dyn MetricsCollector>,
    config: ProcessorConfig,
    permits: Arc<Semaphore>,
    latest_health: RwLock<Option<QueueHealthReport>>,
}

impl<T> MessageProcessor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a processor with its own default strategy and breakers.
    ///
    /// `max_concurrent_messages` is clamped to 1..=[`MAX_CONCURRENT_MESSAGES`].
    pub fn new(
        queue: Arc<MessageQueue<T>>,
        consumer: Arc<dyn MessageConsumer<T>>,
        config: ProcessorConfig,
    ) -> Self {
        let slots = config
            .max_concurrent_messages
            .clamp(1, MAX_CONCURRENT_MESSAGES);
        let config = ProcessorConfig {
            max_concurrent_messages: slots,
            ..config
        };

        Self {
            queue,
            consumer,
            strategy: Arc::new(LoadLevelingStrategy::new(LoadLevelingConfig::default())),
            breakers: Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            metrics: Arc::new(NoOpMetricsCollector),
            config,
            permits: Arc::new(Semaphore::new(slots)),
            latest_health: RwLock::new(None),
        }
    }

    /// Share a strategy with other processors
    pub fn with_strategy(mut self, strategy: Arc<LoadLevelingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Share a breaker registry with other processors
    pub fn with_circuit_breakers(mut self, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Report processing metrics to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn queue(&self) -> &Arc<MessageQueue<T>> {
        &self.queue
    }

    pub fn strategy(&self) -> &Arc<LoadLevelingStrategy> {
        &self.strategy
    }

    pub fn circuit_breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Handlers currently running
    pub fn current_load(&self) -> usize {
        self.config
            .max_concurrent_messages
            .saturating_sub(self.permits.available_permits())
    }

    /// Last report published by the health monitor
    pub fn latest_health(&self) -> Option<QueueHealthReport> {
        self.latest_health
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Poll until `shutdown` is cancelled, then drain running handlers
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let queue_name = self.queue_name().to_string();
        info!(
            queue_name = %queue_name,
            max_concurrent_messages = self.config.max_concurrent_messages,
            "Message processor started"
        );

        while !shutdown.is_cancelled() {
            let outcome = self.poll(&shutdown).await;
            if let Some(delay) = outcome.delay() {
                if !pause(delay, &shutdown).await {
                    break;
                }
            }
        }

        info!(
            queue_name = %queue_name,
            in_flight = self.current_load(),
            "Message processor stopping; draining in-flight messages"
        );
        if self.drain(self.config.shutdown_grace_period()).await {
            info!(queue_name = %queue_name, "Message processor stopped");
        } else {
            warn!(
                queue_name = %queue_name,
                in_flight = self.current_load(),
                "Grace period elapsed; remaining messages left for lease recovery"
            );
        }
    }

    /// Spawn [`run`](Self::run) on the runtime
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// One iteration of the poll loop
    pub async fn poll_once(self: &Arc<Self>) -> PollOutcome {
        self.poll(&CancellationToken::new()).await
    }

    async fn poll(self: &Arc<Self>, shutdown: &CancellationToken) -> PollOutcome {
        let queue_name = self.queue_name();
        let load = self.current_load();
        self.metrics.record_in_flight(queue_name, load as i64);

        if !self.strategy.should_process(queue_name, load) {
            self.metrics.record_poll_skipped(queue_name, "admission");
            return PollOutcome::Throttled {
                delay: self.strategy.optimal_delay(queue_name),
            };
        }

        if !self.breakers.can_execute(queue_name) {
            self.metrics.record_poll_skipped(queue_name, "circuit_open");
            debug!(queue_name, "Circuit open; skipping poll");
            return PollOutcome::CircuitOpen {
                delay: self.config.circuit_open_delay(),
            };
        }

        let available = self.permits.available_permits();
        if available == 0 {
            self.metrics.record_poll_skipped(queue_name, "saturated");
            return PollOutcome::Saturated {
                delay: self.strategy.optimal_delay(queue_name),
            };
        }
        let batch_size = self
            .strategy
            .optimal_batch_size(queue_name)
            .clamp(1, available);
        let visibility_timeout = self.queue.config().default_visibility_timeout();

        let messages = match self.queue.receive(batch_size, visibility_timeout).await {
            Ok(messages) => messages,
            Err(e) => {
                self.record_store_failure(&e, false);
                error!(
                    queue_name,
                    error = %e,
                    transient = e.is_transient(),
                    "Failed to receive messages"
                );
                return PollOutcome::StoreError {
                    delay: self.config.store_error_delay(),
                };
            }
        };

        if messages.is_empty() {
            return PollOutcome::Empty {
                delay: self.config.empty_queue_delay(),
            };
        }

        let count = messages.len();
        debug!(queue_name, count, batch_size, "Dispatching messages");

        let mut dispatched = 0;
        for received in messages {
            let acquired = tokio::select! {
                _ = shutdown.cancelled() => None,
                permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            };
            let Some(permit) = acquired else {
                // The remaining messages keep their leases and are recovered later
                warn!(
                    queue_name,
                    undispatched = count - dispatched,
                    "Stopping dispatch; handler slots unavailable"
                );
                break;
            };

            let processor = Arc::clone(self);
            tokio::spawn(async move {
                let _permit = permit;
                processor.process_message(received).await;
            });
            dispatched += 1;
        }

        PollOutcome::Dispatched(dispatched)
    }

    /// Run the handler for one received message and resolve it
    pub async fn process_message(&self, received: ReceivedMessage<T>) -> ProcessingOutcome {
        let ReceivedMessage { message, receipt } = received;
        let now = Timestamp::now();

        if let Some(max_age) = self.config.max_message_age() {
            if message.age_at(&now) > max_age {
                info!(
                    queue_name = self.queue_name(),
                    message_id = %message.id,
                    "Message older than maximum age; dead-lettering without dispatch"
                );
                return self
                    .resolve_dead_letter(&receipt, REASON_MAX_AGE_EXCEEDED, Duration::ZERO, false)
                    .await;
            }
        }

        let max_delivery_count = self.queue.config().redelivery.max_delivery_count;
        if message.has_reached_max_delivery_count(max_delivery_count) {
            return self
                .resolve_dead_letter(&receipt, REASON_MAX_DELIVERY_COUNT, Duration::ZERO, false)
                .await;
        }

        let consumer = Arc::clone(&self.consumer);
        let started = Instant::now();
        // Separate task so a panicking handler surfaces as a JoinError
        let result = tokio::spawn(async move { consumer.handle(&message).await }).await;
        let elapsed = started.elapsed();

        let queue_name = self.queue_name();
        match result {
            Ok(Ok(())) => {
                self.record_handler_result(true, elapsed);
                match self.queue.complete(&receipt).await {
                    Ok(()) => {
                        debug!(
                            queue_name,
                            message_id = %receipt.message_id(),
                            duration_ms = elapsed.as_millis() as u64,
                            "Message processed"
                        );
                        self.finish(ProcessingOutcome::Completed, elapsed)
                    }
                    Err(e) => self.resolution_failed(&receipt, e, elapsed, false),
                }
            }
            Ok(Err(consumer_error)) => {
                self.record_handler_result(false, elapsed);
                self.metrics.record_consumer_error(
                    queue_name,
                    consumer_error.category(),
                    consumer_error.is_permanent(),
                );

                if consumer_error.is_permanent() {
                    warn!(
                        queue_name,
                        message_id = %receipt.message_id(),
                        error = %consumer_error,
                        category = consumer_error.category(),
                        "Permanent handler failure; dead-lettering"
                    );
                    self.resolve_dead_letter(&receipt, consumer_error.category(), elapsed, true)
                        .await
                } else {
                    warn!(
                        queue_name,
                        message_id = %receipt.message_id(),
                        error = %consumer_error,
                        "Transient handler failure; abandoning for redelivery"
                    );
                    self.resolve_abandon(&receipt, elapsed, true).await
                }
            }
            Err(join_error) => {
                self.record_handler_result(false, elapsed);
                self.metrics.record_consumer_error(queue_name, "panic", false);
                error!(
                    queue_name,
                    message_id = %receipt.message_id(),
                    error = %join_error,
                    "Handler panicked; abandoning for redelivery"
                );
                self.resolve_abandon(&receipt, elapsed, true).await
            }
        }
    }

    /// Wait until no handler is running or `grace` elapses. Returns whether
    /// every handler finished.
    pub async fn drain(&self, grace: Duration) -> bool {
        let slots = u32::try_from(self.config.max_concurrent_messages).unwrap_or(u32::MAX);
        matches!(
            tokio::time::timeout(grace, self.permits.acquire_many(slots)).await,
            Ok(Ok(_))
        )
    }

    /// Publish a health report every `health_check_interval` until `shutdown`
    pub fn spawn_health_monitor(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.health_check_interval());

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(queue_name = self.queue_name(), "Health monitor stopped");
                        break;
                    }
                    _ = interval.tick() => {
                        let report = self.check_health().await;
                        self.publish_health(report);
                    }
                }
            }
        })
    }

    fn publish_health(&self, report: QueueHealthReport) {
        let queue_name = self.queue_name();
        match report.status {
            QueueHealthStatus::Healthy => {
                debug!(queue_name, active = report.active_count, "Queue healthy");
            }
            QueueHealthStatus::Degraded => {
                warn!(
                    queue_name,
                    issues = ?report.issues,
                    active = report.active_count,
                    dead_letters = report.dead_letter_count,
                    current_load = report.current_load,
                    "Queue health degraded"
                );
            }
            QueueHealthStatus::Unhealthy => {
                error!(
                    queue_name,
                    issues = ?report.issues,
                    circuit_state = %report.circuit_state,
                    "Queue unhealthy"
                );
            }
        }

        *self
            .latest_health
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);
    }

    fn queue_name(&self) -> &str {
        self.queue.name().as_str()
    }

    fn record_handler_result(&self, success: bool, elapsed: Duration) {
        let queue_name = self.queue_name();
        self.strategy
            .record_processing_time(queue_name, elapsed, success);
        if success {
            self.breakers.record_success(queue_name);
        } else {
            self.breakers.record_failure(queue_name);
        }
    }

    /// Meter a store error. Outages also count as a breaker and strategy
    /// failure unless this message's handler failure was already counted.
    fn record_store_failure(&self, error: &QueueError, failure_counted: bool) {
        let queue_name = self.queue_name();
        self.metrics.record_store_error(queue_name);
        if error.is_store_outage() && !failure_counted {
            self.breakers.record_failure(queue_name);
            self.strategy
                .record_processing_time(queue_name, Duration::ZERO, false);
        }
    }

    async fn resolve_dead_letter(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
        elapsed: Duration,
        handler_failed: bool,
    ) -> ProcessingOutcome {
        match self.queue.dead_letter(receipt, reason).await {
            Ok(true) => self.finish(
                ProcessingOutcome::DeadLettered {
                    reason: reason.to_string(),
                },
                elapsed,
            ),
            Ok(false) => self.already_resolved(receipt, elapsed),
            Err(e) => self.resolution_failed(receipt, e, elapsed, handler_failed),
        }
    }

    async fn resolve_abandon(
        &self,
        receipt: &ReceiptHandle,
        elapsed: Duration,
        handler_failed: bool,
    ) -> ProcessingOutcome {
        match self.queue.abandon(receipt).await {
            Ok(AbandonOutcome::Rescheduled { delivery_count, .. }) => {
                self.finish(ProcessingOutcome::Abandoned { delivery_count }, elapsed)
            }
            Ok(AbandonOutcome::DeadLettered { .. }) => self.finish(
                ProcessingOutcome::DeadLettered {
                    reason: REASON_MAX_DELIVERY_COUNT.to_string(),
                },
                elapsed,
            ),
            Ok(AbandonOutcome::AlreadyResolved) => self.already_resolved(receipt, elapsed),
            Err(e) => self.resolution_failed(receipt, e, elapsed, handler_failed),
        }
    }

    fn already_resolved(&self, receipt: &ReceiptHandle, elapsed: Duration) -> ProcessingOutcome {
        warn!(
            queue_name = self.queue_name(),
            message_id = %receipt.message_id(),
            "Message lease was recovered before the handler finished"
        );
        self.finish(
            ProcessingOutcome::Unresolved {
                reason: "already resolved".to_string(),
            },
            elapsed,
        )
    }

    fn resolution_failed(
        &self,
        receipt: &ReceiptHandle,
        error: QueueError,
        elapsed: Duration,
        handler_failed: bool,
    ) -> ProcessingOutcome {
        self.record_store_failure(&error, handler_failed);
        error!(
            queue_name = self.queue_name(),
            message_id = %receipt.message_id(),
            error = %error,
            "Failed to resolve message; it will be redelivered after its lease expires"
        );
        self.finish(
            ProcessingOutcome::Unresolved {
                reason: error.to_string(),
            },
            elapsed,
        )
    }

    fn finish(&self, outcome: ProcessingOutcome, elapsed: Duration) -> ProcessingOutcome {
        self.metrics
            .record_message_processed(self.queue_name(), elapsed, outcome.as_str());
        outcome
    }
}

#[async_trait]
impl<T> HealthChecker for MessageProcessor<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn check_health(&self) -> QueueHealthReport {
        let queue_name = self.queue_name();
        let statistics = self.queue.get_statistics().await;

        if let Ok(stats) = &statistics {
            self.strategy.update_backlog(queue_name, stats.backlog());
            self.metrics.record_queue_depth(
                queue_name,
                (stats.active_count() + stats.delayed_count) as i64,
            );
            self.metrics
                .record_dead_letter_queue_depth(queue_name, stats.dead_letter_count as i64);
        }

        QueueHealthReport::assess(
            queue_name,
            statistics.as_ref().map_err(|e| e.to_string()),
            self.current_load(),
            self.breakers.state(queue_name),
            &self.config.health,
        )
    }
}

/// Sleep for `delay` unless cancelled first. Returns `false` on cancellation.
async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;
