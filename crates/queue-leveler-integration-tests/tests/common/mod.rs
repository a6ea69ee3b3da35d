//! Common test utilities for queue-leveler integration tests
//!
//! This module provides:
//! - A scriptable consumer that records every delivery
//! - A harness wiring store, queue, strategy, breakers and processor
//! - Polling helpers for asynchronous assertions

use async_trait::async_trait;
use queue_leveler_core::{
    BackoffKind, CircuitBreakerConfig, CircuitBreakerRegistry, ConsumerError,
    InMemoryMetricsCollector, InMemoryStore, LoadLevelingConfig, LoadLevelingStrategy,
    MessageConsumer, MessageProcessor, MessageQueue, ProcessorConfig, QueueConfig, QueueMessage,
    QueueName, QueueStatistics, RedeliveryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test payload
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: u32,
}

pub fn job(id: u32) -> Job {
    Job { id }
}

// ============================================================================
// Scripted consumer
// ============================================================================

/// How the consumer reacts to one job
#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
pub enum Reaction {
    Succeed,
    /// Fail transiently this many times, then succeed
    FailTimes(u32),
    FailPermanently,
    Panic,
}

/// One handler invocation
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub job: u32,
    pub delivery_count: u32,
}

/// Consumer whose behaviour is scripted per job id
#[derive(Default)]
pub struct ScriptedConsumer {
    reactions: Mutex<HashMap<u32, Reaction>>,
    failures: Mutex<HashMap<u32, u32>>,
    deliveries: Mutex<Vec<Delivery>>,
    handler_delay: Option<Duration>,
}

#[allow(dead_code)]
impl ScriptedConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handler sleeps for `delay` before reacting
    pub fn with_handler_delay(delay: Duration) -> Self {
        Self {
            handler_delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn react(&self, job: u32, reaction: Reaction) {
        self.reactions.lock().unwrap().insert(job, reaction);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap().clone()
    }

    pub fn delivered_jobs(&self) -> Vec<u32> {
        self.deliveries().into_iter().map(|d| d.job).collect()
    }
}

#[async_trait]
impl MessageConsumer<Job> for ScriptedConsumer {
    async fn handle(&self, message: &QueueMessage<Job>) -> Result<(), ConsumerError> {
        let id = message.body.id;
        self.deliveries.lock().unwrap().push(Delivery {
            job: id,
            delivery_count: message.delivery_count,
        });

        if let Some(delay) = self.handler_delay {
            tokio::time::sleep(delay).await;
        }

        let reaction = self
            .reactions
            .lock()
            .unwrap()
            .get(&id)
            .copied()
            .unwrap_or(Reaction::Succeed);

        match reaction {
            Reaction::Succeed => Ok(()),
            Reaction::FailTimes(times) => {
                let mut failures = self.failures.lock().unwrap();
                let count = failures.entry(id).or_insert(0);
                if *count < times {
                    *count += 1;
                    Err(ConsumerError::Transient(format!("job {} not ready", id)))
                } else {
                    Ok(())
                }
            }
            Reaction::FailPermanently => {
                Err(ConsumerError::Unsupported(format!("job {} rejected", id)))
            }
            Reaction::Panic => panic!("job {} crashed the handler", id),
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

/// Settings tuned so tests run in milliseconds
pub struct HarnessOptions {
    pub queue: QueueConfig,
    pub processor: ProcessorConfig,
    pub strategy: LoadLevelingConfig,
    pub breaker: CircuitBreakerConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            queue: QueueConfig {
                redelivery: RedeliveryPolicy::new(
                    BackoffKind::Fixed,
                    Duration::from_millis(10),
                    Duration::from_secs(1),
                    2.0,
                )
                .with_max_delivery_count(3),
                ..QueueConfig::default()
            },
            processor: ProcessorConfig {
                max_concurrent_messages: 4,
                empty_queue_delay_ms: 5,
                circuit_open_delay_ms: 5,
                store_error_delay_ms: 5,
                shutdown_grace_period_seconds: 5,
                health_check_interval_seconds: 1,
                ..ProcessorConfig::default()
            },
            strategy: LoadLevelingConfig {
                initial_throttle_delay_ms: 0,
                min_delay_ms: 1,
                ..LoadLevelingConfig::default()
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout_seconds: 30,
                success_threshold: 1,
            },
        }
    }
}

pub struct Harness {
    pub store: InMemoryStore,
    pub queue: Arc<MessageQueue<Job>>,
    pub consumer: Arc<ScriptedConsumer>,
    pub metrics: Arc<InMemoryMetricsCollector>,
    pub processor: Arc<MessageProcessor<Job>>,
    pub shutdown: CancellationToken,
}

#[allow(dead_code)]
impl Harness {
    pub fn new() -> Self {
        Self::with_options(ScriptedConsumer::new(), HarnessOptions::default())
    }

    pub fn with_consumer(consumer: ScriptedConsumer) -> Self {
        Self::with_options(consumer, HarnessOptions::default())
    }

    pub fn with_options(consumer: ScriptedConsumer, options: HarnessOptions) -> Self {
        Self::on_store(InMemoryStore::new(), consumer, options)
    }

    /// Build a harness over an existing store, e.g. to simulate a restart
    pub fn on_store(
        store: InMemoryStore,
        consumer: ScriptedConsumer,
        options: HarnessOptions,
    ) -> Self {
        let queue = Arc::new(MessageQueue::new(
            QueueName::new("jobs".to_string()).unwrap(),
            Arc::new(store.clone()),
            options.queue,
        ));
        let consumer = Arc::new(consumer);
        let metrics = Arc::new(InMemoryMetricsCollector::new());

        let processor = MessageProcessor::new(queue.clone(), consumer.clone(), options.processor)
            .with_strategy(Arc::new(LoadLevelingStrategy::with_metrics(
                options.strategy,
                metrics.clone(),
            )))
            .with_circuit_breakers(Arc::new(CircuitBreakerRegistry::with_metrics(
                options.breaker,
                metrics.clone(),
            )))
            .with_metrics(metrics.clone());

        Self {
            store,
            queue,
            consumer,
            metrics,
            processor: Arc::new(processor),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start the poll loop
    pub fn start(&self) -> JoinHandle<()> {
        self.processor.clone().spawn(self.shutdown.clone())
    }

    /// Poll queue statistics until `check` holds or [`WAIT`] elapses
    pub async fn wait_for_stats<F>(&self, check: F) -> bool
    where
        F: Fn(&QueueStatistics) -> bool,
    {
        let queue = &self.queue;
        let check = &check;
        eventually(WAIT, || async move {
            match queue.get_statistics().await {
                Ok(stats) => check(&stats),
                Err(_) => false,
            }
        })
        .await
    }

    /// Cancel and wait for the poll loop to drain
    pub async fn stop(&self, handle: JoinHandle<()>) {
        self.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("processor did not stop in time")
            .expect("processor task panicked");
    }
}

// ============================================================================
// Polling helpers
// ============================================================================

/// Poll `check` until it returns true or `timeout` elapses
#[allow(dead_code)]
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub const WAIT: Duration = Duration::from_secs(5);
