//! Processor lifecycle: graceful shutdown, health monitoring, dead-letter
//! requeue and the service's domain event consumer.

mod common;

use common::{eventually, job, Harness, HarnessOptions, Reaction, ScriptedConsumer, WAIT};
use queue_leveler_core::{
    HealthChecker, HealthThresholds, InMemoryStore, MessageProcessor, MessageQueue,
    ProcessorConfig, QueueConfig, QueueHealthStatus, QueueName, SendOptions,
};
use queue_leveler_service::{DomainEvent, LoggingConsumer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_shutdown_waits_for_in_flight_handler() {
    let harness = Harness::with_consumer(ScriptedConsumer::with_handler_delay(
        Duration::from_millis(200),
    ));
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    let consumer = harness.consumer.clone();
    assert!(
        eventually(WAIT, || {
            let consumer = consumer.clone();
            async move { !consumer.deliveries().is_empty() }
        })
        .await
    );

    harness.stop(handle).await;

    let stats = harness.queue.get_statistics().await.unwrap();
    assert_eq!(stats.total_completed, 1);
    assert_eq!(stats.processing_count, 0);
    assert_eq!(harness.processor.current_load(), 0);
}

#[tokio::test]
async fn test_stopped_processor_takes_no_new_work() {
    let harness = Harness::new();
    let handle = harness.start();
    harness.stop(handle).await;

    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(harness.consumer.deliveries().is_empty());
    assert_eq!(
        harness.queue.get_statistics().await.unwrap().active_count(),
        1
    );
}

#[tokio::test]
async fn test_health_monitor_flags_dead_letters() {
    let consumer = ScriptedConsumer::new();
    consumer.react(1, Reaction::FailPermanently);
    let options = HarnessOptions {
        processor: ProcessorConfig {
            health: HealthThresholds {
                max_dead_letter_count: 0,
                ..HealthThresholds::default()
            },
            ..HarnessOptions::default().processor
        },
        ..HarnessOptions::default()
    };
    let harness = Harness::with_options(consumer, options);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    let monitor = harness
        .processor
        .clone()
        .spawn_health_monitor(harness.shutdown.clone());

    let processor = harness.processor.clone();
    assert!(
        eventually(WAIT, || {
            let processor = processor.clone();
            async move {
                processor
                    .latest_health()
                    .map_or(false, |report| report.status == QueueHealthStatus::Degraded)
            }
        })
        .await
    );
    harness.stop(handle).await;
    monitor.await.unwrap();

    let report = harness.processor.latest_health().unwrap();
    assert_eq!(report.dead_letter_count, 1);
    assert!(report.issues.iter().any(|issue| issue.contains("dead-letter")));
    assert!(harness.processor.check_readiness().await);
}

/// Dead-lettered messages can be put back once the cause is fixed.
#[tokio::test]
async fn test_requeued_dead_letters_are_processed() {
    let consumer = ScriptedConsumer::new();
    consumer.react(1, Reaction::FailPermanently);
    let harness = Harness::with_consumer(consumer);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    assert!(harness.wait_for_stats(|stats| stats.dead_letter_count == 1).await);

    harness.consumer.react(1, Reaction::Succeed);
    assert_eq!(harness.queue.requeue_dead_letters(10).await.unwrap(), 1);

    assert!(harness.wait_for_stats(|stats| stats.total_completed == 1).await);
    harness.stop(handle).await;

    let deliveries = harness.consumer.deliveries();
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[1].delivery_count, 0);
}

/// Domain events flow through the service consumer; malformed events are
/// dead-lettered with their validation category.
#[tokio::test]
async fn test_domain_events_through_service_consumer() {
    let queue = Arc::new(MessageQueue::<DomainEvent>::new(
        QueueName::new("domain-events".to_string()).unwrap(),
        Arc::new(InMemoryStore::new()),
        QueueConfig::default(),
    ));
    let processor = Arc::new(MessageProcessor::new(
        queue.clone(),
        Arc::new(LoggingConsumer),
        ProcessorConfig {
            empty_queue_delay_ms: 5,
            ..ProcessorConfig::default()
        },
    ));

    queue
        .send(
            DomainEvent::new("application.created", "app-1")
                .with_data(serde_json::json!({ "plot": 12 })),
            &SendOptions::new().with_correlation_id("req-1".to_string()),
        )
        .await
        .unwrap();
    queue
        .send(DomainEvent::new("", "app-2"), &SendOptions::new())
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = processor.clone().spawn(shutdown.clone());

    let stats_queue = queue.clone();
    assert!(
        eventually(WAIT, || {
            let queue = stats_queue.clone();
            async move {
                queue.get_statistics().await.map_or(false, |stats| {
                    stats.total_completed == 1 && stats.dead_letter_count == 1
                })
            }
        })
        .await
    );

    shutdown.cancel();
    handle.await.unwrap();

    let dead = queue.peek_dead_letters(10).await.unwrap();
    assert_eq!(dead[0].reason.as_deref(), Some("validation"));
    assert_eq!(
        dead[0].message.as_ref().unwrap().body.aggregate_id,
        "app-2"
    );
}
