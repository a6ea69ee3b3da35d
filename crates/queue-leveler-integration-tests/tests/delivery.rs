//! Delivery semantics through the full processor: priority order,
//! at-least-once redelivery with backoff, delays, expiry and dead-lettering.

mod common;

use common::{job, Harness, HarnessOptions, Reaction, ScriptedConsumer};
use queue_leveler_core::queue::{REASON_EXPIRED, REASON_MAX_DELIVERY_COUNT};
use queue_leveler_core::{MessagePriority, ProcessorConfig, SendOptions};
use std::time::Duration;

#[tokio::test]
async fn test_messages_processed_in_priority_order() {
    let options = HarnessOptions {
        processor: ProcessorConfig {
            max_concurrent_messages: 1,
            ..HarnessOptions::default().processor
        },
        ..HarnessOptions::default()
    };
    let harness = Harness::with_options(ScriptedConsumer::new(), options);

    for (id, priority) in [
        (1, MessagePriority::Low),
        (2, MessagePriority::Normal),
        (3, MessagePriority::Critical),
        (4, MessagePriority::High),
        (5, MessagePriority::Critical),
    ] {
        harness
            .queue
            .send(job(id), &SendOptions::new().with_priority(priority))
            .await
            .unwrap();
    }

    let handle = harness.start();
    assert!(
        harness.wait_for_stats(|stats| stats.total_completed == 5).await
    );
    harness.stop(handle).await;

    assert_eq!(harness.consumer.delivered_jobs(), vec![3, 5, 4, 2, 1]);
}

/// Transient failures are retried until the handler succeeds.
#[tokio::test]
async fn test_transient_failures_redelivered_until_success() {
    let consumer = ScriptedConsumer::new();
    consumer.react(1, Reaction::FailTimes(2));
    let harness = Harness::with_consumer(consumer);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    assert!(
        harness.wait_for_stats(|stats| stats.total_completed == 1).await
    );
    harness.stop(handle).await;

    let counts: Vec<u32> = harness
        .consumer
        .deliveries()
        .iter()
        .map(|d| d.delivery_count)
        .collect();
    assert_eq!(counts, vec![0, 1, 2]);

    let stats = harness.queue.get_statistics().await.unwrap();
    assert_eq!(stats.total_abandoned, 2);
    assert_eq!(stats.dead_letter_count, 0);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter() {
    let consumer = ScriptedConsumer::new();
    consumer.react(1, Reaction::FailTimes(100));
    let harness = Harness::with_consumer(consumer);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    assert!(
        harness.wait_for_stats(|stats| stats.dead_letter_count == 1).await
    );
    harness.stop(handle).await;

    assert_eq!(harness.consumer.deliveries().len(), 3);
    let dead = harness.queue.peek_dead_letters(10).await.unwrap();
    assert_eq!(dead[0].reason.as_deref(), Some(REASON_MAX_DELIVERY_COUNT));
    assert_eq!(dead[0].message.as_ref().unwrap().delivery_count, 3);
}

#[tokio::test]
async fn test_permanent_failure_dead_lettered_without_retry() {
    let consumer = ScriptedConsumer::new();
    consumer.react(1, Reaction::FailPermanently);
    let harness = Harness::with_consumer(consumer);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();
    harness.queue.send(job(2), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    assert!(
        harness
            .wait_for_stats(|stats| stats.dead_letter_count == 1 && stats.total_completed == 1)
            .await
    );
    harness.stop(handle).await;

    let deliveries_of_one = harness
        .consumer
        .delivered_jobs()
        .into_iter()
        .filter(|id| *id == 1)
        .count();
    assert_eq!(deliveries_of_one, 1);
    let dead = harness.queue.peek_dead_letters(10).await.unwrap();
    assert_eq!(dead[0].reason.as_deref(), Some("unsupported"));
}

#[tokio::test]
async fn test_delayed_message_not_delivered_early() {
    let harness = Harness::new();
    harness
        .queue
        .send(
            job(1),
            &SendOptions::new().with_delay(Duration::from_millis(300)),
        )
        .await
        .unwrap();

    let handle = harness.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(harness.consumer.deliveries().is_empty());

    assert!(
        harness.wait_for_stats(|stats| stats.total_completed == 1).await
    );
    harness.stop(handle).await;
}

#[tokio::test]
async fn test_expired_message_never_dispatched() {
    let harness = Harness::new();
    harness
        .queue
        .send(
            job(1),
            &SendOptions::new().with_time_to_live(Duration::from_millis(1)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    let handle = harness.start();
    assert!(
        harness.wait_for_stats(|stats| stats.dead_letter_count == 1).await
    );
    harness.stop(handle).await;

    assert!(harness.consumer.deliveries().is_empty());
    let dead = harness.queue.peek_dead_letters(10).await.unwrap();
    assert_eq!(dead[0].reason.as_deref(), Some(REASON_EXPIRED));
}

#[tokio::test]
async fn test_batch_send_fully_processed() {
    let harness = Harness::new();
    let jobs = (1..=25).map(job).collect();
    let ids = harness
        .queue
        .send_batch(jobs, &SendOptions::new())
        .await
        .unwrap();
    assert_eq!(ids.len(), 25);

    let handle = harness.start();
    assert!(
        harness.wait_for_stats(|stats| stats.total_completed == 25).await
    );
    harness.stop(handle).await;

    let mut delivered = harness.consumer.delivered_jobs();
    delivered.sort_unstable();
    assert_eq!(delivered, (1..=25).collect::<Vec<_>>());
}
