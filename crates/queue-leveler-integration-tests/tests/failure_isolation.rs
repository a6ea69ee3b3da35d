//! Failure isolation: panicking handlers, store outages, crashed workers and
//! bounded concurrency.

mod common;

use common::{eventually, job, Harness, HarnessOptions, Reaction, ScriptedConsumer, WAIT};
use queue_leveler_core::{CircuitBreakerConfig, CircuitState, ProcessorConfig, SendOptions};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_panicking_handler_does_not_stop_processor() {
    let consumer = ScriptedConsumer::new();
    consumer.react(1, Reaction::Panic);
    let harness = Harness::with_consumer(consumer);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();
    harness.queue.send(job(2), &SendOptions::new()).await.unwrap();

    let handle = harness.start();
    assert!(
        harness
            .wait_for_stats(|stats| stats.total_completed == 1 && stats.dead_letter_count == 1)
            .await
    );
    harness.stop(handle).await;

    let panics = harness
        .consumer
        .delivered_jobs()
        .into_iter()
        .filter(|id| *id == 1)
        .count();
    assert_eq!(panics, 3);
    assert_eq!(
        harness
            .metrics
            .counter("consumer_errors_total{jobs,panic,false}"),
        3
    );
}

/// A store outage trips the breaker; once the store returns and the
/// recovery timeout passes, processing resumes and the breaker closes.
#[tokio::test]
async fn test_store_outage_opens_breaker_then_recovers() {
    let options = HarnessOptions {
        breaker: CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout_seconds: 1,
            success_threshold: 1,
        },
        ..HarnessOptions::default()
    };
    let harness = Harness::with_options(ScriptedConsumer::new(), options);
    harness.store.simulate_outage(true);

    let handle = harness.start();
    let breakers = harness.processor.circuit_breakers().clone();
    assert!(
        eventually(WAIT, || {
            let breakers = breakers.clone();
            async move { breakers.state("jobs") == CircuitState::Open }
        })
        .await
    );
    assert!(harness.metrics.counter("store_errors_total{jobs}") >= 3);

    harness.store.simulate_outage(false);
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    assert!(harness.wait_for_stats(|stats| stats.total_completed == 1).await);
    harness.stop(handle).await;

    assert_eq!(breakers.state("jobs"), CircuitState::Closed);
    assert!(
        harness
            .metrics
            .counter("polls_skipped_total{jobs,circuit_open}")
            > 0
    );
}

/// Messages held by a worker that died are redelivered once their lease
/// runs out.
#[tokio::test]
async fn test_crashed_worker_messages_recovered() {
    let harness = Harness::new();
    harness.queue.send(job(1), &SendOptions::new()).await.unwrap();

    let abandoned = harness
        .queue
        .receive(1, Duration::from_millis(20))
        .await
        .unwrap();
    assert_eq!(abandoned.len(), 1);
    drop(abandoned);
    tokio::time::sleep(Duration::from_millis(30)).await;

    let handle = harness.start();
    assert!(harness.wait_for_stats(|stats| stats.total_completed == 1).await);
    harness.stop(handle).await;

    let deliveries = harness.consumer.deliveries();
    assert_eq!(deliveries.len(), 1);
    assert_eq!(deliveries[0].delivery_count, 1);
}

#[tokio::test]
async fn test_concurrency_bounded_by_handler_slots() {
    let options = HarnessOptions {
        processor: ProcessorConfig {
            max_concurrent_messages: 2,
            ..HarnessOptions::default().processor
        },
        ..HarnessOptions::default()
    };
    let harness = Harness::with_options(
        ScriptedConsumer::with_handler_delay(Duration::from_millis(40)),
        options,
    );
    for id in 1..=6 {
        harness.queue.send(job(id), &SendOptions::new()).await.unwrap();
    }

    let peak = Arc::new(AtomicUsize::new(0));
    let handle = harness.start();
    let processor = harness.processor.clone();
    let sampler_peak = peak.clone();
    let sampler = tokio::spawn(async move {
        loop {
            sampler_peak.fetch_max(processor.current_load(), Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    });

    assert!(harness.wait_for_stats(|stats| stats.total_completed == 6).await);
    sampler.abort();
    harness.stop(handle).await;

    let peak = peak.load(Ordering::SeqCst);
    assert!(peak >= 1);
    assert!(peak <= 2, "peak load {} exceeded handler slots", peak);
}
