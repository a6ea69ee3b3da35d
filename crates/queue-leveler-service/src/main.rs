//! # Queue-Leveler Service
//!
//! Binary entry point hosting one load-leveled queue.
//!
//! This executable:
//! - Loads configuration from files and environment
//! - Initializes structured logging
//! - Connects the configured backing store
//! - Runs the message processor, health monitor and strategy cleanup until
//!   Ctrl-C, then drains in-flight messages

use anyhow::Context;
use queue_leveler_core::{
    BackingStore, CircuitBreakerRegistry, LevelerConfig, LoadLevelingStrategy, LoggingConfig,
    MessageProcessor, MessageQueue, MetricsCollector, NoOpMetricsCollector,
};
use queue_leveler_service::{settings, DomainEvent, LoggingConsumer};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    let explicit_path = std::env::var(settings::CONFIG_FILE_ENV).ok();
    let loaded = settings::load(explicit_path.as_deref());

    // Logging settings come from the configuration; fall back to defaults so
    // a configuration failure can still be reported
    let logging = loaded
        .as_ref()
        .map(|config| config.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging);

    info!("Starting Queue-Leveler Service");
    if let Some(path) = explicit_path.as_deref().filter(|p| !p.is_empty()) {
        info!(path = %path, "Loaded configuration from explicit path");
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!(
                error = %e,
                "Service configuration is invalid; aborting. Fix the configuration and restart."
            );
            std::process::exit(3);
        }
    };

    if let Err(e) = run(config).await {
        error!(error = %format!("{:#}", e), "Service failed");
        std::process::exit(1);
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    if logging.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: LevelerConfig) -> anyhow::Result<()> {
    let queue_name = config.queue_name()?;
    let store = config
        .build_store()
        .await
        .with_context(|| format!("failed to connect {} store", config.store.kind()))?;
    store
        .ping()
        .await
        .context("backing store is not reachable")?;
    info!(
        queue_name = %queue_name,
        store = config.store.kind(),
        "Backing store connected"
    );

    let metrics: Arc<dyn MetricsCollector> = Arc::new(NoOpMetricsCollector);
    let strategy = Arc::new(LoadLevelingStrategy::with_metrics(
        config.load_leveling.clone(),
        metrics.clone(),
    ));
    let breakers = Arc::new(CircuitBreakerRegistry::with_metrics(
        config.circuit_breaker.clone(),
        metrics.clone(),
    ));
    let queue = Arc::new(MessageQueue::<DomainEvent>::new(
        queue_name.clone(),
        store,
        config.queue.clone(),
    ));

    let processor = Arc::new(
        MessageProcessor::new(queue, Arc::new(LoggingConsumer), config.processor.clone())
            .with_strategy(strategy.clone())
            .with_circuit_breakers(breakers)
            .with_metrics(metrics),
    );

    let shutdown = CancellationToken::new();
    let cleanup = strategy.spawn_cleanup(shutdown.clone());
    let health = processor.clone().spawn_health_monitor(shutdown.clone());
    let worker = processor.clone().spawn(shutdown.clone());

    info!(queue_name = %queue_name, "Service running; press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutdown signal received");
    shutdown.cancel();

    worker.await.context("processor task failed")?;
    health.await.context("health monitor task failed")?;
    cleanup.await.context("strategy cleanup task failed")?;

    info!(queue_name = %queue_name, "Queue-Leveler Service stopped");
    Ok(())
}
