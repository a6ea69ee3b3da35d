//! # Queue Leveler Core
//!
//! Queue-based load leveling: producers write to a durable priority queue at
//! whatever rate they like, and a background processor drains it at a pace
//! the downstream handler can sustain.
//!
//! ## Module Organization
//!
//! - [`message`] - Message envelope, identifiers, priorities and receipts
//! - [`store`] - Backing store primitives and adapters (in-memory, Redis)
//! - [`queue`] - Priority queue with delayed delivery, leases and dead-lettering
//! - [`retry`] - Redelivery backoff policy
//! - [`strategy`] - Adaptive admission, batch sizing and poll pacing
//! - [`circuit_breaker`] - Per-queue circuit breakers
//! - [`processor`] - Poll loop, handler dispatch and graceful shutdown
//! - [`health`] - Queue health reports
//! - [`monitoring`] - Metrics collection interface
//! - [`config`] - Top-level configuration
//! - [`error`] - Error types
//!
//! ## Usage
//!
//! ```rust
//! use async_trait::async_trait;
//! use queue_leveler_core::{
//!     ConsumerError, InMemoryStore, MessageConsumer, MessageProcessor, MessageQueue,
//!     ProcessorConfig, QueueConfig, QueueMessage, QueueName, SendOptions,
//! };
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct PrintConsumer;
//!
//! #[async_trait]
//! impl MessageConsumer<String> for PrintConsumer {
//!     async fn handle(&self, message: &QueueMessage<String>) -> Result<(), ConsumerError> {
//!         println!("{}", message.body);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let queue = Arc::new(MessageQueue::new(
//!     QueueName::new("greetings".to_string())?,
//!     Arc::new(InMemoryStore::new()),
//!     QueueConfig::default(),
//! ));
//! queue.send("hello".to_string(), &SendOptions::new()).await?;
//!
//! let processor = Arc::new(MessageProcessor::new(
//!     queue,
//!     Arc::new(PrintConsumer),
//!     ProcessorConfig::default(),
//! ));
//! let shutdown = CancellationToken::new();
//! let handle = processor.spawn(shutdown.clone());
//!
//! shutdown.cancel();
//! handle.await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod health;
pub mod message;
pub mod monitoring;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod store;
pub mod strategy;

// Re-export commonly used types at crate root for convenience
pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerRegistry, CircuitMetrics, CircuitState,
    QueueCircuitBreaker,
};
pub use config::{LevelerConfig, LoggingConfig, StoreConfig};
pub use error::{
    ConfigurationError, ConsumerError, QueueError, SerializationError, StoreError,
    ValidationError,
};
pub use health::{HealthChecker, HealthThresholds, QueueHealthReport, QueueHealthStatus};
pub use message::{
    MessageId, MessagePriority, QueueMessage, QueueName, ReceiptHandle, ReceivedMessage,
    SendOptions, Timestamp,
};
pub use monitoring::{InMemoryMetricsCollector, MetricsCollector, NoOpMetricsCollector};
pub use processor::{
    MessageConsumer, MessageProcessor, PollOutcome, ProcessingOutcome, ProcessorConfig,
};
pub use queue::{AbandonOutcome, DeadLetterRecord, MessageQueue, QueueConfig, QueueStatistics};
pub use retry::{BackoffKind, RedeliveryPolicy};
pub use store::{BackingStore, InMemoryStore, StoreOp};
pub use strategy::{LoadLevelingConfig, LoadLevelingSnapshot, LoadLevelingStrategy};
