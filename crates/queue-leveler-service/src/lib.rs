//! # Queue-Leveler Service
//!
//! Hosting pieces for the `queue-leveler-service` binary: the domain event
//! type the application layer publishes, its consumer, and configuration
//! loading.

pub mod consumer;
pub mod settings;

pub use consumer::{DomainEvent, LoggingConsumer};
