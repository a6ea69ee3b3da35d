//! Error types for queue, store, and consumer operations.

use std::time::Duration;
use thiserror::Error;

/// Error type for all message queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::StoreUnavailable(e) => e.is_transient(),
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if the store could not be reached at all, as opposed to
    /// rejecting a command
    pub fn is_store_outage(&self) -> bool {
        matches!(self, Self::StoreUnavailable(e) if e.is_outage())
    }
}

/// Errors raised by a backing store adapter
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store connection failed: {message}")]
    Unavailable { message: String },

    #[error("Store operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Store command '{command}' failed: {message}")]
    Command { command: String, message: String },

    #[error("Unexpected store reply for '{command}': {message}")]
    Protocol { command: String, message: String },
}

impl StoreError {
    /// Check if the failure may clear up on its own
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable { .. } => true,
            Self::Timeout { .. } => true,
            Self::Command { .. } => true,
            Self::Protocol { .. } => false,
        }
    }

    /// Connection loss or timeout
    pub fn is_outage(&self) -> bool {
        matches!(self, Self::Unavailable { .. } | Self::Timeout { .. })
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Unsupported store '{store}': {message}")]
    UnsupportedStore { store: String, message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Failure reported by a message consumer.
///
/// The variant decides how the processor resolves the message: permanent
/// failures are dead-lettered immediately, everything else is abandoned and
/// retried with backoff.
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Transient failure: {0}")]
    Transient(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConsumerError {
    /// Check if retrying the message can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidArgument(_) | Self::Validation(_) | Self::Unsupported(_) | Self::Malformed(_)
        )
    }

    /// Short category label used for dead-letter reasons and logs
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid-argument",
            Self::Validation(_) => "validation",
            Self::Unsupported(_) => "unsupported",
            Self::Malformed(_) => "malformed",
            Self::Transient(_) => "transient",
            Self::Other(_) => "error",
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
