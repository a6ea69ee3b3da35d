//! Top-level configuration for a load-leveled queue.
//!
//! [`LevelerConfig`] gathers every tunable of one queue deployment. Each
//! section falls back to its defaults when absent, so an empty document is a
//! valid configuration backed by the in-memory store.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{ConfigurationError, QueueError};
use crate::message::QueueName;
use crate::processor::ProcessorConfig;
use crate::queue::QueueConfig;
use crate::store::{BackingStore, InMemoryStore};
use crate::strategy::LoadLevelingConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which backing store holds the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store; contents are lost on exit
    InMemory,

    /// Redis server (requires the `redis` feature)
    Redis { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::InMemory
    }
}

impl StoreConfig {
    /// Name used in logs and errors
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::Redis { .. } => "redis",
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,

    /// Enable JSON structured logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "queue_leveler_service=info,queue_leveler_core=info".to_string(),
            json_format: false,
        }
    }
}

/// Complete configuration of one leveled queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LevelerConfig {
    /// Queue name; combined with `queue.key_prefix` to form store keys
    pub queue_name: String,

    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub load_leveling: LoadLevelingConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub processor: ProcessorConfig,
    pub logging: LoggingConfig,
}

impl Default for LevelerConfig {
    fn default() -> Self {
        Self {
            queue_name: "default".to_string(),
            store: StoreConfig::default(),
            queue: QueueConfig::default(),
            load_leveling: LoadLevelingConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            processor: ProcessorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl LevelerConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.queue_name()?;

        if let StoreConfig::Redis { url } = &self.store {
            if url.trim().is_empty() {
                return Err(ConfigurationError::Missing {
                    key: "store.url".to_string(),
                });
            }
        }

        self.queue
            .validate()
            .map_err(|e| ConfigurationError::Invalid {
                message: e.to_string(),
            })?;
        self.load_leveling.validate()?;
        self.circuit_breaker.validate()?;
        self.processor.validate()
    }

    /// Parsed queue name
    pub fn queue_name(&self) -> Result<QueueName, ConfigurationError> {
        QueueName::new(self.queue_name.clone()).map_err(|e| ConfigurationError::Invalid {
            message: e.to_string(),
        })
    }

    /// Connect to the configured backing store
    pub async fn build_store(&self) -> Result<Arc<dyn BackingStore>, QueueError> {
        match &self.store {
            StoreConfig::InMemory => Ok(Arc::new(InMemoryStore::new())),
            StoreConfig::Redis { url } => connect_redis(url).await,
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(url: &str) -> Result<Arc<dyn BackingStore>, QueueError> {
    let store = crate::store::RedisStore::connect(url).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: &str) -> Result<Arc<dyn BackingStore>, QueueError> {
    Err(ConfigurationError::UnsupportedStore {
        store: "redis".to_string(),
        message: "built without the `redis` feature".to_string(),
    }
    .into())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
