//! Domain events published by the application layer and the consumer that
//! drains them.

use async_trait::async_trait;
use queue_leveler_core::{ConsumerError, QueueMessage, Timestamp};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Event raised by the application layer, e.g. `application.created`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_type: String,
    pub aggregate_id: String,
    pub occurred_at: Timestamp,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl DomainEvent {
    pub fn new(event_type: impl Into<String>, aggregate_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: aggregate_id.into(),
            occurred_at: Timestamp::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Consumer that records each event in the structured log
#[derive(Debug, Default)]
pub struct LoggingConsumer;

#[async_trait]
impl queue_leveler_core::MessageConsumer<DomainEvent> for LoggingConsumer {
    async fn handle(&self, message: &QueueMessage<DomainEvent>) -> Result<(), ConsumerError> {
        let event = &message.body;

        if event.event_type.trim().is_empty() {
            return Err(ConsumerError::Validation(
                "domain event has no event_type".to_string(),
            ));
        }
        if event.aggregate_id.trim().is_empty() {
            return Err(ConsumerError::InvalidArgument(format!(
                "domain event '{}' has no aggregate_id",
                event.event_type
            )));
        }

        info!(
            message_id = %message.id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            occurred_at = %event.occurred_at,
            delivery_count = message.delivery_count,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
            "Domain event processed"
        );
        Ok(())
    }
}

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;
