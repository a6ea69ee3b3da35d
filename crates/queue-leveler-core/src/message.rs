//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated queue name with length and character restrictions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueName(String);

impl QueueName {
    /// Create new queue name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "queue_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        // Store keys are built as `{prefix}:{queue}:{structure}`, so no colons
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "only ASCII alphanumeric, hyphens, underscores, and dots allowed"
                    .to_string(),
            });
        }

        if name.starts_with('-') || name.ends_with('-') || name.contains("--") {
            return Err(ValidationError::InvalidFormat {
                field: "queue_name".to_string(),
                message: "no leading/trailing hyphens or consecutive hyphens".to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Create queue name with prefix
    pub fn with_prefix(prefix: &str, base_name: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}-{}", prefix, base_name))
    }

    /// Get queue name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for QueueName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Unique identifier for messages within the queue system
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Timestamp shifted forward by `duration`, saturating at the maximum
    pub fn add_duration(&self, duration: Duration) -> Self {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(Self(DateTime::<Utc>::MAX_UTC))
    }

    /// Time elapsed from `earlier` to `self`, zero if `earlier` is later
    pub fn duration_since(&self, earlier: &Timestamp) -> Duration {
        (self.0 - earlier.0).to_std().unwrap_or(Duration::ZERO)
    }

    /// Unix time in fractional seconds, used as a sorted-set score
    pub fn as_score(&self) -> f64 {
        self.0.timestamp_millis() as f64 / 1000.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Delivery priority of a message.
///
/// Receivers drain higher tiers first; there is no fairness across tiers, so
/// a sustained flood of `Critical` messages starves the lower tiers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum MessagePriority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl MessagePriority {
    /// All tiers in receive order (highest first)
    pub const ALL: [MessagePriority; 4] = [
        MessagePriority::Critical,
        MessagePriority::High,
        MessagePriority::Normal,
        MessagePriority::Low,
    ];

    /// Lower-case name used in store keys and statistics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for MessagePriority {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            _ => Err(ValidationError::InvalidFormat {
                field: "priority".to_string(),
                message: format!("unknown priority '{}'", s),
            }),
        }
    }
}

/// Envelope stored in the backing store for every queued message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage<T> {
    pub id: MessageId,
    pub body: T,
    pub enqueued_time: Timestamp,
    pub dequeue_time: Option<Timestamp>,
    pub delivery_count: u32,
    pub priority: MessagePriority,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub label: Option<String>,
    pub time_to_live: Option<Duration>,
    pub expires_at: Option<Timestamp>,
    #[serde(default)]
    pub properties: HashMap<String, String>,
}

impl<T> QueueMessage<T> {
    /// Create a fresh envelope for `body` using the send options
    pub fn new(body: T, options: &SendOptions) -> Self {
        let now = Timestamp::now();
        let expires_at = options.time_to_live.map(|ttl| now.add_duration(ttl));

        Self {
            id: MessageId::new(),
            body,
            enqueued_time: now,
            dequeue_time: None,
            delivery_count: 0,
            priority: options.priority,
            correlation_id: options.correlation_id.clone(),
            reply_to: options.reply_to.clone(),
            label: options.label.clone(),
            time_to_live: options.time_to_live,
            expires_at,
            properties: options.properties.clone(),
        }
    }

    /// Check if the message TTL has elapsed at `now`
    pub fn is_expired_at(&self, now: &Timestamp) -> bool {
        self.expires_at.map_or(false, |expires_at| *now >= expires_at)
    }

    /// Time since the message was first enqueued
    pub fn age_at(&self, now: &Timestamp) -> Duration {
        now.duration_since(&self.enqueued_time)
    }

    /// Check if message has reached the maximum delivery count
    pub fn has_reached_max_delivery_count(&self, max_count: u32) -> bool {
        self.delivery_count >= max_count
    }
}

/// Opaque token identifying the exact stored entry of a received message.
///
/// Completion, abandonment and dead-lettering remove this precise entry from
/// the processing list, which makes repeated completion a harmless no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptHandle {
    entry: String,
    message_id: MessageId,
    received_at: Timestamp,
    lease_expires_at: Timestamp,
}

impl ReceiptHandle {
    /// Create new receipt handle
    pub fn new(
        entry: String,
        message_id: MessageId,
        received_at: Timestamp,
        lease_expires_at: Timestamp,
    ) -> Self {
        Self {
            entry,
            message_id,
            received_at,
            lease_expires_at,
        }
    }

    /// Serialized entry as held in the processing list
    pub fn entry(&self) -> &str {
        &self.entry
    }

    /// Identifier of the received message
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Time the message was received
    pub fn received_at(&self) -> Timestamp {
        self.received_at
    }

    /// Check if the visibility lease has run out
    pub fn is_expired(&self) -> bool {
        Timestamp::now() >= self.lease_expires_at
    }

    /// Get time until the visibility lease runs out
    pub fn time_until_expiry(&self) -> Duration {
        self.lease_expires_at.duration_since(&Timestamp::now())
    }
}

/// A message received from the queue together with its receipt
#[derive(Debug, Clone)]
pub struct ReceivedMessage<T> {
    pub message: QueueMessage<T>,
    pub receipt: ReceiptHandle,
}

impl<T> ReceivedMessage<T> {
    /// Message identifier
    pub fn id(&self) -> &MessageId {
        &self.message.id
    }
}

// ============================================================================
// Send Options
// ============================================================================

/// Configuration options for sending messages to queues
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Priority tier the message is queued on
    pub priority: MessagePriority,
    /// Correlation ID for request/response and tracing patterns
    pub correlation_id: Option<String>,
    /// Address replies should be sent to
    pub reply_to: Option<String>,
    /// Free-form label (typically the domain event name)
    pub label: Option<String>,
    /// Time-to-live for automatic message expiration
    pub time_to_live: Option<Duration>,
    /// Earliest time the message becomes visible to receivers
    pub delay_until: Option<Timestamp>,
    /// Custom properties for metadata and routing information
    pub properties: HashMap<String, String>,
}

impl SendOptions {
    /// Create new send options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority tier
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set correlation ID for tracing
    pub fn with_correlation_id(mut self, correlation_id: String) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Set reply address
    pub fn with_reply_to(mut self, reply_to: String) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    /// Set label
    pub fn with_label(mut self, label: String) -> Self {
        self.label = Some(label);
        self
    }

    /// Set time-to-live for message expiration
    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Set scheduled delivery time
    pub fn with_delay_until(mut self, time: Timestamp) -> Self {
        self.delay_until = Some(time);
        self
    }

    /// Set scheduled delivery with a delay from now
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_until = Some(Timestamp::now().add_duration(delay));
        self
    }

    /// Add a custom property
    pub fn with_property(mut self, key: String, value: String) -> Self {
        self.properties.insert(key, value);
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
