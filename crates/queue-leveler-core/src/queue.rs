//! Priority-aware durable message queue.
//!
//! A queue named `orders` under the default prefix is laid out in the backing
//! store as:
//!
//! | Key                                   | Type       | Holds                                  |
//! |---------------------------------------|------------|----------------------------------------|
//! | `queue-leveler:orders:priority:<tier>`| list       | visible messages, one list per tier    |
//! | `queue-leveler:orders:processing`     | list       | received, not yet resolved             |
//! | `queue-leveler:orders:leases`         | sorted set | processing entries by lease expiry     |
//! | `queue-leveler:orders:delayed`        | sorted set | scheduled/backed-off entries by ready  |
//! | `queue-leveler:orders:deadletter`     | list       | terminal entries                       |
//! | `queue-leveler:orders:stats`          | hash       | cumulative counters                    |
//!
//! Every list/set member is the full serialized [`QueueMessage`] envelope. The
//! exact string moved into the processing list is the receipt used to resolve
//! the message, so whichever caller removes it from the processing list owns
//! the resolution and everyone else becomes a no-op.

use crate::error::{QueueError, SerializationError, ValidationError};
use crate::message::{
    MessageId, MessagePriority, QueueMessage, QueueName, ReceiptHandle, ReceivedMessage,
    SendOptions, Timestamp,
};
use crate::retry::RedeliveryPolicy;
use crate::store::{BackingStore, StoreOp};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Dead-letter reason for messages whose TTL elapsed before delivery
pub const REASON_EXPIRED: &str = "expired";
/// Dead-letter reason for messages older than the queue's maximum age
pub const REASON_MAX_AGE_EXCEEDED: &str = "max-age-exceeded";
/// Dead-letter reason for messages abandoned too many times
pub const REASON_MAX_DELIVERY_COUNT: &str = "max-delivery-count-exceeded";
/// Dead-letter reason for entries that are not valid envelopes
pub const REASON_MALFORMED: &str = "malformed";

/// Property stamped on dead-lettered messages with the reason
pub const DEAD_LETTER_REASON_PROPERTY: &str = "dead_letter_reason";
/// Property stamped on dead-lettered messages with the RFC 3339 time
pub const DEAD_LETTERED_AT_PROPERTY: &str = "dead_lettered_at";

const STAT_SENT: &str = "sent";
const STAT_RECEIVED: &str = "received";
const STAT_COMPLETED: &str = "completed";
const STAT_ABANDONED: &str = "abandoned";
const STAT_DEAD_LETTERED: &str = "dead_lettered";

// ============================================================================
// Configuration
// ============================================================================

/// Per-queue behavior settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix of every store key owned by the queue
    pub key_prefix: String,

    /// Backoff and delivery ceiling for abandoned messages
    pub redelivery: RedeliveryPolicy,

    /// Visibility timeout used when callers do not supply one (milliseconds)
    pub default_visibility_timeout_ms: u64,

    /// Maximum delayed entries promoted per receive
    pub promotion_batch_size: usize,

    /// Maximum expired leases recovered per receive
    pub lease_recovery_batch_size: usize,

    /// Messages older than this are dead-lettered on receive (milliseconds)
    pub max_message_age_ms: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "queue-leveler".to_string(),
            redelivery: RedeliveryPolicy::default(),
            default_visibility_timeout_ms: 30_000,
            promotion_batch_size: 100,
            lease_recovery_batch_size: 100,
            max_message_age_ms: None,
        }
    }
}

impl QueueConfig {
    /// Default visibility timeout
    pub fn default_visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.default_visibility_timeout_ms)
    }

    /// Maximum message age, if any
    pub fn max_message_age(&self) -> Option<Duration> {
        self.max_message_age_ms.map(Duration::from_millis)
    }

    /// Validate value ranges
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.key_prefix.is_empty() {
            return Err(ValidationError::Required {
                field: "queue.key_prefix".to_string(),
            });
        }
        if self.redelivery.max_delivery_count == 0 {
            return Err(ValidationError::OutOfRange {
                field: "queue.redelivery.max_delivery_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.redelivery.backoff_multiplier < 1.0 {
            return Err(ValidationError::OutOfRange {
                field: "queue.redelivery.backoff_multiplier".to_string(),
                message: "must be at least 1.0".to_string(),
            });
        }
        if self.promotion_batch_size == 0 || self.lease_recovery_batch_size == 0 {
            return Err(ValidationError::OutOfRange {
                field: "queue.promotion_batch_size".to_string(),
                message: "sweep batch sizes must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Statistics and results
// ============================================================================

/// Point-in-time view of a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub queue_name: String,
    pub active_by_priority: BTreeMap<MessagePriority, usize>,
    pub processing_count: usize,
    pub delayed_count: usize,
    pub dead_letter_count: usize,
    pub total_sent: u64,
    pub total_received: u64,
    pub total_completed: u64,
    pub total_abandoned: u64,
    pub total_dead_lettered: u64,
    pub last_updated: Timestamp,
}

impl QueueStatistics {
    /// Visible messages across all priority tiers
    pub fn active_count(&self) -> usize {
        self.active_by_priority.values().sum()
    }

    /// Messages not yet resolved: visible, delayed, and in flight
    pub fn backlog(&self) -> usize {
        self.active_count() + self.delayed_count + self.processing_count
    }
}

/// How an abandon request was resolved
#[derive(Debug, Clone, PartialEq)]
pub enum AbandonOutcome {
    /// Message goes back to the delayed set and reappears after `delay`
    Rescheduled { delivery_count: u32, delay: Duration },
    /// Delivery ceiling reached; message moved to the dead-letter list
    DeadLettered { delivery_count: u32 },
    /// Entry was no longer in the processing list
    AlreadyResolved,
}

/// Dead-letter list entry as read back by operators
#[derive(Debug, Clone)]
pub struct DeadLetterRecord<T> {
    /// Decoded envelope, `None` when the entry was malformed
    pub message: Option<QueueMessage<T>>,
    pub reason: Option<String>,
    pub raw: String,
}

struct QueueKeys {
    priorities: [String; 4],
    processing: String,
    leases: String,
    delayed: String,
    dead_letter: String,
    stats: String,
}

impl QueueKeys {
    fn new(prefix: &str, queue: &QueueName) -> Self {
        let base = format!("{}:{}", prefix, queue);
        let priority = |p: MessagePriority| format!("{}:priority:{}", base, p.as_str());
        Self {
            priorities: MessagePriority::ALL.map(priority),
            processing: format!("{}:processing", base),
            leases: format!("{}:leases", base),
            delayed: format!("{}:delayed", base),
            dead_letter: format!("{}:deadletter", base),
            stats: format!("{}:stats", base),
        }
    }

    fn priority(&self, priority: MessagePriority) -> &str {
        match priority {
            MessagePriority::Critical => &self.priorities[0],
            MessagePriority::High => &self.priorities[1],
            MessagePriority::Normal => &self.priorities[2],
            MessagePriority::Low => &self.priorities[3],
        }
    }

    fn all(&self) -> Vec<String> {
        let mut keys = self.priorities.to_vec();
        keys.extend([
            self.processing.clone(),
            self.leases.clone(),
            self.delayed.clone(),
            self.dead_letter.clone(),
            self.stats.clone(),
        ]);
        keys
    }
}

/// Envelope with the body left as raw JSON, used when rewriting stored
/// entries without knowing the body type
type RawEnvelope = QueueMessage<serde_json::Value>;

// ============================================================================
// MessageQueue
// ============================================================================

/// Durable queue of `T` messages over a [`BackingStore`]
///
/// # Example
///
/// ```rust
/// use queue_leveler_core::message::{MessagePriority, QueueName, SendOptions};
/// use queue_leveler_core::queue::{MessageQueue, QueueConfig};
/// use queue_leveler_core::store::InMemoryStore;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let queue = MessageQueue::<String>::new(
///     QueueName::new("alerts".to_string()).unwrap(),
///     Arc::new(InMemoryStore::new()),
///     QueueConfig::default(),
/// );
///
/// queue.send("disk full".to_string(), &SendOptions::new()).await.unwrap();
/// queue
///     .send(
///         "host down".to_string(),
///         &SendOptions::new().with_priority(MessagePriority::Critical),
///     )
///     .await
///     .unwrap();
///
/// let mut received = queue.receive(1, Duration::from_secs(30)).await.unwrap();
/// let first = received.remove(0);
/// assert_eq!(first.message.body, "host down");
/// queue.complete(&first.receipt).await.unwrap();
/// # });
/// ```
pub struct MessageQueue<T> {
    name: QueueName,
    store: Arc<dyn BackingStore>,
    config: QueueConfig,
    keys: QueueKeys,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MessageQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    /// Create a queue handle; no store I/O happens until the first operation
    pub fn new(name: QueueName, store: Arc<dyn BackingStore>, config: QueueConfig) -> Self {
        let keys = QueueKeys::new(&config.key_prefix, &name);
        Self {
            name,
            store,
            config,
            keys,
            _marker: PhantomData,
        }
    }

    /// Queue name
    pub fn name(&self) -> &QueueName {
        &self.name
    }

    /// Queue configuration
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Backing store handle
    pub fn store(&self) -> &Arc<dyn BackingStore> {
        &self.store
    }

    // ------------------------------------------------------------------------
    // Producer operations
    // ------------------------------------------------------------------------

    /// Enqueue one message
    pub async fn send(&self, body: T, options: &SendOptions) -> Result<MessageId, QueueError> {
        let message = QueueMessage::new(body, options);
        let id = message.id.clone();
        let mut ops = self.enqueue_ops(&message, options.delay_until)?;
        ops.push(self.stat_op(STAT_SENT, 1));

        self.store.apply_batch(&ops).await?;

        debug!(
            queue_name = %self.name,
            message_id = %id,
            priority = %options.priority,
            delayed = options.delay_until.is_some(),
            "Message sent"
        );
        Ok(id)
    }

    /// Enqueue many messages as one atomic write; either all are accepted or none
    pub async fn send_batch(
        &self,
        bodies: Vec<T>,
        options: &SendOptions,
    ) -> Result<Vec<MessageId>, QueueError> {
        if bodies.is_empty() {
            return Ok(Vec::new());
        }

        let count = bodies.len();
        let mut ids = Vec::with_capacity(count);
        let mut ops = Vec::with_capacity(count + 1);
        for body in bodies {
            let message = QueueMessage::new(body, options);
            ids.push(message.id.clone());
            ops.extend(self.enqueue_ops(&message, options.delay_until)?);
        }
        ops.push(self.stat_op(STAT_SENT, count as i64));

        self.store.apply_batch(&ops).await?;

        debug!(queue_name = %self.name, count, "Message batch sent");
        Ok(ids)
    }

    // ------------------------------------------------------------------------
    // Consumer operations
    // ------------------------------------------------------------------------

    /// Receive up to `max_messages`, highest priority first.
    ///
    /// Before draining, expired leases are recovered and due delayed messages
    /// are promoted, each in a bounded sweep. Expired, over-age and malformed
    /// entries are dead-lettered rather than returned. Never blocks waiting
    /// for messages.
    pub async fn receive(
        &self,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage<T>>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        self.recover_expired_leases(self.config.lease_recovery_batch_size)
            .await?;
        self.promote_delayed(self.config.promotion_batch_size)
            .await?;

        let now = Timestamp::now();
        let lease_expires_at = now.add_duration(visibility_timeout);
        let mut received = Vec::new();

        for priority in MessagePriority::ALL {
            while received.len() < max_messages {
                let Some(entry) = self
                    .store
                    .list_move_leased(
                        self.keys.priority(priority),
                        &self.keys.processing,
                        &self.keys.leases,
                        lease_expires_at.as_score(),
                    )
                    .await?
                else {
                    break;
                };

                let mut message = match serde_json::from_str::<QueueMessage<T>>(&entry) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(
                            queue_name = %self.name,
                            error = %e,
                            "Dead-lettering malformed queue entry"
                        );
                        self.resolve(&entry, self.dead_letter_ops(&entry, REASON_MALFORMED))
                            .await?;
                        continue;
                    }
                };

                if message.is_expired_at(&now) {
                    info!(
                        queue_name = %self.name,
                        message_id = %message.id,
                        "Dead-lettering expired message"
                    );
                    self.resolve(&entry, self.dead_letter_ops(&entry, REASON_EXPIRED))
                        .await?;
                    continue;
                }

                if let Some(max_age) = self.config.max_message_age() {
                    if message.age_at(&now) > max_age {
                        info!(
                            queue_name = %self.name,
                            message_id = %message.id,
                            max_age_ms = max_age.as_millis() as u64,
                            "Dead-lettering message older than maximum age"
                        );
                        self.resolve(&entry, self.dead_letter_ops(&entry, REASON_MAX_AGE_EXCEEDED))
                            .await?;
                        continue;
                    }
                }

                message.dequeue_time = Some(now);
                let receipt = ReceiptHandle::new(entry, message.id.clone(), now, lease_expires_at);
                received.push(ReceivedMessage { message, receipt });
            }
        }

        if !received.is_empty() {
            // The messages are already leased; a lost counter update must not
            // cost the caller its receipts
            if let Err(e) = self
                .store
                .hash_increment(&self.keys.stats, STAT_RECEIVED, received.len() as i64)
                .await
            {
                warn!(queue_name = %self.name, error = %e, "Failed to update received counter");
            }
            debug!(queue_name = %self.name, count = received.len(), "Messages received");
        }

        Ok(received)
    }

    /// Mark a received message as processed. Completing an entry that is no
    /// longer in the processing list is a no-op.
    pub async fn complete(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        let completed = self
            .resolve(receipt.entry(), vec![self.stat_op(STAT_COMPLETED, 1)])
            .await?;
        if !completed {
            debug!(
                queue_name = %self.name,
                message_id = %receipt.message_id(),
                "Complete ignored; message already resolved"
            );
            return Ok(());
        }

        debug!(queue_name = %self.name, message_id = %receipt.message_id(), "Message completed");
        Ok(())
    }

    /// Return a message for redelivery after backoff, or dead-letter it once
    /// the delivery ceiling is reached
    pub async fn abandon(&self, receipt: &ReceiptHandle) -> Result<AbandonOutcome, QueueError> {
        let (ops, outcome) = self.requeue_ops(receipt.entry())?;
        if !self.resolve(receipt.entry(), ops).await? {
            debug!(
                queue_name = %self.name,
                message_id = %receipt.message_id(),
                "Abandon ignored; message already resolved"
            );
            return Ok(AbandonOutcome::AlreadyResolved);
        }

        self.log_requeue(receipt.message_id(), &outcome);
        Ok(outcome)
    }

    /// Move a message to the dead-letter list with `reason`. Returns `false`
    /// when the message was already resolved elsewhere.
    pub async fn dead_letter(
        &self,
        receipt: &ReceiptHandle,
        reason: &str,
    ) -> Result<bool, QueueError> {
        let entry = receipt.entry();
        if !self.resolve(entry, self.dead_letter_ops(entry, reason)).await? {
            debug!(
                queue_name = %self.name,
                message_id = %receipt.message_id(),
                "Dead-letter ignored; message already resolved"
            );
            return Ok(false);
        }

        warn!(
            queue_name = %self.name,
            message_id = %receipt.message_id(),
            reason,
            "Message dead-lettered"
        );
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Maintenance operations
    // ------------------------------------------------------------------------

    /// Move up to `limit` delayed entries whose ready time has passed onto
    /// their priority list. Returns the number promoted.
    pub async fn promote_delayed(&self, limit: usize) -> Result<usize, QueueError> {
        let now = Timestamp::now();
        let due = self
            .store
            .sorted_set_range_by_score(&self.keys.delayed, now.as_score(), limit)
            .await?;

        let mut promoted = 0;
        for entry in due {
            let guard = StoreOp::SortedSetRemove {
                key: self.keys.delayed.clone(),
                member: entry.clone(),
            };

            // Only the caller whose guard removes the entry moves it
            match serde_json::from_str::<RawEnvelope>(&entry) {
                Ok(envelope) => {
                    let push = StoreOp::ListPush {
                        key: self.keys.priority(envelope.priority).to_string(),
                        value: entry.clone(),
                    };
                    if self.store.apply_guarded(&guard, &[push]).await? {
                        promoted += 1;
                    }
                }
                Err(_) => {
                    self.store
                        .apply_guarded(&guard, &self.dead_letter_ops(&entry, REASON_MALFORMED))
                        .await?;
                }
            }
        }

        if promoted > 0 {
            debug!(queue_name = %self.name, promoted, "Promoted delayed messages");
        }
        Ok(promoted)
    }

    /// Requeue up to `limit` in-flight entries whose visibility lease ran out,
    /// treating each as abandoned. Returns the number recovered.
    pub async fn recover_expired_leases(&self, limit: usize) -> Result<usize, QueueError> {
        let now = Timestamp::now();
        let expired = self
            .store
            .sorted_set_range_by_score(&self.keys.leases, now.as_score(), limit)
            .await?;

        let mut recovered = 0;
        for entry in expired {
            let (ops, outcome) = self.requeue_ops(&entry)?;
            if !self.resolve(&entry, ops).await? {
                // Resolved elsewhere; only a stale lease is left behind
                self.store
                    .sorted_set_remove(&self.keys.leases, &entry)
                    .await?;
                continue;
            }

            if let AbandonOutcome::DeadLettered { delivery_count } = outcome {
                warn!(
                    queue_name = %self.name,
                    delivery_count,
                    "Message with expired lease exceeded maximum delivery count"
                );
            }
            recovered += 1;
        }

        if recovered > 0 {
            warn!(
                queue_name = %self.name,
                recovered,
                "Recovered messages whose visibility lease expired"
            );
        }
        Ok(recovered)
    }

    /// Read up to `limit` dead-letter entries without removing them
    pub async fn peek_dead_letters(
        &self,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord<T>>, QueueError> {
        let entries = self.store.list_range(&self.keys.dead_letter, limit).await?;

        Ok(entries
            .into_iter()
            .map(|raw| {
                let message = serde_json::from_str::<QueueMessage<T>>(&raw).ok();
                let reason = serde_json::from_str::<serde_json::Value>(&raw)
                    .ok()
                    .and_then(|value| {
                        value
                            .get("properties")?
                            .get(DEAD_LETTER_REASON_PROPERTY)?
                            .as_str()
                            .map(str::to_string)
                    });
                DeadLetterRecord {
                    message,
                    reason,
                    raw,
                }
            })
            .collect())
    }

    /// Move up to `limit` dead-lettered messages back onto their priority
    /// lists with a fresh delivery count. Malformed entries stay put.
    pub async fn requeue_dead_letters(&self, limit: usize) -> Result<usize, QueueError> {
        let entries = self.store.list_range(&self.keys.dead_letter, limit).await?;

        let mut requeued = 0;
        for entry in entries {
            let Ok(mut envelope) = serde_json::from_str::<RawEnvelope>(&entry) else {
                continue;
            };
            envelope.delivery_count = 0;
            envelope.dequeue_time = None;
            envelope.properties.remove(DEAD_LETTER_REASON_PROPERTY);
            envelope.properties.remove(DEAD_LETTERED_AT_PROPERTY);

            let guard = StoreOp::ListRemove {
                key: self.keys.dead_letter.clone(),
                value: entry,
            };
            let push = StoreOp::ListPush {
                key: self.keys.priority(envelope.priority).to_string(),
                value: to_json(&envelope)?,
            };
            if self.store.apply_guarded(&guard, &[push]).await? {
                requeued += 1;
            }
        }

        if requeued > 0 {
            info!(queue_name = %self.name, requeued, "Requeued dead-lettered messages");
        }
        Ok(requeued)
    }

    /// Current counts and cumulative counters
    pub async fn get_statistics(&self) -> Result<QueueStatistics, QueueError> {
        let mut active_by_priority = BTreeMap::new();
        for priority in MessagePriority::ALL {
            let count = self.store.list_len(self.keys.priority(priority)).await?;
            active_by_priority.insert(priority, count);
        }

        let processing_count = self.store.list_len(&self.keys.processing).await?;
        let delayed_count = self.store.sorted_set_len(&self.keys.delayed).await?;
        let dead_letter_count = self.store.list_len(&self.keys.dead_letter).await?;
        let counters = self.store.hash_get_all(&self.keys.stats).await?;
        let counter = |field: &str| counters.get(field).copied().unwrap_or(0).max(0) as u64;

        Ok(QueueStatistics {
            queue_name: self.name.to_string(),
            active_by_priority,
            processing_count,
            delayed_count,
            dead_letter_count,
            total_sent: counter(STAT_SENT),
            total_received: counter(STAT_RECEIVED),
            total_completed: counter(STAT_COMPLETED),
            total_abandoned: counter(STAT_ABANDONED),
            total_dead_lettered: counter(STAT_DEAD_LETTERED),
            last_updated: Timestamp::now(),
        })
    }

    /// Delete every structure of the queue, including counters
    pub async fn purge(&self) -> Result<(), QueueError> {
        self.store.delete(&self.keys.all()).await?;
        warn!(queue_name = %self.name, "Queue purged");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn enqueue_ops(
        &self,
        message: &QueueMessage<T>,
        delay_until: Option<Timestamp>,
    ) -> Result<Vec<StoreOp>, QueueError> {
        let serialized = to_json(message)?;
        let op = match delay_until {
            Some(ready_at) if ready_at > Timestamp::now() => StoreOp::SortedSetAdd {
                key: self.keys.delayed.clone(),
                member: serialized,
                score: ready_at.as_score(),
            },
            _ => StoreOp::ListPush {
                key: self.keys.priority(message.priority).to_string(),
                value: serialized,
            },
        };
        Ok(vec![op])
    }

    fn stat_op(&self, field: &str, delta: i64) -> StoreOp {
        StoreOp::HashIncrement {
            key: self.keys.stats.clone(),
            field: field.to_string(),
            delta,
        }
    }

    /// Remove `entry` from the processing list, release its lease and apply
    /// `ops`, all in one atomic step. Returns whether this caller removed it;
    /// when it did not, nothing is written.
    async fn resolve(&self, entry: &str, mut ops: Vec<StoreOp>) -> Result<bool, QueueError> {
        let guard = StoreOp::ListRemove {
            key: self.keys.processing.clone(),
            value: entry.to_string(),
        };
        ops.insert(
            0,
            StoreOp::SortedSetRemove {
                key: self.keys.leases.clone(),
                member: entry.to_string(),
            },
        );
        Ok(self.store.apply_guarded(&guard, &ops).await?)
    }

    /// Writes that bump the delivery count of an in-flight entry and either
    /// schedule it for redelivery or dead-letter it
    fn requeue_ops(&self, entry: &str) -> Result<(Vec<StoreOp>, AbandonOutcome), QueueError> {
        let mut envelope = match serde_json::from_str::<RawEnvelope>(entry) {
            Ok(envelope) => envelope,
            Err(_) => {
                return Ok((
                    self.dead_letter_ops(entry, REASON_MALFORMED),
                    AbandonOutcome::DeadLettered { delivery_count: 0 },
                ));
            }
        };

        envelope.delivery_count = envelope.delivery_count.saturating_add(1);
        let delivery_count = envelope.delivery_count;
        let serialized = to_json(&envelope)?;

        if self.config.redelivery.is_exhausted(delivery_count) {
            return Ok((
                self.dead_letter_ops(&serialized, REASON_MAX_DELIVERY_COUNT),
                AbandonOutcome::DeadLettered { delivery_count },
            ));
        }

        let delay = self.config.redelivery.delay_for(delivery_count);
        let ready_at = Timestamp::now().add_duration(delay);
        let ops = vec![
            StoreOp::SortedSetAdd {
                key: self.keys.delayed.clone(),
                member: serialized,
                score: ready_at.as_score(),
            },
            self.stat_op(STAT_ABANDONED, 1),
        ];
        Ok((
            ops,
            AbandonOutcome::Rescheduled {
                delivery_count,
                delay,
            },
        ))
    }

    fn log_requeue(&self, message_id: &MessageId, outcome: &AbandonOutcome) {
        match outcome {
            AbandonOutcome::Rescheduled {
                delivery_count,
                delay,
            } => debug!(
                queue_name = %self.name,
                message_id = %message_id,
                delivery_count,
                delay_ms = delay.as_millis() as u64,
                "Message scheduled for redelivery"
            ),
            AbandonOutcome::DeadLettered { delivery_count } => warn!(
                queue_name = %self.name,
                message_id = %message_id,
                delivery_count,
                "Message exceeded maximum delivery count"
            ),
            AbandonOutcome::AlreadyResolved => {}
        }
    }

    fn dead_letter_ops(&self, entry: &str, reason: &str) -> Vec<StoreOp> {
        vec![
            StoreOp::ListPush {
                key: self.keys.dead_letter.clone(),
                value: stamp_dead_letter(entry, reason, Timestamp::now()),
            },
            self.stat_op(STAT_DEAD_LETTERED, 1),
        ]
    }
}

fn to_json<S: Serialize>(value: &S) -> Result<String, QueueError> {
    serde_json::to_string(value)
        .map_err(SerializationError::from)
        .map_err(QueueError::from)
}

/// Record the dead-letter reason and time in the entry's `properties`.
/// Entries that are not JSON objects are wrapped as `{"raw": ..., "properties": ...}`.
fn stamp_dead_letter(entry: &str, reason: &str, at: Timestamp) -> String {
    let stamp = |properties: &mut serde_json::Map<String, serde_json::Value>| {
        properties.insert(
            DEAD_LETTER_REASON_PROPERTY.to_string(),
            serde_json::Value::String(reason.to_string()),
        );
        properties.insert(
            DEAD_LETTERED_AT_PROPERTY.to_string(),
            serde_json::Value::String(at.to_string()),
        );
    };

    let mut value = match serde_json::from_str::<serde_json::Value>(entry) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        _ => serde_json::json!({ "raw": entry }),
    };

    if let serde_json::Value::Object(object) = &mut value {
        let properties = object
            .entry("properties")
            .or_insert_with(|| serde_json::Value::Object(serde_json::Map::new()));
        if !properties.is_object() {
            *properties = serde_json::Value::Object(serde_json::Map::new());
        }
        if let serde_json::Value::Object(map) = properties {
            stamp(map);
        }
    }

    value.to_string()
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
