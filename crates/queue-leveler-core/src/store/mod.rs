//! Backing store adapters.
//!
//! The message queue is built on a handful of keyed-store primitives: list
//! push and atomic list-to-list move, sorted sets scored by Unix time, and
//! hash counters. Any store offering these (Redis being the obvious one) can
//! back a queue.
//!
//! Every state transition of a queued message is a single store call: either
//! a leased move ([`BackingStore::list_move_leased`]) or a guarded batch
//! ([`BackingStore::apply_guarded`]). A message is therefore never removed
//! from one structure without reaching the next, even if the store fails
//! between calls.
//!
//! - [`memory::InMemoryStore`] - process-local store for tests and development
//! - [`redis::RedisStore`] - Redis adapter (feature `redis`)

use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Single write executed as part of an atomic [`BackingStore::apply_batch`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    /// Append `value` to the tail of list `key`
    ListPush { key: String, value: String },
    /// Remove the first occurrence of `value` from list `key`
    ListRemove { key: String, value: String },
    /// Insert or re-score `member` in sorted set `key`
    SortedSetAdd {
        key: String,
        member: String,
        score: f64,
    },
    /// Remove `member` from sorted set `key`
    SortedSetRemove { key: String, member: String },
    /// Add `delta` to counter `field` of hash `key`
    HashIncrement {
        key: String,
        field: String,
        delta: i64,
    },
}

/// Primitive operations required from a keyed backing store.
///
/// Every method is a single atomic store operation. Lists are FIFO: values
/// are pushed at the tail and moved from the head.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Append a value to the tail of a list
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Atomically pop the head of `source`, push it onto the tail of
    /// `destination` and add it to sorted set `lease_key` with `lease_score`
    async fn list_move_leased(
        &self,
        source: &str,
        destination: &str,
        lease_key: &str,
        lease_score: f64,
    ) -> Result<Option<String>, StoreError>;

    /// Remove the first occurrence of `value`, returning how many were removed
    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError>;

    /// Number of values in a list
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Read up to `limit` values from the head of a list without removing them
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Insert `member` with `score`, replacing the score of an existing member
    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Up to `limit` members with score `<= max_score`, lowest score first
    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    /// Remove a member, returning whether it was present
    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Number of members in a sorted set
    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError>;

    /// Add `delta` to a hash counter, returning the new value
    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// All counters of a hash
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError>;

    /// Apply all writes atomically; either all are visible or none are
    async fn apply_batch(&self, ops: &[StoreOp]) -> Result<(), StoreError>;

    /// Apply `guard` and then `ops` as one atomic step. When `guard` is a
    /// removal that finds nothing to remove, none of `ops` are applied and
    /// `false` is returned.
    async fn apply_guarded(&self, guard: &StoreOp, ops: &[StoreOp]) -> Result<bool, StoreError>;

    /// Delete keys of any type
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Verify the store is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}
