//! In-memory backing store for testing and development.
//!
//! This store keeps lists, sorted sets, and hashes in process memory behind a
//! single lock, which makes every operation (and every batch) atomic. It can
//! also simulate an outage so callers can exercise their store-failure paths.

use super::{BackingStore, StoreOp};
use crate::error::StoreError;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct StoreData {
    lists: HashMap<String, VecDeque<String>>,
    /// Members kept sorted by score; equal scores keep insertion order
    sorted_sets: HashMap<String, Vec<(f64, String)>>,
    hashes: HashMap<String, HashMap<String, i64>>,
}

impl StoreData {
    fn push(&mut self, key: &str, value: &str) {
        self.lists
            .entry(key.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    fn remove(&mut self, key: &str, value: &str) -> bool {
        let Some(list) = self.lists.get_mut(key) else {
            return false;
        };
        match list.iter().position(|v| v == value) {
            Some(index) => {
                list.remove(index);
                true
            }
            None => false,
        }
    }

    fn sorted_remove(&mut self, key: &str, member: &str) -> bool {
        let Some(set) = self.sorted_sets.get_mut(key) else {
            return false;
        };
        let before = set.len();
        set.retain(|(_, m)| m != member);
        set.len() != before
    }

    fn sorted_add(&mut self, key: &str, member: &str, score: f64) {
        let set = self.sorted_sets.entry(key.to_string()).or_default();
        set.retain(|(_, m)| m != member);
        let position = set.partition_point(|(s, _)| *s <= score);
        set.insert(position, (score, member.to_string()));
    }

    fn increment(&mut self, key: &str, field: &str, delta: i64) -> i64 {
        let counter = self
            .hashes
            .entry(key.to_string())
            .or_default()
            .entry(field.to_string())
            .or_insert(0);
        *counter += delta;
        *counter
    }

    /// Apply one op, returning `false` for a removal that found nothing
    fn apply(&mut self, op: &StoreOp) -> bool {
        match op {
            StoreOp::ListPush { key, value } => self.push(key, value),
            StoreOp::ListRemove { key, value } => return self.remove(key, value),
            StoreOp::SortedSetAdd { key, member, score } => self.sorted_add(key, member, *score),
            StoreOp::SortedSetRemove { key, member } => return self.sorted_remove(key, member),
            StoreOp::HashIncrement { key, field, delta } => {
                self.increment(key, field, *delta);
            }
        }
        true
    }
}

// ============================================================================
// InMemoryStore
// ============================================================================

/// Process-local implementation of [`BackingStore`]
#[derive(Clone, Default)]
pub struct InMemoryStore {
    data: Arc<RwLock<StoreData>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`
    /// until called again with `false`
    pub fn simulate_outage(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable {
                message: "in-memory store is simulating an outage".to_string(),
            });
        }
        Ok(())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreData>, StoreError> {
        self.check_available()?;
        self.data.write().map_err(|e| StoreError::Command {
            command: "lock".to_string(),
            message: format!("store lock poisoned: {}", e),
        })
    }

    fn read<R>(&self, f: impl FnOnce(&StoreData) -> R) -> Result<R, StoreError> {
        self.check_available()?;
        let data = self.data.read().map_err(|e| StoreError::Command {
            command: "lock".to_string(),
            message: format!("store lock poisoned: {}", e),
        })?;
        Ok(f(&data))
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn list_push(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write()?.push(key, value);
        Ok(())
    }

    async fn list_move_leased(
        &self,
        source: &str,
        destination: &str,
        lease_key: &str,
        lease_score: f64,
    ) -> Result<Option<String>, StoreError> {
        let mut data = self.write()?;
        let value = match data.lists.get_mut(source).and_then(|list| list.pop_front()) {
            Some(value) => value,
            None => return Ok(None),
        };
        data.push(destination, &value);
        data.sorted_add(lease_key, &value, lease_score);
        Ok(Some(value))
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        Ok(usize::from(self.write()?.remove(key, value)))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        self.read(|data| data.lists.get(key).map_or(0, |list| list.len()))
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        self.read(|data| {
            data.lists
                .get(key)
                .map(|list| list.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        })
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.write()?.sorted_add(key, member, score);
        Ok(())
    }

    async fn sorted_set_range_by_score(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.read(|data| {
            data.sorted_sets
                .get(key)
                .map(|set| {
                    set.iter()
                        .take_while(|(score, _)| *score <= max_score)
                        .take(limit)
                        .map(|(_, member)| member.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
    }

    async fn sorted_set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self.write()?.sorted_remove(key, member))
    }

    async fn sorted_set_len(&self, key: &str) -> Result<usize, StoreError> {
        self.read(|data| data.sorted_sets.get(key).map_or(0, |set| set.len()))
    }

    async fn hash_increment(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError> {
        Ok(self.write()?.increment(key, field, delta))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, i64>, StoreError> {
        self.read(|data| data.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn apply_batch(&self, ops: &[StoreOp]) -> Result<(), StoreError> {
        let mut data = self.write()?;
        for op in ops {
            data.apply(op);
        }
        Ok(())
    }

    async fn apply_guarded(&self, guard: &StoreOp, ops: &[StoreOp]) -> Result<bool, StoreError> {
        let mut data = self.write()?;
        if !data.apply(guard) {
            return Ok(false);
        }
        for op in ops {
            data.apply(op);
        }
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut data = self.write()?;
        for key in keys {
            data.lists.remove(key);
            data.sorted_sets.remove(key);
            data.hashes.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }
}
