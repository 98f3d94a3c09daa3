//! In-process raw store backed by a Moka cache
//!
//! Capacity-based eviction is left to Moka. Expired entries are pruned from
//! deadlines the store learns about, either from the TTL hint on `store` or
//! from [`DeadlineEvent`]s sent by values carrying this store's listener.
//! The deadline index holds one deadline per key, forgets deleted keys and is
//! capped relative to the store's capacity.

use async_trait::async_trait;
use moka::future::Cache;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{Mutex, mpsc};
use tracing::debug;

use super::RawStore;
use crate::item::{DeadlineEvent, DeadlineSender};
use crate::{CacheConfig, Result};

/// Only the expiration of a serialized entry; the rest is ignored.
#[derive(Deserialize)]
struct EntryHeader {
    expires_at: Option<SystemTime>,
}

fn entry_deadline(entry: &[u8]) -> Option<SystemTime> {
    serde_json::from_slice::<EntryHeader>(entry)
        .ok()
        .and_then(|header| header.expires_at)
}

/// Deadlines of stored keys, at most one per key.
struct DeadlineIndex {
    events: mpsc::UnboundedReceiver<DeadlineEvent>,
    by_deadline: BTreeMap<SystemTime, HashSet<String>>,
    by_key: HashMap<String, SystemTime>,
    limit: usize,
}

impl DeadlineIndex {
    /// Record `deadline` for `key`, replacing the key's previous deadline.
    fn track(&mut self, key: String, deadline: SystemTime) {
        if let Some(previous) = self.by_key.insert(key.clone(), deadline) {
            self.unlink(previous, &key);
        }
        self.by_deadline.entry(deadline).or_default().insert(key);
    }

    fn untrack(&mut self, key: &str) {
        if let Some(deadline) = self.by_key.remove(key) {
            self.unlink(deadline, key);
        }
    }

    fn unlink(&mut self, deadline: SystemTime, key: &str) {
        if let Some(keys) = self.by_deadline.get_mut(&deadline) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_deadline.remove(&deadline);
            }
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.track(event.key, event.deadline);
        }
    }

    /// Remove and return every key whose deadline is before `now`.
    fn take_due(&mut self, now: SystemTime) -> Vec<String> {
        let later = self.by_deadline.split_off(&now);
        let due = std::mem::replace(&mut self.by_deadline, later);
        let keys: Vec<String> = due.into_values().flatten().collect();
        for key in &keys {
            self.by_key.remove(key);
        }
        keys
    }

    fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Keep the index within its limit: first drop keys that are no longer
    /// stored, then the furthest deadlines.
    fn shrink(&mut self, resident: impl Fn(&str) -> bool) {
        if self.len() <= self.limit {
            return;
        }
        let gone: Vec<String> = self
            .by_key
            .keys()
            .filter(|key| !resident(key))
            .cloned()
            .collect();
        for key in &gone {
            self.untrack(key);
        }
        while self.len() > self.limit {
            let Some(mut entry) = self.by_deadline.last_entry() else {
                break;
            };
            let keys = entry.get_mut();
            let Some(key) = keys.iter().next().cloned() else {
                entry.remove();
                continue;
            };
            keys.remove(&key);
            if keys.is_empty() {
                entry.remove();
            }
            self.by_key.remove(&key);
        }
    }

    fn clear(&mut self) {
        self.by_deadline.clear();
        self.by_key.clear();
    }
}

/// Smallest deadline index kept regardless of capacity
const MIN_INDEX_LIMIT: usize = 64;

fn index_limit(max_capacity: u64) -> usize {
    usize::try_from(max_capacity.saturating_mul(2))
        .unwrap_or(usize::MAX)
        .max(MIN_INDEX_LIMIT)
}

/// In-memory raw store
pub struct MemoryStore {
    entries: Cache<String, Arc<Vec<u8>>>,
    deadlines: Mutex<DeadlineIndex>,
    events_tx: DeadlineSender,
}

impl MemoryStore {
    /// Create a store holding at most `max_capacity` entries.
    pub fn new(max_capacity: u64) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            entries: Cache::builder().max_capacity(max_capacity).build(),
            deadlines: Mutex::new(DeadlineIndex {
                events,
                by_deadline: BTreeMap::new(),
                by_key: HashMap::new(),
                limit: index_limit(max_capacity),
            }),
            events_tx,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.memory_max_capacity)
    }

    /// Approximate number of stored entries
    pub fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Remove stored entries whose known deadline has passed.
    ///
    /// An entry is only removed if its stored payload is itself expired; a key
    /// re-saved with a later deadline survives and is tracked again under
    /// that deadline. Returns the number of entries removed.
    pub async fn prune_expired(&self) -> usize {
        let now = SystemTime::now();
        let due = {
            let mut index = self.deadlines.lock().await;
            index.drain_events();
            index.take_due(now)
        };

        let mut removed = 0;
        let mut pending = Vec::new();
        for key in due {
            let Some(entry) = self.entries.get(&key).await else {
                continue;
            };
            match entry_deadline(&entry) {
                Some(deadline) if deadline <= now => {
                    self.entries.invalidate(&key).await;
                    removed += 1;
                }
                // re-saved with a later deadline
                Some(deadline) => pending.push((key, deadline)),
                None => {}
            }
        }
        if !pending.is_empty() {
            let mut index = self.deadlines.lock().await;
            for (key, deadline) in pending {
                index.track(key, deadline);
            }
        }
        if removed > 0 {
            debug!("Memory store pruned {} expired entries", removed);
        }
        removed
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).await.map(|entry| entry.as_ref().clone()))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.contains_key(key))
    }

    async fn store(&self, key: &str, entry: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.prune_expired().await;
        self.entries.insert(key.to_owned(), Arc::new(entry)).await;

        let mut index = self.deadlines.lock().await;
        index.drain_events();
        match ttl.and_then(|ttl| SystemTime::now().checked_add(ttl)) {
            Some(deadline) => index.track(key.to_owned(), deadline),
            None => index.untrack(key),
        }
        index.shrink(|k| self.entries.contains_key(k));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.invalidate(key).await;
        let mut index = self.deadlines.lock().await;
        index.drain_events();
        index.untrack(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks().await;
        let mut index = self.deadlines.lock().await;
        index.drain_events();
        index.clear();
        Ok(())
    }

    fn deadline_listener(&self) -> Option<DeadlineSender> {
        Some(self.events_tx.clone())
    }
}
