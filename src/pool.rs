//! The cache pool contract and its raw-store implementation
//!
//! [`CachePool`] is what callers program against. [`StorePool`] implements it
//! once over any [`RawStore`]: key validation, deferred writes, serialization,
//! and the translation of backend failures into `false`/miss results all live
//! here, so every backend behaves the same way.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::Result;
use crate::item::{CachedValue, Cacheable, validate_key};
use crate::store::RawStore;

/// Contract shared by every cache pool.
///
/// Key-taking operations fail with [`CacheError::InvalidKey`](crate::CacheError::InvalidKey)
/// before touching storage. Backend failures never surface as errors; they
/// show up as misses or `false` results.
#[async_trait]
pub trait CachePool<V: Cacheable>: Send + Sync {
    /// Look up `key`. A miss is a fresh, non-hit value, never an error.
    async fn get(&self, key: &str) -> Result<CachedValue<V>>;

    /// Look up several keys; every requested key is present in the result.
    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, CachedValue<V>>>;

    /// Existence check. May race with `get`; the hit flag of a fetched value
    /// is authoritative.
    async fn has(&self, key: &str) -> Result<bool>;

    /// Remove `key`; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn delete_multi(&self, keys: &[&str]) -> Result<bool>;

    /// Drop pending deferred writes and every stored entry.
    async fn clear(&self) -> bool;

    /// Persist `item` now. Values that are not a hit are not written.
    async fn save(&self, item: &CachedValue<V>) -> Result<bool>;

    /// Queue `item` for the next [`CachePool::commit`], replacing any queued
    /// value for the same key.
    async fn save_deferred(&self, item: CachedValue<V>) -> Result<bool>;

    /// Save every queued value; true only if all of them were saved.
    async fn commit(&self) -> bool;
}

/// Type-erased pool, as built by the [`PoolSelector`](crate::PoolSelector)
pub type DynPool<V> = Box<dyn CachePool<V>>;

#[async_trait]
impl<V, P> CachePool<V> for Box<P>
where
    V: Cacheable,
    P: CachePool<V> + ?Sized,
{
    async fn get(&self, key: &str) -> Result<CachedValue<V>> {
        (**self).get(key).await
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, CachedValue<V>>> {
        (**self).get_multi(keys).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        (**self).has(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key).await
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<bool> {
        (**self).delete_multi(keys).await
    }

    async fn clear(&self) -> bool {
        (**self).clear().await
    }

    async fn save(&self, item: &CachedValue<V>) -> Result<bool> {
        (**self).save(item).await
    }

    async fn save_deferred(&self, item: CachedValue<V>) -> Result<bool> {
        (**self).save_deferred(item).await
    }

    async fn commit(&self) -> bool {
        (**self).commit().await
    }
}

/// Run `body` against `pool`, then commit whatever it deferred.
///
/// The commit runs on every exit path of `body`, including when it returns an
/// error value. Returns the body's output and the commit result.
pub async fn scoped<V, P, T, F>(pool: &P, body: F) -> (T, bool)
where
    V: Cacheable,
    P: CachePool<V> + ?Sized,
    F: for<'p> FnOnce(&'p P) -> BoxFuture<'p, T>,
{
    let output = body(pool).await;
    let committed = pool.commit().await;
    (output, committed)
}

struct Deferred<V> {
    item: CachedValue<V>,
    seq: u64,
}

struct DeferredStack<V> {
    entries: HashMap<String, Deferred<V>>,
    next_seq: u64,
}

impl<V> DeferredStack<V> {
    fn live(&self, key: &str) -> Option<&CachedValue<V>> {
        self.entries
            .get(key)
            .map(|deferred| &deferred.item)
            .filter(|item| item.is_hit())
    }
}

/// A serialized entry ready for the raw store
struct Encoded {
    key: String,
    entry: Vec<u8>,
    ttl: Option<Duration>,
}

fn encode<V: Cacheable>(item: &CachedValue<V>) -> Option<Encoded> {
    match serde_json::to_vec(item) {
        Ok(entry) => Some(Encoded {
            key: item.key().to_owned(),
            entry,
            ttl: item.remaining_ttl(),
        }),
        Err(e) => {
            warn!("Failed to serialize value for key {}: {}", item.key(), e);
            None
        }
    }
}

/// [`CachePool`] over a [`RawStore`], with a private deferred-write stack.
///
/// Dropping a pool with pending deferred writes flushes them on the current
/// tokio runtime, best effort. Use [`StorePool::close`] or [`scoped`] to
/// flush deterministically.
pub struct StorePool<S: RawStore, V: Cacheable> {
    store: Arc<S>,
    deferred: Mutex<DeferredStack<V>>,
}

impl<S: RawStore, V: Cacheable> StorePool<S, V> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    /// Wrap a store that is shared with other owners.
    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            store,
            deferred: Mutex::new(DeferredStack {
                entries: HashMap::new(),
                next_seq: 0,
            }),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Number of queued deferred writes
    pub async fn deferred_len(&self) -> usize {
        self.deferred.lock().await.entries.len()
    }

    /// Commit pending deferred writes and release the pool.
    pub async fn close(self) -> bool {
        self.commit().await
    }

    /// Attach the store's deadline listener, if it has one.
    fn adopt(&self, mut item: CachedValue<V>) -> CachedValue<V> {
        if let Some(listener) = self.store.deadline_listener() {
            item.attach(listener);
        }
        item
    }

    /// Turn a raw entry into a live value. Expired entries become misses;
    /// undecodable entries are removed.
    async fn decode(&self, key: &str, entry: &[u8]) -> Option<CachedValue<V>> {
        match serde_json::from_slice::<CachedValue<V>>(entry) {
            Ok(item) if item.is_hit() => {
                debug!("Cache hit ({}) for key: {}", self.store.name(), key);
                Some(item)
            }
            Ok(_) => {
                debug!("Expired entry ({}) for key: {}", self.store.name(), key);
                None
            }
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {} ({}): {}. Deleting corrupt entry.",
                    key,
                    self.store.name(),
                    e
                );
                if let Err(del_err) = self.store.delete(key).await {
                    warn!("Failed to delete corrupt entry for key {}: {}", key, del_err);
                }
                None
            }
        }
    }

    async fn write(&self, item: &CachedValue<V>) -> bool {
        let Some(encoded) = encode(item) else {
            return false;
        };
        match self
            .store
            .store(&encoded.key, encoded.entry, encoded.ttl)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "{} store error for key {}: {}",
                    self.store.name(),
                    encoded.key,
                    e
                );
                false
            }
        }
    }
}

#[async_trait]
impl<S: RawStore, V: Cacheable> CachePool<V> for StorePool<S, V> {
    async fn get(&self, key: &str) -> Result<CachedValue<V>> {
        validate_key(key)?;

        if let Some(item) = self.deferred.lock().await.live(key).cloned() {
            debug!("Deferred hit for key: {}", key);
            return Ok(self.adopt(item));
        }

        let found = match self.store.fetch(key).await {
            Ok(Some(entry)) => self.decode(key, &entry).await,
            Ok(None) => None,
            Err(e) => {
                warn!("{} fetch error for key {}: {}", self.store.name(), key, e);
                None
            }
        };
        if found.is_none() {
            debug!("Cache miss ({}) for key: {}", self.store.name(), key);
        }

        Ok(self.adopt(found.unwrap_or_else(|| CachedValue::new(key))))
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, CachedValue<V>>> {
        for key in keys {
            validate_key(key)?;
        }
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut seen = HashSet::with_capacity(keys.len());
        let mut items = HashMap::with_capacity(keys.len());
        let mut pending = Vec::new();
        {
            let stack = self.deferred.lock().await;
            for key in keys.iter().copied().filter(|key| seen.insert(*key)) {
                match stack.live(key) {
                    Some(item) => {
                        items.insert(key.to_owned(), item.clone());
                    }
                    None => pending.push(key),
                }
            }
        }

        if !pending.is_empty() {
            let mut fetched = match self.store.fetch_multi(&pending).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(
                        "{} multi-fetch error for {} keys: {}",
                        self.store.name(),
                        pending.len(),
                        e
                    );
                    HashMap::new()
                }
            };
            for key in pending {
                let found = match fetched.remove(key) {
                    Some(entry) => self.decode(key, &entry).await,
                    None => None,
                };
                items.insert(
                    key.to_owned(),
                    found.unwrap_or_else(|| CachedValue::new(key)),
                );
            }
        }

        Ok(items
            .into_iter()
            .map(|(key, item)| (key, self.adopt(item)))
            .collect())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        if self.deferred.lock().await.live(key).is_some() {
            return Ok(true);
        }
        match self.store.exists(key).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                warn!("{} exists error for key {}: {}", self.store.name(), key, e);
                Ok(false)
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.deferred.lock().await.entries.remove(key);
        match self.store.delete(key).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("{} delete error for key {}: {}", self.store.name(), key, e);
                Ok(false)
            }
        }
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<bool> {
        for key in keys {
            validate_key(key)?;
        }
        if keys.is_empty() {
            return Ok(true);
        }
        {
            let mut stack = self.deferred.lock().await;
            for key in keys {
                stack.entries.remove(*key);
            }
        }
        match self.store.delete_multi(keys).await {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!(
                    "{} delete error for {} keys: {}",
                    self.store.name(),
                    keys.len(),
                    e
                );
                Ok(false)
            }
        }
    }

    async fn clear(&self) -> bool {
        self.deferred.lock().await.entries.clear();
        match self.store.clear().await {
            Ok(()) => true,
            Err(e) => {
                warn!("{} clear error: {}", self.store.name(), e);
                false
            }
        }
    }

    async fn save(&self, item: &CachedValue<V>) -> Result<bool> {
        validate_key(item.key())?;
        if !item.is_hit() {
            debug!("Not saving key {}: value is not a hit", item.key());
            return Ok(false);
        }
        Ok(self.write(item).await)
    }

    async fn save_deferred(&self, item: CachedValue<V>) -> Result<bool> {
        validate_key(item.key())?;
        let mut stack = self.deferred.lock().await;
        let seq = stack.next_seq;
        stack.next_seq += 1;
        stack
            .entries
            .insert(item.key().to_owned(), Deferred { item, seq });
        Ok(true)
    }

    async fn commit(&self) -> bool {
        let snapshot: Vec<(u64, CachedValue<V>)> = {
            let stack = self.deferred.lock().await;
            stack
                .entries
                .values()
                .map(|deferred| (deferred.seq, deferred.item.clone()))
                .collect()
        };
        if snapshot.is_empty() {
            return true;
        }

        let total = snapshot.len();
        let mut failed = 0usize;
        for (seq, item) in snapshot {
            let saved = item.is_hit() && self.write(&item).await;
            {
                // a newer deferred write for this key stays queued
                let mut stack = self.deferred.lock().await;
                if stack
                    .entries
                    .get(item.key())
                    .is_some_and(|deferred| deferred.seq == seq)
                {
                    stack.entries.remove(item.key());
                }
            }
            if !saved {
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(
                "Commit to {} saved {} of {} deferred values",
                self.store.name(),
                total - failed,
                total
            );
        } else {
            debug!("Committed {} deferred values to {}", total, self.store.name());
        }
        failed == 0
    }
}

impl<S: RawStore, V: Cacheable> Drop for StorePool<S, V> {
    fn drop(&mut self) {
        let stack = self.deferred.get_mut();
        if stack.entries.is_empty() {
            return;
        }
        let pending: Vec<Encoded> = stack
            .entries
            .drain()
            .map(|(_, deferred)| deferred.item)
            .filter(|item| item.is_hit())
            .filter_map(|item| encode(&item))
            .collect();
        if pending.is_empty() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(
                "{} deferred values lost: {} pool dropped outside a tokio runtime",
                pending.len(),
                self.store.name()
            );
            return;
        };

        let store = Arc::clone(&self.store);
        debug!(
            "Flushing {} deferred values to {} on drop",
            pending.len(),
            store.name()
        );
        runtime.spawn(async move {
            for encoded in pending {
                if let Err(e) = store.store(&encoded.key, encoded.entry, encoded.ttl).await {
                    warn!(
                        "{} store error for key {} during drop flush: {}",
                        store.name(),
                        encoded.key,
                        e
                    );
                }
            }
        });
    }
}
