//! Raw stores: the minimal key-value capability a backend exposes to a pool
//!
//! A raw store only moves serialized entries around. Hit/miss/expiration
//! policy lives in the pool; the TTL passed to [`RawStore::store`] is a hint
//! for backends with native expiry.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::Result;
use crate::item::DeadlineSender;

mod file;
#[cfg(test)]
pub(crate) mod flaky;
#[cfg(feature = "memcached")]
mod memcached;
mod memory;
mod redis_store;

pub use file::FileStore;
#[cfg(feature = "memcached")]
pub use memcached::MemcachedStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Backend driver capability wrapped by a [`StorePool`](crate::StorePool).
#[async_trait]
pub trait RawStore: Send + Sync + 'static {
    /// Short backend label used in logs
    fn name(&self) -> &'static str;

    /// Fetch the serialized entry for `key`, `None` if absent.
    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch several entries; missing keys are simply absent from the result.
    async fn fetch_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.fetch(key).await? {
                found.insert((*key).to_owned(), entry);
            }
        }
        Ok(found)
    }

    /// Existence check; may be approximate.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Store `entry` under `key`, overwriting any existing entry.
    async fn store(&self, key: &str, entry: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Remove `key`; removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn delete_multi(&self, keys: &[&str]) -> Result<()> {
        for key in keys {
            self.delete(key).await?;
        }
        Ok(())
    }

    /// Drop every entry in this store's namespace.
    async fn clear(&self) -> Result<()>;

    /// Channel for deadline events, for stores that prune expired entries
    /// themselves.
    fn deadline_listener(&self) -> Option<DeadlineSender> {
        None
    }
}
