//! itemcache - Cache item pools over interchangeable backends
//!
//! This library provides a uniform item-based cache API:
//! - [`CachedValue`]: a keyed value with hit/miss state and an optional deadline
//! - [`CachePool`]: lookup, batch lookup, save, deferred save and commit
//! - [`StorePool`]: the pool implementation over any [`RawStore`]
//! - [`TieredPool`]: a fast pool in front of a slow one, with promotion
//! - [`PoolSelector`]: builds pools from a [`PoolSpec`] such as `tiered:memory+redis`
//!
//! Backends: in-process memory (Moka), Redis, the filesystem, and Memcached
//! behind the `memcached` feature.
//!
//! ```no_run
//! use itemcache::{CachePool, MemoryStore, StorePool};
//!
//! # async fn demo() -> itemcache::Result<()> {
//! let pool = StorePool::<_, String>::new(MemoryStore::default());
//! let mut item = pool.get("hello").await?;
//! if !item.is_hit() {
//!     item.set("world".to_owned()).expires_after_secs(60);
//!     pool.save(&item).await?;
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod item;
mod pool;
mod selector;
pub mod store;
mod tiered;

pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use item::{
    CachedValue, Cacheable, DeadlineEvent, DeadlineSender, RESERVED_KEY_CHARS, is_valid_key,
    validate_key,
};
pub use pool::{CachePool, DynPool, StorePool, scoped};
pub use selector::{BackendKind, PoolSelector, PoolSpec};
#[cfg(feature = "memcached")]
pub use store::MemcachedStore;
pub use store::{FileStore, MemoryStore, RawStore, RedisStore};
pub use tiered::TieredPool;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
