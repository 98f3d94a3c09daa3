//! Two-tier pool: a fast pool in front of a slow one
//!
//! Reads try the fast tier first and fall through to the slow tier, promoting
//! slow hits into the fast tier. Writes go to both tiers.

use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::item::{CachedValue, Cacheable};
use crate::pool::CachePool;
use crate::{CacheError, Result};

/// Fast/slow composition of two pools.
///
/// Writes succeed only if both tiers accept them. A tier that fails is not
/// rolled back in the other one.
pub struct TieredPool<F, S> {
    fast: F,
    slow: S,
}

impl<F, S> TieredPool<F, S> {
    pub fn new(fast: F, slow: S) -> Self {
        Self { fast, slow }
    }

    pub fn fast(&self) -> &F {
        &self.fast
    }

    pub fn slow(&self) -> &S {
        &self.slow
    }

    pub fn into_tiers(self) -> (F, S) {
        (self.fast, self.slow)
    }
}

impl<P> TieredPool<P, P> {
    /// Build from an ordered list of tiers, fastest first.
    ///
    /// Exactly two tiers are supported.
    pub fn from_tiers(tiers: Vec<P>) -> Result<Self> {
        let count = tiers.len();
        let mut tiers = tiers.into_iter();
        match (tiers.next(), tiers.next(), tiers.next()) {
            (Some(fast), Some(slow), None) => Ok(Self::new(fast, slow)),
            _ => Err(CacheError::Configuration(format!(
                "a tiered pool needs exactly two tiers, got {}",
                count
            ))),
        }
    }
}

impl<F, S> TieredPool<F, S> {
    async fn promote<V>(&self, item: &CachedValue<V>)
    where
        V: Cacheable,
        F: CachePool<V>,
    {
        match self.fast.save(item).await {
            Ok(true) => debug!("Promoted to fast tier for key: {}", item.key()),
            Ok(false) => warn!("Failed to promote key {} to fast tier", item.key()),
            Err(e) => warn!("Failed to promote key {} to fast tier: {}", item.key(), e),
        }
    }
}

#[async_trait]
impl<V, F, S> CachePool<V> for TieredPool<F, S>
where
    V: Cacheable,
    F: CachePool<V>,
    S: CachePool<V>,
{
    async fn get(&self, key: &str) -> Result<CachedValue<V>> {
        let fast = self.fast.get(key).await?;
        if fast.is_hit() {
            debug!("Cache hit fast tier for key: {}", key);
            return Ok(fast);
        }

        let slow = self.slow.get(key).await?;
        if !slow.is_hit() {
            debug!("Cache miss both tiers for key: {}", key);
            return Ok(fast);
        }

        debug!("Cache hit slow tier for key: {}", key);
        self.promote(&slow).await;
        Ok(slow)
    }

    async fn get_multi(&self, keys: &[&str]) -> Result<HashMap<String, CachedValue<V>>> {
        let mut items = self.fast.get_multi(keys).await?;
        let missing: Vec<String> = items
            .iter()
            .filter(|(_, item)| !item.is_hit())
            .map(|(key, _)| key.clone())
            .collect();
        if missing.is_empty() {
            return Ok(items);
        }

        let missing: Vec<&str> = missing.iter().map(String::as_str).collect();
        let slow_items = self.slow.get_multi(&missing).await?;
        for (key, item) in slow_items {
            if item.is_hit() {
                self.promote(&item).await;
                items.insert(key, item);
            }
        }
        Ok(items)
    }

    async fn has(&self, key: &str) -> Result<bool> {
        if self.fast.has(key).await? {
            return Ok(true);
        }
        self.slow.has(key).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let fast = self.fast.delete(key).await?;
        let slow = self.slow.delete(key).await?;
        Ok(fast && slow)
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<bool> {
        let fast = self.fast.delete_multi(keys).await?;
        let slow = self.slow.delete_multi(keys).await?;
        Ok(fast && slow)
    }

    async fn clear(&self) -> bool {
        let fast = self.fast.clear().await;
        let slow = self.slow.clear().await;
        fast && slow
    }

    async fn save(&self, item: &CachedValue<V>) -> Result<bool> {
        let fast = self.fast.save(item).await?;
        let slow = self.slow.save(item).await?;
        if fast != slow {
            warn!(
                "Tiers disagree on save for key {} (fast: {}, slow: {})",
                item.key(),
                fast,
                slow
            );
        }
        Ok(fast && slow)
    }

    async fn save_deferred(&self, item: CachedValue<V>) -> Result<bool> {
        let fast = self.fast.save_deferred(item.clone()).await?;
        let slow = self.slow.save_deferred(item).await?;
        Ok(fast && slow)
    }

    async fn commit(&self) -> bool {
        let fast = self.fast.commit().await;
        let slow = self.slow.commit().await;
        fast && slow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{DynPool, StorePool};
    use crate::store::flaky::FlakyStore;
    use crate::store::{MemoryStore, RawStore};

    type MemoryPool = StorePool<MemoryStore, String>;

    fn memory_pool() -> MemoryPool {
        StorePool::new(MemoryStore::new(1_000))
    }

    fn tiered() -> TieredPool<MemoryPool, MemoryPool> {
        TieredPool::new(memory_pool(), memory_pool())
    }

    fn hit(key: &str, value: &str) -> CachedValue<String> {
        let mut item = CachedValue::new(key);
        item.set(value.to_owned());
        item
    }

    fn value_of(item: &CachedValue<String>) -> Option<&str> {
        item.get().map(String::as_str)
    }

    #[tokio::test]
    async fn test_promotes_slow_hit() {
        let pool = tiered();
        pool.slow().save(&hit("hello", "world")).await.unwrap();
        assert!(!pool.fast().get("hello").await.unwrap().is_hit());

        let item = pool.get("hello").await.unwrap();
        assert!(item.is_hit());
        assert_eq!(value_of(&item), Some("world"));

        let fast = pool.fast().get("hello").await.unwrap();
        assert_eq!(value_of(&fast), Some("world"));
    }

    #[tokio::test]
    async fn test_save_writes_both_tiers() {
        let pool = tiered();
        assert!(pool.save(&hit("hello", "world")).await.unwrap());

        let fast = pool.fast().get("hello").await.unwrap();
        let slow = pool.slow().get("hello").await.unwrap();
        assert_eq!(value_of(&fast), Some("world"));
        assert_eq!(fast.get(), slow.get());
    }

    #[tokio::test]
    async fn test_clearing_fast_tier_falls_back_to_slow() {
        let pool = tiered();
        pool.save(&hit("hello", "world")).await.unwrap();

        assert!(pool.fast().clear().await);
        assert!(!pool.fast().has("hello").await.unwrap());

        let item = pool.get("hello").await.unwrap();
        assert_eq!(value_of(&item), Some("world"));
        assert!(pool.fast().get("hello").await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_miss_on_both_tiers() {
        let pool = tiered();
        let item = pool.get("absent").await.unwrap();
        assert!(!item.is_hit());
        assert_eq!(item.key(), "absent");
        assert!(!pool.has("absent").await.unwrap());
    }

    #[tokio::test]
    async fn test_get_multi_merges_tiers() {
        let pool = tiered();
        pool.fast().save(&hit("a", "fast")).await.unwrap();
        pool.slow().save(&hit("a", "slow")).await.unwrap();
        pool.slow().save(&hit("b", "slow")).await.unwrap();

        let items = pool.get_multi(&["a", "b", "c"]).await.unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(value_of(&items["a"]), Some("fast"));
        assert_eq!(value_of(&items["b"]), Some("slow"));
        assert!(!items["c"].is_hit());

        assert!(pool.fast().has("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_has_checks_either_tier() {
        let pool = tiered();
        pool.slow().save(&hit("k", "v")).await.unwrap();
        assert!(pool.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_and_clear_hit_both_tiers() {
        let pool = tiered();
        pool.save(&hit("a", "1")).await.unwrap();
        pool.save(&hit("b", "2")).await.unwrap();
        pool.save(&hit("c", "3")).await.unwrap();

        assert!(pool.delete("a").await.unwrap());
        assert!(!pool.fast().has("a").await.unwrap());
        assert!(!pool.slow().has("a").await.unwrap());

        assert!(pool.delete_multi(&["b"]).await.unwrap());
        assert!(!pool.has("b").await.unwrap());

        assert!(pool.clear().await);
        assert!(!pool.fast().has("c").await.unwrap());
        assert!(!pool.slow().has("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_deferred_writes_reach_both_tiers() {
        let pool = tiered();
        assert!(pool.save_deferred(hit("k", "v")).await.unwrap());
        assert_eq!(pool.fast().deferred_len().await, 1);
        assert_eq!(pool.slow().deferred_len().await, 1);
        assert_eq!(value_of(&pool.get("k").await.unwrap()), Some("v"));

        assert!(pool.commit().await);
        assert!(pool.fast().store().fetch("k").await.unwrap().is_some());
        assert!(pool.slow().store().fetch("k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_partial_save_failure_is_false_without_rollback() {
        let fast = StorePool::<_, String>::new(FlakyStore::default());
        let pool = TieredPool::new(fast, memory_pool());
        pool.fast().store().set_fail_writes(true);

        assert!(!pool.save(&hit("k", "v")).await.unwrap());
        assert!(pool.slow().has("k").await.unwrap());
        assert!(!pool.fast().has("k").await.unwrap());

        // the read still succeeds when promotion fails
        let item = pool.get("k").await.unwrap();
        assert_eq!(value_of(&item), Some("v"));
    }

    #[tokio::test]
    async fn test_invalid_key_propagates() {
        let pool = tiered();
        assert!(matches!(
            pool.get("bad:key").await,
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            pool.save(&hit("bad@key", "v")).await,
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_from_tiers() {
        let pool = TieredPool::from_tiers(vec![memory_pool(), memory_pool()]).unwrap();
        assert!(pool.save(&hit("k", "v")).await.unwrap());

        for count in [0, 1, 3] {
            let tiers: Vec<MemoryPool> = (0..count).map(|_| memory_pool()).collect();
            assert!(matches!(
                TieredPool::from_tiers(tiers),
                Err(CacheError::Configuration(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_boxed_tiers() {
        let fast: DynPool<String> = Box::new(memory_pool());
        let slow: DynPool<String> = Box::new(memory_pool());
        let pool = TieredPool::new(fast, slow);
        pool.slow().save(&hit("k", "v")).await.unwrap();
        assert_eq!(value_of(&pool.get("k").await.unwrap()), Some("v"));
    }
}
