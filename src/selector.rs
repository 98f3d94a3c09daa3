//! Building pools from a textual spec
//!
//! A [`PoolSpec`] names a backend (`memory`, `redis`, `memcached`, `file`),
//! asks for auto-discovery (`auto`), or composes two specs into a tiered pool
//! (`tiered:memory+redis`). [`PoolSelector`] turns a spec into a ready
//! [`DynPool`] using a [`CacheConfig`].

use futures::FutureExt;
use futures::future::BoxFuture;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::item::Cacheable;
use crate::pool::{DynPool, StorePool};
use crate::store::{FileStore, MemoryStore, RedisStore};
use crate::tiered::TieredPool;
use crate::{CacheConfig, CacheError, Result};

const TIERED_PREFIX: &str = "tiered:";

/// A concrete storage backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Memory,
    Redis,
    Memcached,
    File,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Memory => "memory",
            BackendKind::Redis => "redis",
            BackendKind::Memcached => "memcached",
            BackendKind::File => "file",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            "memcached" => Ok(BackendKind::Memcached),
            "file" => Ok(BackendKind::File),
            other => Err(CacheError::Configuration(format!(
                "unknown cache backend: {:?}",
                other
            ))),
        }
    }
}

/// What kind of pool to build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSpec {
    Backend(BackendKind),
    /// First backend of [`CacheConfig::discovery_order`] that answers
    Auto,
    /// Tiers, fastest first
    Tiered(Vec<PoolSpec>),
}

impl FromStr for PoolSpec {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(tiers) = s.strip_prefix(TIERED_PREFIX) {
            let tiers = tiers
                .split('+')
                .map(|tier| {
                    if tier.trim().starts_with(TIERED_PREFIX) {
                        return Err(CacheError::Configuration(format!(
                            "nested tiered pool in {:?}",
                            s
                        )));
                    }
                    tier.parse()
                })
                .collect::<Result<Vec<PoolSpec>>>()?;
            if tiers.len() != 2 {
                return Err(CacheError::Configuration(format!(
                    "a tiered pool needs exactly two tiers, got {} in {:?}",
                    tiers.len(),
                    s
                )));
            }
            return Ok(PoolSpec::Tiered(tiers));
        }
        if s.eq_ignore_ascii_case("auto") {
            return Ok(PoolSpec::Auto);
        }
        s.parse().map(PoolSpec::Backend)
    }
}

/// Builds pools from [`PoolSpec`]s
#[derive(Debug, Clone, Default)]
pub struct PoolSelector {
    config: CacheConfig,
}

impl PoolSelector {
    pub fn new(config: CacheConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Build the pool described by `spec`.
    pub fn build<'a, V: Cacheable>(
        &'a self,
        spec: &'a PoolSpec,
    ) -> BoxFuture<'a, Result<DynPool<V>>> {
        async move {
            match spec {
                PoolSpec::Backend(kind) => self.backend(*kind).await,
                PoolSpec::Auto => self.auto_discover().await,
                PoolSpec::Tiered(specs) => {
                    let mut tiers = Vec::with_capacity(specs.len());
                    for tier in specs {
                        tiers.push(self.build::<V>(tier).await?);
                    }
                    let pool = TieredPool::from_tiers(tiers)?;
                    Ok(Box::new(pool) as DynPool<V>)
                }
            }
        }
        .boxed()
    }

    /// Parse `spec` and build the pool it describes.
    pub async fn build_str<V: Cacheable>(&self, spec: &str) -> Result<DynPool<V>> {
        let spec: PoolSpec = spec.parse()?;
        self.build(&spec).await
    }

    /// Try each backend of the discovery order and use the first that answers.
    pub async fn auto_discover<V: Cacheable>(&self) -> Result<DynPool<V>> {
        let mut failures = Vec::new();
        for kind in &self.config.discovery_order {
            match self.backend(*kind).await {
                Ok(pool) => {
                    debug!("Auto-discovery selected {} backend", kind);
                    return Ok(pool);
                }
                Err(e) => {
                    debug!("Auto-discovery skipped {} backend: {}", kind, e);
                    failures.push(format!("{}: {}", kind, e));
                }
            }
        }
        warn!("No cache backend available");
        Err(CacheError::BackendUnavailable(if failures.is_empty() {
            "no backends to discover".to_owned()
        } else {
            failures.join("; ")
        }))
    }

    /// Connect to and probe a single backend.
    pub async fn backend<V: Cacheable>(&self, kind: BackendKind) -> Result<DynPool<V>> {
        match kind {
            BackendKind::Memory => {
                let store = MemoryStore::from_config(&self.config);
                Ok(Box::new(StorePool::<_, V>::new(store)))
            }
            BackendKind::Redis => {
                let store = RedisStore::from_config(&self.config).await?;
                store.ping().await?;
                Ok(Box::new(StorePool::<_, V>::new(store)))
            }
            BackendKind::File => {
                let store = FileStore::from_config(&self.config).await?;
                store.probe().await?;
                Ok(Box::new(StorePool::<_, V>::new(store)))
            }
            BackendKind::Memcached => self.memcached().await,
        }
    }

    #[cfg(feature = "memcached")]
    async fn memcached<V: Cacheable>(&self) -> Result<DynPool<V>> {
        let store = crate::store::MemcachedStore::from_config(&self.config).await?;
        Ok(Box::new(StorePool::<_, V>::new(store)))
    }

    #[cfg(not(feature = "memcached"))]
    async fn memcached<V: Cacheable>(&self) -> Result<DynPool<V>> {
        Err(CacheError::BackendUnavailable(
            "built without the memcached feature".to_owned(),
        ))
    }
}
