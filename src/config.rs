//! Cache configuration

use std::path::PathBuf;

use crate::selector::BackendKind;

/// Configuration shared by every backend the selector can build
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum number of entries in the in-memory store
    pub memory_max_capacity: u64,
    /// Redis connection URL
    pub redis_url: String,
    /// Prefix for Redis keys; `clear` only drops this namespace when set
    pub redis_namespace: Option<String>,
    /// Memcached server address (`host:port`)
    pub memcached_server: String,
    /// Prefix for Memcached keys
    pub memcached_namespace: Option<String>,
    /// Directory holding the file store entries
    pub file_directory: PathBuf,
    /// File name prefix identifying this store's entries
    pub file_prefix: String,
    /// Backends tried, in order, by auto-discovery
    pub discovery_order: Vec<BackendKind>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_max_capacity: 10_000,
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            redis_namespace: None,
            memcached_server: "127.0.0.1:11211".to_owned(),
            memcached_namespace: None,
            file_directory: std::env::temp_dir(),
            file_prefix: "itemcache_".to_owned(),
            discovery_order: vec![BackendKind::Redis, BackendKind::File],
        }
    }
}
