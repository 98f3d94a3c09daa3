//! Memcached raw store over the ASCII protocol
//!
//! Memcached keys cannot carry whitespace or control characters and are
//! limited to 250 bytes; such keys are replaced by a SHA-256 digest on the
//! wire. Deletion writes a one-second empty tombstone, which reads treat as
//! absent. `clear` flushes the whole server, namespace or not.

use async_trait::async_trait;
use memcache_async::ascii::Protocol;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::debug;

use super::RawStore;
use crate::{CacheConfig, CacheError, Result};

const MAX_KEY_LEN: usize = 250;
/// Memcached reads larger exptimes as absolute unix timestamps.
const MAX_RELATIVE_EXPTIME: u64 = 30 * 24 * 60 * 60;
const TOMBSTONE_EXPTIME: u32 = 1;

/// Remaining lifetime rounded up to whole seconds, at least one.
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 || secs == 0 {
        secs + 1
    } else {
        secs
    }
}

/// Memcached exptime for a TTL hint; 0 means no expiry.
fn exptime(ttl: Option<Duration>) -> u32 {
    let Some(ttl) = ttl else {
        return 0;
    };
    let secs = ttl_secs(ttl);
    if secs <= MAX_RELATIVE_EXPTIME {
        return secs as u32;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    u32::try_from(now.saturating_add(secs)).unwrap_or(u32::MAX)
}

/// Memcached raw store
pub struct MemcachedStore {
    protocol: Mutex<Protocol<Compat<TcpStream>>>,
    namespace: Option<String>,
}

impl MemcachedStore {
    pub async fn connect(server: &str, namespace: Option<String>) -> Result<Self> {
        let stream = TcpStream::connect(server).await.map_err(|e| {
            CacheError::BackendUnavailable(format!("Memcached {}: {}", server, e))
        })?;
        Ok(Self {
            protocol: Mutex::new(Protocol::new(stream.compat())),
            namespace,
        })
    }

    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::connect(&config.memcached_server, config.memcached_namespace.clone()).await
    }

    fn wire_key(&self, key: &str) -> String {
        let full = match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, key),
            None => key.to_owned(),
        };
        let plain = full.len() <= MAX_KEY_LEN
            && !full.chars().any(|c| c.is_whitespace() || c.is_control());
        if plain {
            full
        } else {
            // ':' cannot start a valid key, so digests never collide with one
            format!(":{}", hex::encode(Sha256::digest(full.as_bytes())))
        }
    }
}

#[async_trait]
impl RawStore for MemcachedStore {
    fn name(&self) -> &'static str {
        "memcached"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let wire_key = self.wire_key(key);
        let mut protocol = self.protocol.lock().await;
        match protocol.get(&wire_key).await {
            Ok(entry) if entry.is_empty() => Ok(None),
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.fetch(key).await?.is_some())
    }

    async fn store(&self, key: &str, entry: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let wire_key = self.wire_key(key);
        let mut protocol = self.protocol.lock().await;
        protocol.set(&wire_key, &entry, exptime(ttl)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let wire_key = self.wire_key(key);
        let mut protocol = self.protocol.lock().await;
        protocol.set(&wire_key, &[], TOMBSTONE_EXPTIME).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut protocol = self.protocol.lock().await;
        protocol.flush().await?;
        debug!("Memcached server flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exptime() {
        assert_eq!(exptime(None), 0);
        assert_eq!(exptime(Some(Duration::ZERO)), 1);
        assert_eq!(exptime(Some(Duration::from_millis(1_500))), 2);
        assert_eq!(exptime(Some(Duration::from_secs(60))), 60);

        let far = exptime(Some(Duration::from_secs(MAX_RELATIVE_EXPTIME + 10)));
        assert!(u64::from(far) > MAX_RELATIVE_EXPTIME);
    }

    #[tokio::test]
    #[ignore] // Requires running Memcached server
    async fn test_memcached_basic_operations() {
        let store = MemcachedStore::connect("127.0.0.1:11211", Some("itemcache".to_owned()))
            .await
            .expect("Failed to connect to Memcached");

        store.store("hello", b"world".to_vec(), None).await.unwrap();
        assert_eq!(store.fetch("hello").await.unwrap(), Some(b"world".to_vec()));

        store.store("with space", b"x".to_vec(), None).await.unwrap();
        assert_eq!(store.fetch("with space").await.unwrap(), Some(b"x".to_vec()));

        store.delete("hello").await.unwrap();
        assert_eq!(store.fetch("hello").await.unwrap(), None);
        assert!(!store.exists("hello").await.unwrap());
    }
}
