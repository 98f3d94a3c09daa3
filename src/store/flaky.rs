//! Memory store with switchable failures, for exercising error paths

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use super::{MemoryStore, RawStore};
use crate::{CacheError, Result};

#[derive(Default)]
pub(crate) struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_reads: AtomicBool,
    pub fail_writes: AtomicBool,
    /// Writes to keys with this prefix always fail
    pub poisoned_prefix: Option<String>,
    pub fetches: AtomicUsize,
}

impl FlakyStore {
    pub fn poisoned(prefix: &str) -> Self {
        Self {
            poisoned_prefix: Some(prefix.to_owned()),
            ..Self::default()
        }
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn check_read(&self) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("read failure".into()));
        }
        Ok(())
    }

    fn check_write(&self, key: &str) -> Result<()> {
        let poisoned = self
            .poisoned_prefix
            .as_deref()
            .is_some_and(|prefix| key.starts_with(prefix));
        if poisoned || self.fail_writes.load(Ordering::SeqCst) {
            return Err(CacheError::Backend("write failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RawStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_read()?;
        self.inner.fetch(key).await
    }

    async fn fetch_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
        self.check_read()?;
        self.inner.fetch_multi(keys).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_read()?;
        self.inner.exists(key).await
    }

    async fn store(&self, key: &str, entry: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        self.check_write(key)?;
        self.inner.store(key, entry, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_write(key)?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> Result<()> {
        self.check_write("")?;
        self.inner.clear().await
    }
}
