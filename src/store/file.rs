//! Filesystem raw store: one file per key
//!
//! File names are the configured prefix followed by the hex-encoded key, or
//! its SHA-256 digest for long keys, so any valid key maps to a safe, unique
//! name. Writes go to a temporary file first and are renamed into place.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::RawStore;
use crate::{CacheConfig, CacheError, Result};

/// Longest hex stem kept verbatim; longer keys are hashed so file names
/// stay well under the usual 255-byte limit.
const MAX_HEX_STEM: usize = 128;

/// Filesystem raw store
pub struct FileStore {
    directory: PathBuf,
    prefix: String,
    tmp_counter: AtomicU64,
}

impl FileStore {
    /// Create a store in `directory`; the directory is created if missing.
    pub async fn new(directory: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory).await.map_err(|e| {
            CacheError::BackendUnavailable(format!(
                "cannot create cache directory {}: {}",
                directory.display(),
                e
            ))
        })?;
        Ok(Self {
            directory,
            prefix: prefix.into(),
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::new(&config.file_directory, config.file_prefix.clone()).await
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Check that the directory accepts writes.
    pub async fn probe(&self) -> Result<()> {
        let path = self.tmp_path_for("probe");
        tokio::fs::write(&path, b"").await.map_err(|e| {
            CacheError::BackendUnavailable(format!(
                "cache directory {} is not writable: {}",
                self.directory.display(),
                e
            ))
        })?;
        remove_if_present(&path).await?;
        Ok(())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.directory
            .join(format!("{}{}", self.prefix, file_stem(key)))
    }

    fn tmp_path_for(&self, key: &str) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        self.directory.join(format!(
            ".{}{}.{}.{}.tmp",
            self.prefix,
            file_stem(key),
            std::process::id(),
            n
        ))
    }
}

/// Hex of the key, or `~` and the hex SHA-256 of the key once the hex form
/// would exceed [`MAX_HEX_STEM`]. `~` is not a hex digit, so the two forms
/// never collide.
fn file_stem(key: &str) -> String {
    let stem = hex::encode(key);
    if stem.len() <= MAX_HEX_STEM {
        stem
    } else {
        format!("~{}", hex::encode(Sha256::digest(key.as_bytes())))
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RawStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.path_for(key)).await?)
    }

    async fn store(&self, key: &str, entry: Vec<u8>, _ttl: Option<Duration>) -> Result<()> {
        let tmp = self.tmp_path_for(key);
        if let Err(e) = tokio::fs::write(&tmp, &entry).await {
            let _ = remove_if_present(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = tokio::fs::rename(&tmp, self.path_for(key)).await {
            let _ = remove_if_present(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        remove_if_present(&self.path_for(key)).await
    }

    async fn clear(&self) -> Result<()> {
        let mut dir = tokio::fs::read_dir(&self.directory).await?;
        let mut removed = 0usize;
        let mut failed = None;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&self.prefix) {
                continue;
            }
            match remove_if_present(&entry.path()).await {
                Ok(()) => removed += 1,
                Err(e) => {
                    warn!("Failed to remove cache file {}: {}", entry.path().display(), e);
                    failed = Some(e);
                }
            }
        }
        debug!(
            "File store cleared {} entries from {}",
            removed,
            self.directory.display()
        );
        match failed {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
