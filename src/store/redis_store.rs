//! Redis raw store
//!
//! Entries live under `namespace:key` when a namespace is configured. Since
//! `:` can never appear in a valid key, namespaced keys cannot collide.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::RawStore;
use crate::{CacheConfig, CacheError, Result};

/// Keys deleted per DEL while clearing a namespace
const CLEAR_BATCH: usize = 500;

/// Redis raw store
pub struct RedisStore {
    redis: redis::aio::ConnectionManager,
    namespace: Option<String>,
}

impl RedisStore {
    /// Connect using an existing client.
    pub async fn new(redis_client: redis::Client, namespace: Option<String>) -> Result<Self> {
        let redis = redis::aio::ConnectionManager::new(redis_client)
            .await
            .map_err(|e| CacheError::BackendUnavailable(format!("Redis: {}", e)))?;
        Ok(Self { redis, namespace })
    }

    pub async fn connect(url: &str, namespace: Option<String>) -> Result<Self> {
        let redis_client = redis::Client::open(url)
            .map_err(|e| CacheError::BackendUnavailable(format!("Redis URL {}: {}", url, e)))?;
        Self::new(redis_client, namespace).await
    }

    pub async fn from_config(config: &CacheConfig) -> Result<Self> {
        Self::connect(&config.redis_url, config.redis_namespace.clone()).await
    }

    /// Round-trip a PING to check the server answers.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| CacheError::BackendUnavailable(format!("Redis PING failed: {}", e)))?;
        Ok(())
    }

    fn redis_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}:{}", namespace, key),
            None => key.to_owned(),
        }
    }

    async fn clear_namespace(&self, namespace: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        let pattern = format!("{}:*", namespace);
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(CLEAR_BATCH)
                .query_async(&mut conn)
                .await?;
            for batch in keys.chunks(CLEAR_BATCH) {
                conn.del::<_, ()>(batch).await?;
                removed += batch.len();
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        debug!("Redis namespace {} cleared ({} keys)", namespace, removed);
        Ok(())
    }
}

#[async_trait]
impl RawStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn fetch(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.redis.clone();
        Ok(conn.get::<_, Option<Vec<u8>>>(self.redis_key(key)).await?)
    }

    async fn fetch_multi(&self, keys: &[&str]) -> Result<HashMap<String, Vec<u8>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let redis_keys: Vec<String> = keys.iter().map(|key| self.redis_key(key)).collect();
        let mut conn = self.redis.clone();
        let values: Vec<Option<Vec<u8>>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| ((*key).to_owned(), value)))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.redis.clone();
        Ok(conn.exists::<_, bool>(self.redis_key(key)).await?)
    }

    async fn store(&self, key: &str, entry: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut conn = self.redis.clone();
        let redis_key = self.redis_key(key);
        match ttl {
            Some(ttl) => {
                let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
                conn.pset_ex::<_, _, ()>(redis_key, entry, millis).await?
            }
            None => conn.set::<_, _, ()>(redis_key, entry).await?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(self.redis_key(key)).await?;
        Ok(())
    }

    async fn delete_multi(&self, keys: &[&str]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let redis_keys: Vec<String> = keys.iter().map(|key| self.redis_key(key)).collect();
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(redis_keys).await?;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match &self.namespace {
            Some(namespace) => self.clear_namespace(namespace).await,
            None => {
                let mut conn = self.redis.clone();
                redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
                Ok(())
            }
        }
    }
}
