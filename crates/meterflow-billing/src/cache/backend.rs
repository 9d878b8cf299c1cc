//! Cache backends: Redis and an in-memory fallback

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use meterflow_common::Result;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::redis_client::{redis_unavailable, RedisClient};

/// String key/value store with per-entry expiry
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

/// Redis-backed cache
pub struct RedisCache {
    client: RedisClient,
}

impl RedisCache {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.client.connection().await?;
        let cached: redis::RedisResult<Option<String>> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;

        match cached {
            Ok(value) => Ok(value),
            Err(e) => {
                warn!(key, error = %e, "Cache get error");
                if e.is_io_error() {
                    self.client.reset().await;
                }
                Err(redis_unavailable(e))
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.client.connection().await?;
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let stored: redis::RedisResult<()> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;

        if let Err(e) = stored {
            warn!(key, error = %e, "Cache set error");
            if e.is_io_error() {
                self.client.reset().await;
            }
            return Err(redis_unavailable(e));
        }

        debug!(key, ttl_ms, "Cached query result");
        Ok(())
    }
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-memory cache using DashMap
pub struct InMemoryCache {
    entries: DashMap<String, Entry>,
    max_entries: usize,
}

impl InMemoryCache {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let now = Instant::now();

        // Evict expired entries first, then an arbitrary one if still full
        if self.entries.len() >= self.max_entries {
            self.entries.retain(|_, entry| now < entry.expires_at);

            if self.entries.len() >= self.max_entries {
                // The shard guard must drop before remove
                let victim = self.entries.iter().next().map(|e| e.key().clone());
                if let Some(victim) = victim {
                    self.entries.remove(&victim);
                }
            }
        }

        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        Ok(())
    }
}
