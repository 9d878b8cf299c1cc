//! Run lock
//!
//! Keeps a scheduled batch run single-flight across replicas. The lock is an
//! optimization: a second runner that slips through still cannot create a
//! duplicate record, since the record store rejects it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_common::Result;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::redis_client::{redis_unavailable, RedisClient};

/// Proof of lock ownership, required to release
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
}

/// Expiring mutual-exclusion lock
#[async_trait]
pub trait RunLock: Send + Sync {
    /// Take the lock for `ttl`; `None` when someone else holds it
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>>;

    /// Release the lock if still held by `token`
    async fn release(&self, token: &LockToken) -> Result<()>;
}

/// Redis lock: `SET key token NX PX ttl`, released by compare-and-delete
pub struct RedisRunLock {
    client: RedisClient,
    prefix: String,
}

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

impl RedisRunLock {
    pub fn new(client: RedisClient) -> Self {
        Self {
            client,
            prefix: "meterflow:lock".to_string(),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl RunLock for RedisRunLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let redis_key = self.redis_key(key);
        let token = Uuid::new_v4().to_string();
        let mut conn = self.client.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(&redis_key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(redis_unavailable)?;

        match reply {
            Some(_) => {
                debug!(key = %redis_key, "Acquired run lock");
                Ok(Some(LockToken {
                    key: key.to_string(),
                    token,
                }))
            }
            None => Ok(None),
        }
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let redis_key = self.redis_key(&token.key);
        let mut conn = self.client.connection().await?;

        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(&redis_key)
            .arg(&token.token)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_unavailable)?;

        debug!(key = %redis_key, released, "Released run lock");
        Ok(())
    }
}

/// In-process lock for single-replica deployments and tests
#[derive(Default)]
pub struct LocalRunLock {
    held: Mutex<HashMap<String, (String, Instant)>>,
}

impl LocalRunLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunLock for LocalRunLock {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let now = Instant::now();
        let mut held = self.held.lock();

        if let Some((_, expires_at)) = held.get(key) {
            if *expires_at > now {
                return Ok(None);
            }
        }

        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), (token.clone(), now + ttl));
        Ok(Some(LockToken {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, token: &LockToken) -> Result<()> {
        let mut held = self.held.lock();
        if held.get(&token.key).map(|(t, _)| t == &token.token).unwrap_or(false) {
            held.remove(&token.key);
        }
        Ok(())
    }
}
