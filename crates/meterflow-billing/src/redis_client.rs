//! Shared Redis connection handling for the cache and the run lock

use std::sync::Arc;

use meterflow_common::{MeterflowError, Result, StoreError};
use redis::{aio::MultiplexedConnection, Client};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Redis client holding one multiplexed connection, reconnecting on demand
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    connection: Arc<RwLock<Option<MultiplexedConnection>>>,
}

impl RedisClient {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| MeterflowError::Config(format!("Failed to create Redis client: {}", e)))?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_unavailable)?;

        info!("Connected to Redis");
        Ok(Self {
            client,
            connection: Arc::new(RwLock::new(Some(connection))),
        })
    }

    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        let guard = self.connection.read().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        drop(guard);

        let mut guard = self.connection.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }

        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_unavailable)?;

        *guard = Some(connection.clone());
        Ok(connection)
    }

    /// Drop the cached connection after an I/O failure so the next call reconnects
    pub async fn reset(&self) {
        warn!("Resetting Redis connection");
        *self.connection.write().await = None;
    }
}

pub(crate) fn redis_unavailable(err: redis::RedisError) -> MeterflowError {
    MeterflowError::Store(StoreError::Unavailable(format!("redis: {}", err)))
}
