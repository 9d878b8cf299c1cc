//! Read cache for query results
//!
//! Entries expire by TTL only. Writes never invalidate: a billing record or
//! usage written after a result was cached stays invisible to that key for up
//! to one TTL. Backend failures degrade to an uncached read.

pub mod backend;

pub use backend::{CacheBackend, InMemoryCache, RedisCache};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use meterflow_common::{
    BillingRecordView, CostTrend, DailyUsageSummary, MonthlyBillingSummary, Page, Result,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::service::BillingService;
use crate::store::{bounded, SummaryViews};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Upper bound on staleness
    pub ttl: Duration,
    pub prefix: String,
    pub store_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            prefix: "meterflow:query".to_string(),
            store_timeout: Duration::from_secs(5),
        }
    }
}

/// Hash a query name and its full parameter tuple into a cache key
fn cache_key(prefix: &str, query: &str, params: &[&dyn std::fmt::Display]) -> String {
    let joined = params
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(":");
    let hash = blake3::hash(format!("{}:{}", query, joined).as_bytes());
    format!("{}:{}:{}", prefix, query, hash.to_hex())
}

/// Cached query surface
pub struct CachedQueries {
    backend: Arc<dyn CacheBackend>,
    views: Arc<dyn SummaryViews>,
    billing: Arc<BillingService>,
    config: CacheConfig,
}

impl CachedQueries {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        views: Arc<dyn SummaryViews>,
        billing: Arc<BillingService>,
        config: CacheConfig,
    ) -> Self {
        Self {
            backend,
            views,
            billing,
            config,
        }
    }

    /// Daily usage rows for a customer in `[start, end]`, most recent first
    pub async fn usage_summary(
        &self,
        customer_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageSummary>> {
        let key = cache_key(&self.config.prefix, "usage_summary", &[&customer_id, &start, &end]);
        self.cached(&key, || {
            bounded(
                self.config.store_timeout,
                "daily usage view",
                self.views.daily_usage(customer_id, start, end),
            )
        })
        .await
    }

    /// Aggregate cost per day over the last `days` days
    pub async fn cost_trend(&self, days: u32) -> Result<CostTrend> {
        let since = Utc::now().date_naive() - ChronoDuration::days(i64::from(days));
        let key = cache_key(&self.config.prefix, "cost_trend", &[&days, &since]);
        self.cached(&key, || {
            bounded(
                self.config.store_timeout,
                "cost trend view",
                self.views.cost_trend(since),
            )
        })
        .await
    }

    /// Billed totals per month for a customer, most recent month first
    pub async fn monthly_billing(&self, customer_id: Uuid) -> Result<Vec<MonthlyBillingSummary>> {
        let key = cache_key(&self.config.prefix, "monthly_billing", &[&customer_id]);
        self.cached(&key, || {
            bounded(
                self.config.store_timeout,
                "monthly billing view",
                self.views.monthly_billing(customer_id),
            )
        })
        .await
    }

    /// A customer's billing records, most recent first
    pub async fn billing_records(
        &self,
        customer_id: Uuid,
        page: usize,
        size: usize,
    ) -> Result<Page<BillingRecordView>> {
        let key = cache_key(&self.config.prefix, "billing_records", &[&customer_id, &page, &size]);
        self.cached(&key, || self.billing.billing_records(customer_id, page, size))
            .await
    }

    async fn cached<T, F, Fut>(&self, key: &str, load: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match self.backend.get(key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(value) => {
                    debug!(key, "Cache hit");
                    return Ok(value);
                }
                Err(e) => warn!(key, error = %e, "Discarding undecodable cache entry"),
            },
            Ok(None) => debug!(key, "Cache miss"),
            Err(e) => warn!(key, error = %e, "Cache unavailable, reading through"),
        }

        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(json) => {
                if let Err(e) = self.backend.set(key, json, self.config.ttl).await {
                    warn!(key, error = %e, "Failed to cache query result");
                }
            }
            Err(e) => warn!(key, error = %e, "Failed to serialize query result"),
        }

        Ok(value)
    }
}
