//! Meterflow service configuration

use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use meterflow_billing::{IngestorConfig, InvoiceConfig, RunnerConfig, WorkerConfig};
use meterflow_common::{
    DEFAULT_INGEST_WORKERS, DEFAULT_SUMMARY_REFRESH_SECS, INVOICE_GRACE_DAYS, SUB_BATCH_SIZE,
};
use serde::{Deserialize, Serialize};

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub nats: NatsSettings,
    /// Redis URL for the billing run lock; in-process lock when unset
    pub redis_url: Option<String>,
    pub ingestion: IngestionSettings,
    pub billing: BillingSettings,
    pub views: ViewSettings,
    /// JSON file of customers loaded into the directory at startup
    pub customers_file: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            nats: NatsSettings::default(),
            redis_url: None,
            ingestion: IngestionSettings::default(),
            billing: BillingSettings::default(),
            views: ViewSettings::default(),
            customers_file: None,
        }
    }
}

/// Message bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsSettings {
    pub url: String,
    /// Stream holding usage and dead-lettered usage subjects
    pub usage_stream: String,
    /// Stream holding billing notifications
    pub billing_stream: String,
    pub consumer_name: String,
    /// Longest wait for a batch per fetch
    pub fetch_max_wait_secs: u64,
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: "nats://localhost:4222".to_string(),
            usage_stream: "USAGE".to_string(),
            billing_stream: "BILLING".to_string(),
            consumer_name: "meterflow-ingest".to_string(),
            fetch_max_wait_secs: 5,
        }
    }
}

/// Ingestion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionSettings {
    pub workers: usize,
    pub sub_batch_size: usize,
    pub store_timeout_ms: u64,
}

impl Default for IngestionSettings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_INGEST_WORKERS,
            sub_batch_size: SUB_BATCH_SIZE,
            store_timeout_ms: 10_000,
        }
    }
}

/// Billing run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingSettings {
    pub runner_workers: usize,
    pub grace_days: i64,
    /// Interval between month-end checks
    pub schedule_interval_secs: u64,
    pub lock_ttl_secs: u64,
    pub publish_timeout_ms: u64,
    pub store_timeout_ms: u64,
}

impl Default for BillingSettings {
    fn default() -> Self {
        Self {
            runner_workers: 4,
            grace_days: INVOICE_GRACE_DAYS,
            schedule_interval_secs: 60 * 60,
            lock_ttl_secs: 30 * 60,
            publish_timeout_ms: 5_000,
            store_timeout_ms: 5_000,
        }
    }
}

/// Summary view settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewSettings {
    pub refresh_interval_secs: u64,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_SUMMARY_REFRESH_SECS,
        }
    }
}

/// Overwrite `target` when `name` is set and parses
fn override_from_env<T: FromStr>(name: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse() {
            *target = value;
        }
    }
}

impl ServiceConfig {
    /// Load configuration from `.env` and `METERFLOW_*` environment variables
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let mut cfg = Self::default();

        // Bus
        override_from_env("METERFLOW_NATS_URL", &mut cfg.nats.url);
        override_from_env("METERFLOW_NATS_USAGE_STREAM", &mut cfg.nats.usage_stream);
        override_from_env("METERFLOW_NATS_BILLING_STREAM", &mut cfg.nats.billing_stream);
        override_from_env("METERFLOW_NATS_CONSUMER", &mut cfg.nats.consumer_name);
        override_from_env("METERFLOW_NATS_FETCH_MAX_WAIT_SECS", &mut cfg.nats.fetch_max_wait_secs);

        if let Ok(url) = std::env::var("METERFLOW_REDIS_URL") {
            if !url.is_empty() {
                cfg.redis_url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("METERFLOW_CUSTOMERS_FILE") {
            if !path.is_empty() {
                cfg.customers_file = Some(path);
            }
        }

        // Ingestion
        override_from_env("METERFLOW_INGEST_WORKERS", &mut cfg.ingestion.workers);
        override_from_env("METERFLOW_SUB_BATCH_SIZE", &mut cfg.ingestion.sub_batch_size);
        override_from_env("METERFLOW_INGEST_STORE_TIMEOUT_MS", &mut cfg.ingestion.store_timeout_ms);

        // Billing
        override_from_env("METERFLOW_RUNNER_WORKERS", &mut cfg.billing.runner_workers);
        override_from_env("METERFLOW_GRACE_DAYS", &mut cfg.billing.grace_days);
        override_from_env(
            "METERFLOW_SCHEDULE_INTERVAL_SECS",
            &mut cfg.billing.schedule_interval_secs,
        );
        override_from_env("METERFLOW_LOCK_TTL_SECS", &mut cfg.billing.lock_ttl_secs);
        override_from_env("METERFLOW_PUBLISH_TIMEOUT_MS", &mut cfg.billing.publish_timeout_ms);
        override_from_env("METERFLOW_STORE_TIMEOUT_MS", &mut cfg.billing.store_timeout_ms);

        // Summary views
        override_from_env(
            "METERFLOW_REFRESH_INTERVAL_SECS",
            &mut cfg.views.refresh_interval_secs,
        );

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.ingestion.sub_batch_size == 0 {
            anyhow::bail!("METERFLOW_SUB_BATCH_SIZE must be positive");
        }
        if self.ingestion.workers == 0 || self.billing.runner_workers == 0 {
            anyhow::bail!("worker counts must be positive");
        }
        if self.billing.grace_days < 0 {
            anyhow::bail!("METERFLOW_GRACE_DAYS cannot be negative");
        }
        if self.views.refresh_interval_secs == 0 || self.billing.schedule_interval_secs == 0 {
            anyhow::bail!("intervals must be positive");
        }
        Ok(())
    }

    pub fn ingestor(&self) -> IngestorConfig {
        IngestorConfig {
            sub_batch_size: self.ingestion.sub_batch_size,
            store_timeout: Duration::from_millis(self.ingestion.store_timeout_ms),
        }
    }

    pub fn workers(&self) -> WorkerConfig {
        WorkerConfig {
            workers: self.ingestion.workers,
            ..WorkerConfig::default()
        }
    }

    pub fn invoice(&self) -> InvoiceConfig {
        InvoiceConfig {
            grace_days: self.billing.grace_days,
            store_timeout: self.store_timeout(),
            publish_timeout: Duration::from_millis(self.billing.publish_timeout_ms),
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig {
            workers: self.billing.runner_workers,
            lock_ttl: Duration::from_secs(self.billing.lock_ttl_secs),
            store_timeout: self.store_timeout(),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.billing.store_timeout_ms)
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.billing.schedule_interval_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.views.refresh_interval_secs)
    }

    pub fn fetch_max_wait(&self) -> Duration {
        Duration::from_secs(self.nats.fetch_max_wait_secs)
    }
}
