//! # Meterflow Common
//!
//! Shared types and errors for the Meterflow usage-to-billing pipeline.
//!
//! ## Core Types
//!
//! - [`UsageEvent`]: a metered usage data point produced by a metering client
//! - [`StoredUsageRecord`]: the persisted form of a usage event
//! - [`BillingRecord`]: one bill for a customer and a closed calendar period
//! - [`BillingCalculatedEvent`]: outbound notification for a newly created bill
//! - [`Customer`]: read-only customer reference data
//! - [`DailyUsageSummary`]/[`CostTrend`]: precomputed read models

pub mod error;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{IngestionError, MeterflowError, Result, StoreError, UniqueConstraint};
pub use types::{
    billing::{
        BillingCalculatedEvent, BillingPeriod, BillingRecord, BillingRecordView, BillingStatus,
    },
    customer::{Customer, CustomerStatus},
    summary::{CostTrend, DailyUsageSummary, MonthlyBillingSummary, Page},
    usage::{StoredUsageRecord, UsageEvent},
};

/// Meterflow version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum usage events written in one atomic sub-batch
pub const SUB_BATCH_SIZE: usize = 50;

/// Days between the end of a billing period and the invoice due date
pub const INVOICE_GRACE_DAYS: i64 = 30;

/// Default number of concurrent ingestion workers
pub const DEFAULT_INGEST_WORKERS: usize = 3;

/// Default interval between summary view refreshes (15 minutes)
pub const DEFAULT_SUMMARY_REFRESH_SECS: u64 = 15 * 60;

/// Bus subject carrying inbound usage events
pub const USAGE_EVENTS_SUBJECT: &str = "usage-events";

/// Bus subject receiving usage batches rejected by validation
pub const USAGE_EVENTS_DLQ_SUBJECT: &str = "usage-events-dlq";

/// Bus subject carrying outbound billing notifications
pub const BILLING_EVENTS_SUBJECT: &str = "billing-events";
