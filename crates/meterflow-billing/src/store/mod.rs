//! Storage interfaces
//!
//! The durable stores are external collaborators; the pipeline only depends on
//! these contracts:
//! - EventStore: append-only usage rows, read by customer and time window
//! - RecordStore: billing records with a unique (customer, period) constraint
//! - CustomerDirectory: read-only customer lookups
//! - SummaryViews: precomputed read models and their refresh

pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use meterflow_common::{
    BillingPeriod, BillingRecord, CostTrend, Customer, DailyUsageSummary, MeterflowError,
    MonthlyBillingSummary, Page, StoreError, StoredUsageRecord, UsageEvent,
};
use uuid::Uuid;

pub use memory::InMemoryStore;

/// Append-only usage event storage
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist all events as one atomic unit, returning the assigned ids in input order
    async fn append_batch(&self, events: &[UsageEvent]) -> Result<Vec<u64>, StoreError>;

    /// Stored usage for a customer with event time in `[start, end)`
    async fn usage_in_window(
        &self,
        customer_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredUsageRecord>, StoreError>;
}

/// Billing record storage
///
/// Implementations must enforce uniqueness of (customer_id, period) and of
/// invoice_number at insert time; that constraint is the authoritative guard
/// against concurrent calculations for the same period.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn exists_for_period(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<bool, StoreError>;

    /// Insert a new record, failing with `StoreError::UniqueViolation` on conflict
    async fn insert(&self, record: &BillingRecord) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<BillingRecord>, StoreError>;

    async fn find_by_invoice_number(
        &self,
        invoice_number: &str,
    ) -> Result<Option<BillingRecord>, StoreError>;

    /// Records for a customer, most recent first
    async fn list_by_customer(
        &self,
        customer_id: Uuid,
        page: usize,
        size: usize,
    ) -> Result<Page<BillingRecord>, StoreError>;
}

/// Read-only customer lookups
#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    async fn get(&self, customer_id: Uuid) -> Result<Option<Customer>, StoreError>;

    async fn list_active(&self) -> Result<Vec<Customer>, StoreError>;

    async fn list_active_by_plan(&self, plan_type: &str) -> Result<Vec<Customer>, StoreError> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .filter(|c| c.plan_type == plan_type)
            .collect())
    }
}

/// Precomputed summary views
///
/// Views reflect the event store as of the last `refresh`.
#[async_trait]
pub trait SummaryViews: Send + Sync {
    /// Daily per-resource rows for a customer, most recent date first
    async fn daily_usage(
        &self,
        customer_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageSummary>, StoreError>;

    /// Aggregate cost per day from `since` onward
    async fn cost_trend(&self, since: NaiveDate) -> Result<CostTrend, StoreError>;

    /// Billed totals per month for a customer, most recent month first
    async fn monthly_billing(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<MonthlyBillingSummary>, StoreError>;

    /// Recompute all views
    async fn refresh(&self) -> Result<(), StoreError>;
}

/// Run a store call under a deadline
pub(crate) async fn bounded<T, F>(timeout: Duration, operation: &str, call: F) -> meterflow_common::Result<T>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result.map_err(MeterflowError::from),
        Err(_) => Err(MeterflowError::Timeout(format!(
            "{} exceeded {}ms",
            operation,
            timeout.as_millis()
        ))),
    }
}
