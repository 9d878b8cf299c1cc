//! Period aggregation
//!
//! Computes what a customer owes for a closed billing period from stored usage.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use meterflow_common::{
    BillingPeriod, Customer, MeterflowError, Result, StoredUsageRecord,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::store::{bounded, CustomerDirectory, EventStore, RecordStore};

/// Cost of one resource type over a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceCost {
    pub resource_type: String,
    pub total_quantity: Decimal,
    pub total_cost: Decimal,
    pub event_count: u64,
}

impl ResourceCost {
    fn empty(resource_type: &str) -> Self {
        Self {
            resource_type: resource_type.to_string(),
            total_quantity: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            event_count: 0,
        }
    }
}

/// Amount owed by a customer for a period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    pub customer: Customer,
    pub period: BillingPeriod,
    /// Per-resource costs ordered by resource type
    pub lines: Vec<ResourceCost>,
    pub total: Decimal,
}

impl AggregationResult {
    pub fn line(&self, resource_type: &str) -> Option<&ResourceCost> {
        self.lines.iter().find(|l| l.resource_type == resource_type)
    }
}

/// Group stored usage by resource type and sum exact costs
///
/// Free events (no unit price) count toward quantity at zero cost. Any
/// overflow fails with `ArithmeticOverflow`.
pub fn summarize(records: &[StoredUsageRecord]) -> Result<(Vec<ResourceCost>, Decimal)> {
    let mut groups: BTreeMap<&str, ResourceCost> = BTreeMap::new();

    for record in records {
        let event = &record.event;
        let cost = event.cost()?;
        let line = groups
            .entry(event.resource_type.as_str())
            .or_insert_with(|| ResourceCost::empty(&event.resource_type));

        line.total_quantity = line
            .total_quantity
            .checked_add(event.quantity)
            .ok_or_else(|| overflow(&event.resource_type, "quantity"))?;
        line.total_cost = line
            .total_cost
            .checked_add(cost)
            .ok_or_else(|| overflow(&event.resource_type, "cost"))?;
        line.event_count += 1;
    }

    let lines: Vec<ResourceCost> = groups.into_values().collect();
    let total = lines.iter().try_fold(Decimal::ZERO, |acc, line| {
        acc.checked_add(line.total_cost)
            .ok_or_else(|| overflow("total", "cost"))
    })?;

    Ok((lines, total))
}

fn overflow(scope: &str, what: &str) -> MeterflowError {
    MeterflowError::ArithmeticOverflow(format!("{} {} exceeds decimal range", scope, what))
}

/// Aggregation engine
pub struct AggregationEngine {
    events: Arc<dyn EventStore>,
    records: Arc<dyn RecordStore>,
    customers: Arc<dyn CustomerDirectory>,
    store_timeout: Duration,
}

impl AggregationEngine {
    pub fn new(
        events: Arc<dyn EventStore>,
        records: Arc<dyn RecordStore>,
        customers: Arc<dyn CustomerDirectory>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            events,
            records,
            customers,
            store_timeout,
        }
    }

    /// Compute the amount owed by `customer_id` for `period`
    ///
    /// Fails with `DuplicateBillingPeriod` when a record already exists for the
    /// period (checked before anything else), and `CustomerNotFound` for an
    /// unknown customer. Usage is read over the half-open window covering every
    /// instant of the period's days.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn aggregate(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<AggregationResult> {
        let already_billed = bounded(
            self.store_timeout,
            "billing period lookup",
            self.records.exists_for_period(customer_id, period),
        )
        .await?;
        if already_billed {
            debug!(%customer_id, "Period already billed");
            return Err(MeterflowError::DuplicateBillingPeriod {
                customer_id,
                period_start: period.start,
                period_end: period.end,
            });
        }

        let customer = bounded(
            self.store_timeout,
            "customer lookup",
            self.customers.get(customer_id),
        )
        .await?
        .ok_or(MeterflowError::CustomerNotFound(customer_id))?;

        let usage = bounded(
            self.store_timeout,
            "usage window read",
            self.events
                .usage_in_window(customer_id, period.window_start(), period.window_end()),
        )
        .await?;

        let (lines, total) = summarize(&usage)?;

        info!(
            %customer_id,
            events = usage.len(),
            resources = lines.len(),
            %total,
            "Aggregated billing period"
        );

        Ok(AggregationResult {
            customer,
            period,
            lines,
            total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{date, january, seeded_store, usage_at};
    use meterflow_common::BillingRecord;
    use rust_decimal_macros::dec;

    fn engine(store: Arc<crate::store::InMemoryStore>) -> AggregationEngine {
        AggregationEngine::new(store.clone(), store.clone(), store, Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_exact_cost_per_resource() {
        let (store, customer) = seeded_store().await;
        store
            .append_batch(&[
                usage_at(customer.id, "cpu", dec!(10), Some(dec!(0.05)), date(2024, 1, 3)),
                usage_at(customer.id, "cpu", dec!(5), Some(dec!(0.05)), date(2024, 1, 20)),
                usage_at(customer.id, "storage", dec!(100), Some(dec!(0.001)), date(2024, 1, 31)),
            ])
            .await
            .unwrap();

        let result = engine(store).aggregate(customer.id, january()).await.unwrap();

        assert_eq!(result.line("cpu").unwrap().total_cost, dec!(0.75));
        assert_eq!(result.line("storage").unwrap().total_cost, dec!(0.1));
        assert_eq!(result.total, dec!(0.85));
        assert_eq!(result.customer.id, customer.id);
    }

    #[tokio::test]
    async fn test_last_day_included_next_day_excluded() {
        let (store, customer) = seeded_store().await;
        let last_instant = january().window_end() - chrono::Duration::milliseconds(1);
        store
            .append_batch(&[
                usage_at(customer.id, "cpu", dec!(1), Some(dec!(2)), date(2024, 1, 1))
                    .at(last_instant),
                usage_at(customer.id, "cpu", dec!(1), Some(dec!(2)), date(2024, 2, 1))
                    .at(january().window_end()),
            ])
            .await
            .unwrap();

        let result = engine(store).aggregate(customer.id, january()).await.unwrap();
        assert_eq!(result.total, dec!(2));
    }

    #[tokio::test]
    async fn test_empty_period_totals_zero() {
        let (store, customer) = seeded_store().await;
        let result = engine(store).aggregate(customer.id, january()).await.unwrap();

        assert!(result.lines.is_empty());
        assert_eq!(result.total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_free_events_count_quantity_only() {
        let (store, customer) = seeded_store().await;
        store
            .append_batch(&[usage_at(customer.id, "api_calls", dec!(1000), None, date(2024, 1, 9))])
            .await
            .unwrap();

        let result = engine(store).aggregate(customer.id, january()).await.unwrap();
        let line = result.line("api_calls").unwrap();
        assert_eq!(line.total_quantity, dec!(1000));
        assert_eq!(line.total_cost, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_duplicate_checked_before_customer() {
        let (store, _) = seeded_store().await;
        let unknown = Uuid::new_v4();
        let record = BillingRecord::pending(unknown, january(), dec!(1), "INV-X".into()).unwrap();
        store.insert(&record).await.unwrap();

        let err = engine(store).aggregate(unknown, january()).await.unwrap_err();
        assert!(err.is_duplicate_period());
    }

    #[tokio::test]
    async fn test_unknown_customer() {
        let (store, _) = seeded_store().await;
        let unknown = Uuid::new_v4();

        let err = engine(store).aggregate(unknown, january()).await.unwrap_err();
        assert!(matches!(err, MeterflowError::CustomerNotFound(id) if id == unknown));
    }

    #[tokio::test]
    async fn test_overflow_is_an_error() {
        let (store, customer) = seeded_store().await;
        store
            .append_batch(&[usage_at(
                customer.id,
                "cpu",
                Decimal::MAX,
                Some(dec!(2)),
                date(2024, 1, 2),
            )])
            .await
            .unwrap();

        let err = engine(store).aggregate(customer.id, january()).await.unwrap_err();
        assert!(matches!(err, MeterflowError::ArithmeticOverflow(_)));
    }
}
