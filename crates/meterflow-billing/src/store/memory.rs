//! In-memory storage implementation
//!
//! Backs every storage interface with process memory. Used by the service
//! binary when no external database is wired in, and by tests. Record inserts
//! check and claim both unique keys under one lock, so the (customer, period)
//! and invoice number constraints hold under concurrent callers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use dashmap::DashMap;
use meterflow_common::{
    BillingPeriod, BillingRecord, CostTrend, Customer, DailyUsageSummary, MonthlyBillingSummary,
    Page, StoreError, StoredUsageRecord, UniqueConstraint, UsageEvent,
};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CustomerDirectory, EventStore, RecordStore, SummaryViews};

#[derive(Default)]
struct RecordTables {
    by_id: HashMap<Uuid, BillingRecord>,
    by_period: HashMap<(Uuid, BillingPeriod), Uuid>,
    by_invoice: HashMap<String, Uuid>,
}

#[derive(Default)]
struct SummarySnapshot {
    daily: Vec<DailyUsageSummary>,
    monthly: Vec<MonthlyBillingSummary>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// In-memory store for usage, billing records, customers and summary views
pub struct InMemoryStore {
    /// Usage rows in insertion order
    usage: RwLock<Vec<StoredUsageRecord>>,
    next_usage_id: AtomicU64,
    records: Mutex<RecordTables>,
    customers: DashMap<Uuid, Customer>,
    summaries: RwLock<SummarySnapshot>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            usage: RwLock::new(Vec::new()),
            next_usage_id: AtomicU64::new(1),
            records: Mutex::new(RecordTables::default()),
            customers: DashMap::new(),
            summaries: RwLock::new(SummarySnapshot::default()),
        }
    }

    /// Insert or replace a customer
    pub fn upsert_customer(&self, customer: Customer) {
        self.customers.insert(customer.id, customer);
    }

    /// Total stored usage rows
    pub fn usage_count(&self) -> usize {
        self.usage.read().len()
    }

    /// Total stored billing records
    pub fn record_count(&self) -> usize {
        self.records.lock().by_id.len()
    }

    /// When summary views were last recomputed
    pub fn summaries_refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.summaries.read().refreshed_at
    }

    /// Daily usage rows; a row that cannot be totalled is logged and left out
    fn compute_daily(&self) -> Vec<DailyUsageSummary> {
        let usage = self.usage.read();
        let mut groups: BTreeMap<(Uuid, NaiveDate, String), DailyUsageSummary> = BTreeMap::new();

        for row in usage.iter() {
            let event = &row.event;
            let usage_date = event.timestamp.date_naive();

            let entry = groups
                .entry((event.customer_id, usage_date, event.resource_type.clone()))
                .or_insert_with(|| DailyUsageSummary {
                    customer_id: event.customer_id,
                    usage_date,
                    resource_type: event.resource_type.clone(),
                    total_quantity: Decimal::ZERO,
                    total_cost: Decimal::ZERO,
                    event_count: 0,
                });

            let totals = event.cost().ok().and_then(|cost| {
                Some((
                    entry.total_quantity.checked_add(event.quantity)?,
                    entry.total_cost.checked_add(cost)?,
                ))
            });
            match totals {
                Some((quantity, cost)) => {
                    entry.total_quantity = quantity;
                    entry.total_cost = cost;
                    entry.event_count += 1;
                }
                None => warn!(
                    usage_id = row.id,
                    event_id = %event.event_id,
                    customer_id = %event.customer_id,
                    "Usage row overflows its daily summary, skipped"
                ),
            }
        }

        groups
            .into_values()
            .filter(|row| row.event_count > 0)
            .collect()
    }

    /// Billed totals per customer and month
    fn compute_monthly(&self) -> Vec<MonthlyBillingSummary> {
        let tables = self.records.lock();
        let mut groups: BTreeMap<(Uuid, NaiveDate), MonthlyBillingSummary> = BTreeMap::new();

        for record in tables.by_id.values() {
            let start = record.period.start;
            let month = start.with_day(1).unwrap_or(start);

            let entry = groups
                .entry((record.customer_id, month))
                .or_insert_with(|| MonthlyBillingSummary {
                    customer_id: record.customer_id,
                    month,
                    record_count: 0,
                    total_amount: Decimal::ZERO,
                });

            match entry.total_amount.checked_add(record.total_amount) {
                Some(total) => {
                    entry.total_amount = total;
                    entry.record_count += 1;
                }
                None => warn!(
                    record_id = %record.id,
                    customer_id = %record.customer_id,
                    "Billing record overflows its monthly summary, skipped"
                ),
            }
        }

        groups
            .into_values()
            .filter(|row| row.record_count > 0)
            .collect()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryStore {
    async fn append_batch(&self, events: &[UsageEvent]) -> Result<Vec<u64>, StoreError> {
        let ingested_at = Utc::now();
        let mut usage = self.usage.write();

        let ids: Vec<u64> = events
            .iter()
            .map(|_| self.next_usage_id.fetch_add(1, Ordering::Relaxed))
            .collect();

        usage.extend(ids.iter().zip(events).map(|(id, event)| StoredUsageRecord {
            id: *id,
            event: event.clone(),
            ingested_at,
        }));

        Ok(ids)
    }

    async fn usage_in_window(
        &self,
        customer_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StoredUsageRecord>, StoreError> {
        Ok(self
            .usage
            .read()
            .iter()
            .filter(|row| row.event.customer_id == customer_id && row.in_window(start, end))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn exists_for_period(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<bool, StoreError> {
        Ok(self
            .records
            .lock()
            .by_period
            .contains_key(&(customer_id, period)))
    }

    async fn insert(&self, record: &BillingRecord) -> Result<(), StoreError> {
        let mut tables = self.records.lock();
        let period_key = (record.customer_id, record.period);

        if tables.by_period.contains_key(&period_key) {
            return Err(StoreError::UniqueViolation(UniqueConstraint::BillingPeriod));
        }
        if tables.by_invoice.contains_key(&record.invoice_number) {
            return Err(StoreError::UniqueViolation(UniqueConstraint::InvoiceNumber));
        }

        tables.by_period.insert(period_key, record.id);
        tables
            .by_invoice
            .insert(record.invoice_number.clone(), record.id);
        tables.by_id.insert(record.id, record.clone());

        debug!(record_id = %record.id, invoice_number = %record.invoice_number, "Stored billing record");
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BillingRecord>, StoreError> {
        Ok(self.records.lock().by_id.get(&id).cloned())
    }

    async fn find_by_invoice_number(
        &self,
        invoice_number: &str,
    ) -> Result<Option<BillingRecord>, StoreError> {
        let tables = self.records.lock();
        Ok(tables
            .by_invoice
            .get(invoice_number)
            .and_then(|id| tables.by_id.get(id))
            .cloned())
    }

    async fn list_by_customer(
        &self,
        customer_id: Uuid,
        page: usize,
        size: usize,
    ) -> Result<Page<BillingRecord>, StoreError> {
        let mut records: Vec<BillingRecord> = self
            .records
            .lock()
            .by_id
            .values()
            .filter(|r| r.customer_id == customer_id)
            .cloned()
            .collect();

        // v7 ids break ties between records created in the same instant
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(Page::from_vec(records, page, size))
    }
}

#[async_trait]
impl CustomerDirectory for InMemoryStore {
    async fn get(&self, customer_id: Uuid) -> Result<Option<Customer>, StoreError> {
        Ok(self.customers.get(&customer_id).map(|c| c.clone()))
    }

    async fn list_active(&self) -> Result<Vec<Customer>, StoreError> {
        let mut active: Vec<Customer> = self
            .customers
            .iter()
            .filter(|c| c.is_active())
            .map(|c| c.clone())
            .collect();
        active.sort_by_key(|c| c.id);
        Ok(active)
    }
}

#[async_trait]
impl SummaryViews for InMemoryStore {
    async fn daily_usage(
        &self,
        customer_id: Uuid,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsageSummary>, StoreError> {
        let mut rows: Vec<DailyUsageSummary> = self
            .summaries
            .read()
            .daily
            .iter()
            .filter(|row| {
                row.customer_id == customer_id && row.usage_date >= start && row.usage_date <= end
            })
            .cloned()
            .collect();

        rows.sort_by(|a, b| {
            b.usage_date
                .cmp(&a.usage_date)
                .then_with(|| a.resource_type.cmp(&b.resource_type))
        });
        Ok(rows)
    }

    async fn cost_trend(&self, since: NaiveDate) -> Result<CostTrend, StoreError> {
        let mut by_day: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
        for row in self.summaries.read().daily.iter() {
            if row.usage_date < since {
                continue;
            }
            let total = by_day.entry(row.usage_date).or_insert(Decimal::ZERO);
            *total = total
                .checked_add(row.total_cost)
                .ok_or_else(|| StoreError::Constraint(format!("cost trend overflow on {}", row.usage_date)))?;
        }

        let mut trend = CostTrend::default();
        for (date, cost) in by_day {
            trend.push(date, cost);
        }
        Ok(trend)
    }

    async fn monthly_billing(
        &self,
        customer_id: Uuid,
    ) -> Result<Vec<MonthlyBillingSummary>, StoreError> {
        let mut rows: Vec<MonthlyBillingSummary> = self
            .summaries
            .read()
            .monthly
            .iter()
            .filter(|row| row.customer_id == customer_id)
            .cloned()
            .collect();

        rows.sort_by(|a, b| b.month.cmp(&a.month));
        Ok(rows)
    }

    async fn refresh(&self) -> Result<(), StoreError> {
        let daily = self.compute_daily();
        let monthly = self.compute_monthly();
        let (daily_rows, monthly_rows) = (daily.len(), monthly.len());

        let mut snapshot = self.summaries.write();
        snapshot.daily = daily;
        snapshot.monthly = monthly;
        snapshot.refreshed_at = Some(Utc::now());

        debug!(daily_rows, monthly_rows, "Recomputed summary views");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn event(customer_id: Uuid, resource: &str, qty: Decimal, price: Decimal, day: u32) -> UsageEvent {
        UsageEvent::new(customer_id, resource, qty, "unit")
            .with_unit_price(price)
            .at(Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap())
    }

    fn period() -> BillingPeriod {
        BillingPeriod::month_of(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[tokio::test]
    async fn test_append_assigns_sequential_ids() {
        let store = InMemoryStore::new();
        let customer = Uuid::new_v4();

        let first = store
            .append_batch(&[event(customer, "cpu", dec!(1), dec!(1), 1)])
            .await
            .unwrap();
        let second = store
            .append_batch(&[
                event(customer, "cpu", dec!(1), dec!(1), 2),
                event(customer, "cpu", dec!(1), dec!(1), 3),
            ])
            .await
            .unwrap();

        assert_eq!(first, vec![1]);
        assert_eq!(second, vec![2, 3]);
        assert_eq!(store.usage_count(), 3);
    }

    #[tokio::test]
    async fn test_window_is_half_open() {
        let store = InMemoryStore::new();
        let customer = Uuid::new_v4();
        let p = period();

        let at_start = event(customer, "cpu", dec!(1), dec!(1), 1).at(p.window_start());
        let at_end = event(customer, "cpu", dec!(1), dec!(1), 1).at(p.window_end());
        store.append_batch(&[at_start, at_end]).await.unwrap();

        let rows = store
            .usage_in_window(customer, p.window_start(), p.window_end())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event.timestamp, p.window_start());
    }

    #[tokio::test]
    async fn test_unique_period_constraint() {
        let store = InMemoryStore::new();
        let customer = Uuid::new_v4();

        let first = BillingRecord::pending(customer, period(), dec!(1), "INV-A".into()).unwrap();
        let second = BillingRecord::pending(customer, period(), dec!(2), "INV-B".into()).unwrap();

        store.insert(&first).await.unwrap();
        let err = store.insert(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(UniqueConstraint::BillingPeriod)));
        assert!(store.exists_for_period(customer, period()).await.unwrap());
        assert_eq!(store.record_count(), 1);
    }

    #[tokio::test]
    async fn test_unique_invoice_constraint() {
        let store = InMemoryStore::new();
        let first = BillingRecord::pending(Uuid::new_v4(), period(), dec!(1), "INV-A".into()).unwrap();
        let second = BillingRecord::pending(Uuid::new_v4(), period(), dec!(1), "INV-A".into()).unwrap();

        store.insert(&first).await.unwrap();
        let err = store.insert(&second).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(UniqueConstraint::InvoiceNumber)));

        let found = store.find_by_invoice_number("INV-A").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_list_by_customer_most_recent_first() {
        let store = InMemoryStore::new();
        let customer = Uuid::new_v4();

        for month in 1..=3 {
            let p = BillingPeriod::month_of(NaiveDate::from_ymd_opt(2024, month, 1).unwrap());
            let record =
                BillingRecord::pending(customer, p, dec!(1), format!("INV-{}", month)).unwrap();
            store.insert(&record).await.unwrap();
        }

        let page = store.list_by_customer(customer, 0, 2).await.unwrap();
        assert_eq!(page.total_items, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].invoice_number, "INV-3");
        assert_eq!(page.items[1].invoice_number, "INV-2");
    }

    #[tokio::test]
    async fn test_active_customers_by_plan() {
        let store = InMemoryStore::new();
        store.upsert_customer(Customer::active("A", "a@test", "pro"));
        store.upsert_customer(Customer::active("B", "b@test", "basic"));
        store.upsert_customer(
            Customer::active("C", "c@test", "pro")
                .with_status(meterflow_common::CustomerStatus::Inactive),
        );

        assert_eq!(store.list_active().await.unwrap().len(), 2);
        let pro = store.list_active_by_plan("pro").await.unwrap();
        assert_eq!(pro.len(), 1);
        assert_eq!(pro[0].name, "A");
    }

    #[tokio::test]
    async fn test_summary_views_reflect_last_refresh() {
        let store = InMemoryStore::new();
        let customer = Uuid::new_v4();

        store
            .append_batch(&[
                event(customer, "cpu", dec!(10), dec!(0.05), 5),
                event(customer, "cpu", dec!(5), dec!(0.05), 5),
                event(customer, "storage", dec!(100), dec!(0.001), 6),
            ])
            .await
            .unwrap();

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert!(store.daily_usage(customer, start, end).await.unwrap().is_empty());

        store.refresh().await.unwrap();
        assert!(store.summaries_refreshed_at().is_some());

        let rows = store.daily_usage(customer, start, end).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].resource_type, "storage");
        assert_eq!(rows[1].total_quantity, dec!(15));
        assert_eq!(rows[1].total_cost, dec!(0.75));
        assert_eq!(rows[1].event_count, 2);

        let trend = store.cost_trend(start).await.unwrap();
        assert_eq!(trend.labels, vec!["2024-01-05", "2024-01-06"]);
        assert_eq!(trend.values, vec![dec!(0.75), dec!(0.100)]);
    }

    #[tokio::test]
    async fn test_unbillable_row_does_not_block_refresh() {
        let store = InMemoryStore::new();
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();

        // Appended directly; the ingestor would reject the second event
        store
            .append_batch(&[
                event(good, "cpu", dec!(2), dec!(0.5), 5),
                event(bad, "cpu", Decimal::MAX, dec!(2), 5),
                event(bad, "cpu", dec!(1), dec!(1), 5),
            ])
            .await
            .unwrap();

        store.refresh().await.unwrap();

        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let rows = store.daily_usage(good, start, end).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].total_cost, dec!(1.0));

        let rows = store.daily_usage(bad, start, end).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_count, 1);
        assert_eq!(rows[0].total_cost, dec!(1));
    }

    #[tokio::test]
    async fn test_monthly_billing_view() {
        let store = InMemoryStore::new();
        let customer = Uuid::new_v4();

        for (month, amount, invoice) in [(1, dec!(10.50), "INV-1"), (2, dec!(4.25), "INV-2")] {
            let p = BillingPeriod::month_of(NaiveDate::from_ymd_opt(2024, month, 1).unwrap());
            let record = BillingRecord::pending(customer, p, amount, invoice.into()).unwrap();
            store.insert(&record).await.unwrap();
        }
        let other = BillingRecord::pending(Uuid::new_v4(), period(), dec!(99), "INV-3".into()).unwrap();
        store.insert(&other).await.unwrap();

        assert!(store.monthly_billing(customer).await.unwrap().is_empty());
        store.refresh().await.unwrap();

        let rows = store.monthly_billing(customer).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].month, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        assert_eq!(rows[0].total_amount, dec!(4.25));
        assert_eq!(rows[1].record_count, 1);
        assert_eq!(rows[1].total_amount, dec!(10.50));
    }
}
