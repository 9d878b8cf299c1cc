//! Billing facade
//!
//! Ties aggregation and invoice generation into the single calculation entry
//! point shared by the scheduled runner and on-demand callers, and serves the
//! billing record reads.

use std::sync::Arc;
use std::time::Duration;

use meterflow_common::{BillingPeriod, BillingRecordView, MeterflowError, Page, Result};
use tracing::instrument;
use uuid::Uuid;

use crate::aggregation::AggregationEngine;
use crate::invoice::InvoiceGenerator;
use crate::store::{bounded, CustomerDirectory, RecordStore};

pub struct BillingService {
    engine: AggregationEngine,
    invoices: InvoiceGenerator,
    records: Arc<dyn RecordStore>,
    customers: Arc<dyn CustomerDirectory>,
    store_timeout: Duration,
}

impl BillingService {
    pub fn new(
        engine: AggregationEngine,
        invoices: InvoiceGenerator,
        records: Arc<dyn RecordStore>,
        customers: Arc<dyn CustomerDirectory>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            engine,
            invoices,
            records,
            customers,
            store_timeout,
        }
    }

    /// Bill `customer_id` for `period`
    ///
    /// Repeating a calculation for a billed period fails with
    /// `DuplicateBillingPeriod` and leaves the existing record untouched.
    #[instrument(skip(self), fields(period = %period))]
    pub async fn calculate_billing(
        &self,
        customer_id: Uuid,
        period: BillingPeriod,
    ) -> Result<BillingRecordView> {
        let aggregation = self.engine.aggregate(customer_id, period).await?;
        self.invoices.generate(&aggregation).await
    }

    /// A customer's billing records, most recent first
    pub async fn billing_records(
        &self,
        customer_id: Uuid,
        page: usize,
        size: usize,
    ) -> Result<Page<BillingRecordView>> {
        let customer = bounded(
            self.store_timeout,
            "customer lookup",
            self.customers.get(customer_id),
        )
        .await?
        .ok_or(MeterflowError::CustomerNotFound(customer_id))?;

        let records = bounded(
            self.store_timeout,
            "billing record listing",
            self.records.list_by_customer(customer_id, page, size),
        )
        .await?;

        Ok(records.map(|record| BillingRecordView::new(&record, &customer.name)))
    }

    pub async fn record_by_invoice(&self, invoice_number: &str) -> Result<Option<BillingRecordView>> {
        let record = bounded(
            self.store_timeout,
            "invoice lookup",
            self.records.find_by_invoice_number(invoice_number),
        )
        .await?;

        let Some(record) = record else {
            return Ok(None);
        };

        let name = bounded(
            self.store_timeout,
            "customer lookup",
            self.customers.get(record.customer_id),
        )
        .await?
        .map(|c| c.name)
        .unwrap_or_default();

        Ok(Some(BillingRecordView::new(&record, &name)))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::invoice::InvoiceConfig;
    use crate::metrics::PipelineMetrics;
    use crate::publisher::{BillingEventPublisher, InMemoryPublisher};
    use crate::store::{EventStore, InMemoryStore};
    use crate::testing::{date, january, seeded_store, usage_at};
    use rust_decimal_macros::dec;

    pub(crate) fn service_over(
        store: Arc<InMemoryStore>,
        publisher: Arc<dyn BillingEventPublisher>,
    ) -> BillingService {
        let timeout = Duration::from_secs(1);
        let metrics = Arc::new(PipelineMetrics::new().unwrap());
        BillingService::new(
            AggregationEngine::new(store.clone(), store.clone(), store.clone(), timeout),
            InvoiceGenerator::new(store.clone(), publisher, InvoiceConfig::default(), metrics),
            store.clone(),
            store,
            timeout,
        )
    }

    #[tokio::test]
    async fn test_second_calculation_is_rejected() {
        let (store, customer) = seeded_store().await;
        store
            .append_batch(&[usage_at(customer.id, "cpu", dec!(2), Some(dec!(3)), date(2024, 1, 10))])
            .await
            .unwrap();
        let publisher = Arc::new(InMemoryPublisher::new());
        let service = service_over(store.clone(), publisher.clone());

        let first = service.calculate_billing(customer.id, january()).await.unwrap();
        assert_eq!(first.total_amount, dec!(6));

        let err = service.calculate_billing(customer.id, january()).await.unwrap_err();
        assert!(err.is_duplicate_period());
        assert_eq!(store.record_count(), 1);
        assert_eq!(publisher.published().len(), 1);
    }

    #[tokio::test]
    async fn test_billing_records_carry_customer_name() {
        let (store, customer) = seeded_store().await;
        let service = service_over(store, Arc::new(InMemoryPublisher::new()));
        let view = service.calculate_billing(customer.id, january()).await.unwrap();

        let page = service.billing_records(customer.id, 0, 10).await.unwrap();
        assert_eq!(page.total_items, 1);
        assert_eq!(page.items[0].customer_name, "Acme Corp");

        let found = service.record_by_invoice(&view.invoice_number).await.unwrap();
        assert_eq!(found.unwrap().id, view.id);
        assert!(service.record_by_invoice("INV-NONE").await.unwrap().is_none());
    }
}
