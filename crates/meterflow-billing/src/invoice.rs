//! Invoice generation
//!
//! Turns an aggregation into a persisted Pending billing record, then emits a
//! `BillingCalculatedEvent`. The record store's unique constraints decide
//! races between concurrent calculations for the same period.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use meterflow_common::{
    BillingCalculatedEvent, BillingRecord, BillingRecordView, Customer, MeterflowError, Result,
    StoreError, UniqueConstraint, INVOICE_GRACE_DAYS,
};
use tracing::{info, instrument, warn};

use crate::aggregation::AggregationResult;
use crate::metrics::PipelineMetrics;
use crate::publisher::BillingEventPublisher;
use crate::store::{bounded, RecordStore};

/// Configuration for the invoice generator
#[derive(Debug, Clone)]
pub struct InvoiceConfig {
    /// Days from period end to due date
    pub grace_days: i64,
    pub store_timeout: Duration,
    pub publish_timeout: Duration,
}

impl Default for InvoiceConfig {
    fn default() -> Self {
        Self {
            grace_days: INVOICE_GRACE_DAYS,
            store_timeout: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Invoice numbers of the form `INV-<customer prefix>-<millis>`
///
/// The millisecond suffix is strictly increasing within the process: two
/// numbers issued in the same millisecond get consecutive suffixes.
#[derive(Debug, Default)]
pub struct InvoiceNumberSequence {
    last_millis: AtomicI64,
}

impl InvoiceNumberSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self, customer: &Customer) -> String {
        format!("INV-{}-{}", customer.invoice_prefix(), self.next_suffix())
    }

    fn next_suffix(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_millis.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last + 1);
            match self.last_millis.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Invoice generator
pub struct InvoiceGenerator {
    records: Arc<dyn RecordStore>,
    publisher: Arc<dyn BillingEventPublisher>,
    numbers: InvoiceNumberSequence,
    config: InvoiceConfig,
    metrics: Arc<PipelineMetrics>,
}

impl InvoiceGenerator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        publisher: Arc<dyn BillingEventPublisher>,
        config: InvoiceConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            records,
            publisher,
            numbers: InvoiceNumberSequence::new(),
            config,
            metrics,
        }
    }

    /// Persist a Pending record for the aggregation and announce it
    ///
    /// A record that loses the race for its period fails with
    /// `DuplicateBillingPeriod`; an invoice number collision fails with
    /// `InvoiceConflict`. Once the record is stored, a failed or timed-out
    /// publish is logged and the record is still returned.
    #[instrument(
        skip(self, aggregation),
        fields(customer_id = %aggregation.customer.id, period = %aggregation.period)
    )]
    pub async fn generate(&self, aggregation: &AggregationResult) -> Result<BillingRecordView> {
        let customer = &aggregation.customer;
        let invoice_number = self.numbers.next(customer);

        let mut metadata = serde_json::Map::new();
        metadata.insert("lines".into(), serde_json::to_value(&aggregation.lines)?);

        let record = BillingRecord::pending(
            customer.id,
            aggregation.period,
            aggregation.total,
            invoice_number,
        )?
        .with_grace_days(self.config.grace_days)
        .with_metadata(metadata);

        let inserted = bounded(
            self.config.store_timeout,
            "billing record insert",
            self.records.insert(&record),
        )
        .await;

        if let Err(err) = inserted {
            return Err(self.map_insert_error(err, &record));
        }

        self.metrics.records_created.inc();
        info!(
            record_id = %record.id,
            invoice_number = %record.invoice_number,
            total = %record.total_amount,
            "Created billing record"
        );

        self.announce(&record).await;

        Ok(BillingRecordView::new(&record, &customer.name))
    }

    fn map_insert_error(&self, err: MeterflowError, record: &BillingRecord) -> MeterflowError {
        match err {
            MeterflowError::Store(StoreError::UniqueViolation(UniqueConstraint::BillingPeriod)) => {
                self.metrics.duplicate_periods.inc();
                MeterflowError::DuplicateBillingPeriod {
                    customer_id: record.customer_id,
                    period_start: record.period.start,
                    period_end: record.period.end,
                }
            }
            MeterflowError::Store(StoreError::UniqueViolation(UniqueConstraint::InvoiceNumber)) => {
                MeterflowError::InvoiceConflict(record.invoice_number.clone())
            }
            other => other,
        }
    }

    async fn announce(&self, record: &BillingRecord) {
        let event = BillingCalculatedEvent::from_record(record);
        let outcome =
            match tokio::time::timeout(self.config.publish_timeout, self.publisher.publish(&event))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(MeterflowError::Timeout(format!(
                    "publish exceeded {}ms",
                    self.config.publish_timeout.as_millis()
                ))),
            };

        if let Err(err) = outcome {
            self.metrics.publish_failures.inc();
            let err = match err {
                MeterflowError::Publish(_) => err,
                other => MeterflowError::Publish(other.to_string()),
            };
            warn!(
                customer_id = %record.customer_id,
                period = %record.period,
                invoice_number = %record.invoice_number,
                error = %err,
                "Billing record stored but notification not delivered"
            );
        }
    }
}
