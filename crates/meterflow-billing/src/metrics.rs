//! Prometheus metrics for the billing pipeline

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

/// Pipeline counters shared by ingestion, invoicing and the batch runner
pub struct PipelineMetrics {
    pub events_ingested: IntCounter,
    pub sub_batches_committed: IntCounter,
    pub ingestion_failures: IntCounter,
    pub validation_rejections: IntCounter,
    pub records_created: IntCounter,
    pub duplicate_periods: IntCounter,
    pub publish_failures: IntCounter,
    /// Batch runs by outcome (`skipped`, `completed`, `locked`)
    pub runs: IntCounterVec,
    pub run_customer_failures: IntCounter,
    pub summary_refreshes: IntCounter,
    pub summary_refresh_failures: IntCounter,
}

impl PipelineMetrics {
    pub fn new() -> prometheus::Result<Self> {
        Ok(Self {
            events_ingested: IntCounter::new(
                "meterflow_events_ingested_total",
                "Usage events durably written",
            )?,
            sub_batches_committed: IntCounter::new(
                "meterflow_sub_batches_committed_total",
                "Sub-batches committed to the event store",
            )?,
            ingestion_failures: IntCounter::new(
                "meterflow_ingestion_failures_total",
                "Ingest calls aborted by a failed sub-batch",
            )?,
            validation_rejections: IntCounter::new(
                "meterflow_validation_rejections_total",
                "Ingest calls rejected by event validation",
            )?,
            records_created: IntCounter::new(
                "meterflow_billing_records_created_total",
                "Billing records created",
            )?,
            duplicate_periods: IntCounter::new(
                "meterflow_duplicate_periods_total",
                "Calculations rejected because the period was already billed",
            )?,
            publish_failures: IntCounter::new(
                "meterflow_publish_failures_total",
                "Billing notifications that could not be delivered",
            )?,
            runs: IntCounterVec::new(
                Opts::new("meterflow_batch_runs_total", "Scheduled batch runs by outcome"),
                &["outcome"],
            )?,
            run_customer_failures: IntCounter::new(
                "meterflow_batch_run_customer_failures_total",
                "Per-customer failures during scheduled runs",
            )?,
            summary_refreshes: IntCounter::new(
                "meterflow_summary_refreshes_total",
                "Successful summary view refreshes",
            )?,
            summary_refresh_failures: IntCounter::new(
                "meterflow_summary_refresh_failures_total",
                "Failed summary view refreshes",
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.events_ingested.clone()))?;
        registry.register(Box::new(self.sub_batches_committed.clone()))?;
        registry.register(Box::new(self.ingestion_failures.clone()))?;
        registry.register(Box::new(self.validation_rejections.clone()))?;
        registry.register(Box::new(self.records_created.clone()))?;
        registry.register(Box::new(self.duplicate_periods.clone()))?;
        registry.register(Box::new(self.publish_failures.clone()))?;
        registry.register(Box::new(self.runs.clone()))?;
        registry.register(Box::new(self.run_customer_failures.clone()))?;
        registry.register(Box::new(self.summary_refreshes.clone()))?;
        registry.register(Box::new(self.summary_refresh_failures.clone()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_once() {
        let registry = Registry::new();
        let metrics = PipelineMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        assert!(metrics.register(&registry).is_err());

        metrics.runs.with_label_values(&["skipped"]).inc();
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "meterflow_batch_runs_total"));
    }
}
