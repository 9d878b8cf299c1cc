//! Batch ingestion of usage events
//!
//! A batch is validated as a whole before anything is written, then split into
//! fixed-size sub-batches. Each sub-batch is one atomic store write; sub-batches
//! are applied sequentially in input order, so a failure leaves exactly the
//! earlier sub-batches committed.

use std::sync::Arc;
use std::time::Duration;

use meterflow_common::{IngestionError, MeterflowError, Result, UsageEvent, SUB_BATCH_SIZE};
use tracing::{debug, info, instrument, warn};

use crate::metrics::PipelineMetrics;
use crate::store::EventStore;

/// Configuration for the batch ingestor
#[derive(Debug, Clone)]
pub struct IngestorConfig {
    /// Events per atomic sub-batch
    pub sub_batch_size: usize,
    /// Upper bound on a single sub-batch write
    pub store_timeout: Duration,
}

impl Default for IngestorConfig {
    fn default() -> Self {
        Self {
            sub_batch_size: SUB_BATCH_SIZE,
            store_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of a fully committed ingest call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub events: usize,
    pub sub_batches: usize,
    /// Store-assigned ids in input order
    pub record_ids: Vec<u64>,
}

/// Batch ingestor
pub struct BatchIngestor {
    store: Arc<dyn EventStore>,
    config: IngestorConfig,
    metrics: Arc<PipelineMetrics>,
}

impl BatchIngestor {
    pub fn new(
        store: Arc<dyn EventStore>,
        config: IngestorConfig,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    /// Validate and persist a batch of usage events
    ///
    /// Any invalid event rejects the whole batch with `Validation` before the
    /// first write. A failed or timed-out sub-batch aborts the call with
    /// `Ingestion`, reporting how many events earlier sub-batches committed.
    /// Events are not deduplicated by `event_id`.
    #[instrument(skip(self, events), fields(events = events.len()))]
    pub async fn ingest(&self, events: &[UsageEvent]) -> Result<IngestReport> {
        if let Err(err) = validate_all(events) {
            self.metrics.validation_rejections.inc();
            warn!(error = %err, "Rejected usage batch");
            return Err(err);
        }

        let chunk_size = self.config.sub_batch_size.max(1);
        let total_sub_batches = events.len().div_ceil(chunk_size);
        let mut report = IngestReport {
            events: 0,
            sub_batches: 0,
            record_ids: Vec::with_capacity(events.len()),
        };

        for (sub_batch, chunk) in events.chunks(chunk_size).enumerate() {
            let write = self.store.append_batch(chunk);
            let ids = match tokio::time::timeout(self.config.store_timeout, write).await {
                Ok(Ok(ids)) => ids,
                Ok(Err(source)) => {
                    self.metrics.ingestion_failures.inc();
                    warn!(
                        sub_batch,
                        total_sub_batches,
                        committed = report.events,
                        error = %source,
                        "Sub-batch write failed"
                    );
                    return Err(IngestionError::SubBatchFailed {
                        sub_batch,
                        total_sub_batches,
                        committed: report.events,
                        source,
                    }
                    .into());
                }
                Err(_) => {
                    self.metrics.ingestion_failures.inc();
                    warn!(sub_batch, committed = report.events, "Sub-batch write timed out");
                    return Err(IngestionError::SubBatchTimedOut {
                        sub_batch,
                        committed: report.events,
                    }
                    .into());
                }
            };

            debug!(sub_batch, size = chunk.len(), "Committed sub-batch");
            report.events += chunk.len();
            report.sub_batches += 1;
            report.record_ids.extend(ids);
            self.metrics.sub_batches_committed.inc();
            self.metrics.events_ingested.inc_by(chunk.len() as u64);
        }

        info!(
            events = report.events,
            sub_batches = report.sub_batches,
            "Ingested usage batch"
        );
        Ok(report)
    }
}

fn validate_all(events: &[UsageEvent]) -> Result<()> {
    for (index, event) in events.iter().enumerate() {
        event.validate().map_err(|err| match err {
            MeterflowError::Validation(reason) => MeterflowError::Validation(format!(
                "event {} ({}): {}",
                index, event.event_id, reason
            )),
            other => other,
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use meterflow_common::{StoreError, StoredUsageRecord};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    /// Records sub-batch sizes and fails or stalls the configured call
    struct RecordingStore {
        inner: InMemoryStore,
        calls: Mutex<Vec<usize>>,
        fail_on_call: Option<usize>,
        stall_on_call: Option<usize>,
    }

    impl RecordingStore {
        fn new(fail_on_call: Option<usize>) -> Self {
            Self {
                inner: InMemoryStore::new(),
                calls: Mutex::new(Vec::new()),
                fail_on_call,
                stall_on_call: None,
            }
        }

        fn stalling(call: usize) -> Self {
            Self {
                stall_on_call: Some(call),
                ..Self::new(None)
            }
        }
    }

    #[async_trait]
    impl EventStore for RecordingStore {
        async fn append_batch(&self, events: &[UsageEvent]) -> std::result::Result<Vec<u64>, StoreError> {
            let call = {
                let mut calls = self.calls.lock();
                calls.push(events.len());
                calls.len() - 1
            };
            if self.fail_on_call == Some(call) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            if self.stall_on_call == Some(call) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.inner.append_batch(events).await
        }

        async fn usage_in_window(
            &self,
            customer_id: Uuid,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> std::result::Result<Vec<StoredUsageRecord>, StoreError> {
            self.inner.usage_in_window(customer_id, start, end).await
        }
    }

    fn events(n: usize) -> Vec<UsageEvent> {
        let customer = Uuid::new_v4();
        (0..n)
            .map(|i| {
                UsageEvent::new(customer, "api_calls", dec!(1), "request")
                    .with_event_id(format!("evt-{}", i))
            })
            .collect()
    }

    fn ingestor(store: Arc<RecordingStore>) -> BatchIngestor {
        BatchIngestor::new(
            store,
            IngestorConfig::default(),
            Arc::new(PipelineMetrics::new().unwrap()),
        )
    }

    #[tokio::test]
    async fn test_splits_into_ordered_sub_batches() {
        let store = Arc::new(RecordingStore::new(None));
        let report = ingestor(store.clone()).ingest(&events(101)).await.unwrap();

        assert_eq!(report.events, 101);
        assert_eq!(report.sub_batches, 3);
        assert_eq!(*store.calls.lock(), vec![50, 50, 1]);
        assert_eq!(report.record_ids, (1..=101).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_invalid_event_rejects_whole_batch() {
        let store = Arc::new(RecordingStore::new(None));
        let mut batch = events(60);
        batch[55].quantity = dec!(-1);

        let err = ingestor(store.clone()).ingest(&batch).await.unwrap_err();
        assert!(matches!(err, MeterflowError::Validation(ref msg) if msg.contains("evt-55")));
        assert!(store.calls.lock().is_empty());
        assert_eq!(store.inner.usage_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_sub_batch_reports_committed() {
        let store = Arc::new(RecordingStore::new(Some(1)));
        let err = ingestor(store.clone()).ingest(&events(120)).await.unwrap_err();

        match err {
            MeterflowError::Ingestion(ref inner) => {
                assert_eq!(inner.committed(), 50);
                assert!(inner.is_retryable());
            }
            other => panic!("unexpected error: {other}"),
        }
        // The third sub-batch is never attempted
        assert_eq!(*store.calls.lock(), vec![50, 50]);
        assert_eq!(store.inner.usage_count(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_sub_batch_times_out() {
        let store = Arc::new(RecordingStore::stalling(2));
        let err = ingestor(store.clone()).ingest(&events(101)).await.unwrap_err();

        assert!(err.is_retryable());
        match err {
            MeterflowError::Ingestion(IngestionError::SubBatchTimedOut { sub_batch, committed }) => {
                assert_eq!(sub_batch, 2);
                assert_eq!(committed, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.inner.usage_count(), 100);
    }

    #[tokio::test]
    async fn test_unbillable_event_rejected() {
        let store = Arc::new(RecordingStore::new(None));
        let mut batch = events(3);
        batch[1].quantity = rust_decimal::Decimal::MAX;
        batch[1].unit_price = Some(dec!(2));

        let err = ingestor(store.clone()).ingest(&batch).await.unwrap_err();
        assert!(matches!(err, MeterflowError::Validation(ref msg) if msg.contains("evt-1")));
        assert!(store.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let store = Arc::new(RecordingStore::new(None));
        let report = ingestor(store.clone()).ingest(&[]).await.unwrap();
        assert_eq!(report, IngestReport::default());
        assert!(store.calls.lock().is_empty());
    }
}
