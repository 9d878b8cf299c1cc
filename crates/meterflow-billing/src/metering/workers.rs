//! Ingestion worker pool
//!
//! A fixed number of workers pull usage batches from the inbound bus and hand
//! them to the [`BatchIngestor`]. The bus delivers at least once; each batch is
//! settled according to how ingestion ended:
//! - committed: acknowledged
//! - rejected by validation (or any other non-retryable failure): routed to the
//!   dead-letter destination, never redelivered
//! - transient store failure or timeout: negatively acknowledged for redelivery

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meterflow_common::{MeterflowError, Result, UsageEvent, DEFAULT_INGEST_WORKERS};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::BatchIngestor;

/// A batch received from the bus, with the source's delivery handle
#[derive(Debug)]
pub struct DeliveredBatch<T> {
    /// Source-specific identifier used in logs
    pub delivery_id: String,
    pub events: Vec<UsageEvent>,
    pub token: T,
}

/// How a delivered batch is settled with its source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchDisposition {
    Ack,
    /// Redeliver later
    Retry,
    /// Route to the dead-letter destination
    Reject { reason: String },
}

impl BatchDisposition {
    /// Disposition for an ingestion outcome
    pub fn for_outcome<T>(outcome: &Result<T>) -> Self {
        match outcome {
            Ok(_) => BatchDisposition::Ack,
            Err(err) if err.is_retryable() => BatchDisposition::Retry,
            Err(err) => BatchDisposition::Reject {
                reason: err.to_string(),
            },
        }
    }
}

/// Inbound source of usage batches
#[async_trait]
pub trait UsageBatchSource: Send + Sync {
    type Token: Send;

    /// Wait for the next batch; `None` when nothing arrived within the source's poll window
    async fn next_batch(&self) -> Result<Option<DeliveredBatch<Self::Token>>>;

    async fn settle(
        &self,
        batch: DeliveredBatch<Self::Token>,
        disposition: BatchDisposition,
    ) -> Result<()>;
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Pause after a source error before polling again
    pub error_backoff: Duration,
    /// Pause after an empty poll
    pub idle_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_INGEST_WORKERS,
            error_backoff: Duration::from_secs(1),
            idle_backoff: Duration::from_millis(100),
        }
    }
}

/// Fixed-size pool of ingestion workers
pub struct IngestWorkers<S> {
    source: Arc<S>,
    ingestor: Arc<BatchIngestor>,
    config: WorkerConfig,
}

impl<S> IngestWorkers<S>
where
    S: UsageBatchSource + 'static,
{
    pub fn new(source: Arc<S>, ingestor: Arc<BatchIngestor>, config: WorkerConfig) -> Self {
        Self {
            source,
            ingestor,
            config,
        }
    }

    /// Spawn the workers; each stops when `cancel` fires
    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let count = self.config.workers.max(1);
        info!(workers = count, "Starting ingestion workers");

        let pool = Arc::new(self);
        (0..count)
            .map(|worker| {
                let pool = pool.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { pool.run_worker(worker, cancel).await })
            })
            .collect()
    }

    async fn run_worker(&self, worker: usize, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker, "Ingestion worker stopping");
                    break;
                }
                next = self.source.next_batch() => match next {
                    Ok(Some(batch)) => self.handle(worker, batch).await,
                    Ok(None) => tokio::time::sleep(self.config.idle_backoff).await,
                    Err(e) => {
                        error!(worker, error = %e, "Failed to receive usage batch");
                        tokio::time::sleep(self.config.error_backoff).await;
                    }
                }
            }
        }
    }

    /// Ingest one delivered batch and settle it with the source
    pub async fn handle(&self, worker: usize, batch: DeliveredBatch<S::Token>) {
        let delivery_id = batch.delivery_id.clone();
        let outcome = self.ingestor.ingest(&batch.events).await;
        let disposition = BatchDisposition::for_outcome(&outcome);

        match &outcome {
            Ok(report) => debug!(worker, %delivery_id, events = report.events, "Batch committed"),
            Err(e) => warn!(worker, %delivery_id, error = %e, ?disposition, "Batch not committed"),
        }

        if let Err(e) = self.source.settle(batch, disposition).await {
            error!(worker, %delivery_id, error = %e, "Failed to settle usage batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering::IngestorConfig;
    use crate::metrics::PipelineMetrics;
    use crate::store::InMemoryStore;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct ChannelSource {
        rx: tokio::sync::Mutex<mpsc::Receiver<Vec<UsageEvent>>>,
        settled: Mutex<Vec<(String, BatchDisposition)>>,
        done: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl UsageBatchSource for ChannelSource {
        type Token = ();

        async fn next_batch(&self) -> Result<Option<DeliveredBatch<()>>> {
            let mut rx = self.rx.lock().await;
            Ok(rx.recv().await.map(|events| DeliveredBatch {
                delivery_id: format!("batch-{}", events.len()),
                events,
                token: (),
            }))
        }

        async fn settle(&self, batch: DeliveredBatch<()>, disposition: BatchDisposition) -> Result<()> {
            self.settled.lock().push((batch.delivery_id, disposition));
            let _ = self.done.send(());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_workers_ack_and_reject() {
        let (tx, rx) = mpsc::channel(8);
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let source = Arc::new(ChannelSource {
            rx: tokio::sync::Mutex::new(rx),
            settled: Mutex::new(Vec::new()),
            done: done_tx,
        });
        let store = Arc::new(InMemoryStore::new());
        let ingestor = Arc::new(BatchIngestor::new(
            store.clone(),
            IngestorConfig::default(),
            Arc::new(PipelineMetrics::new().unwrap()),
        ));

        let cancel = CancellationToken::new();
        let handles = IngestWorkers::new(source.clone(), ingestor, WorkerConfig::default())
            .spawn(cancel.clone());
        assert_eq!(handles.len(), 3);

        let customer = Uuid::new_v4();
        let good = vec![UsageEvent::new(customer, "cpu", dec!(1), "hour"); 2];
        let bad = vec![UsageEvent::new(customer, "", dec!(1), "hour")];
        tx.send(good).await.unwrap();
        tx.send(bad).await.unwrap();

        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();
        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        let settled = source.settled.lock().clone();
        assert!(settled.contains(&("batch-2".to_string(), BatchDisposition::Ack)));
        assert!(settled
            .iter()
            .any(|(id, d)| id == "batch-1" && matches!(d, BatchDisposition::Reject { .. })));
        assert_eq!(store.usage_count(), 2);
    }

    #[test]
    fn test_disposition_for_outcome() {
        let unavailable: Result<()> = Err(MeterflowError::Store(
            meterflow_common::StoreError::Unavailable("down".into()),
        ));
        assert_eq!(BatchDisposition::for_outcome(&unavailable), BatchDisposition::Retry);

        let invalid: Result<()> = Err(MeterflowError::Validation("bad".into()));
        assert!(matches!(
            BatchDisposition::for_outcome(&invalid),
            BatchDisposition::Reject { .. }
        ));

        assert_eq!(BatchDisposition::for_outcome(&Ok(())), BatchDisposition::Ack);
    }
}
