//! Usage metering
//!
//! - Batch ingestion of usage events into the event store
//! - Worker pool pulling batches from the inbound bus

pub mod ingestor;
pub mod workers;

pub use ingestor::{BatchIngestor, IngestReport, IngestorConfig};
pub use workers::{
    BatchDisposition, DeliveredBatch, IngestWorkers, UsageBatchSource, WorkerConfig,
};
