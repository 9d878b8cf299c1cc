//! # Meterflow Billing
//!
//! Usage-to-billing pipeline.
//!
//! ## Flow
//!
//! ```text
//! usage bus -> ingestor -> event store -> aggregation -> invoice -> record store
//!                                                           |
//!                                                           +-> billing-events
//! ```
//!
//! ## Components
//!
//! - **metering**: batch ingestion and the inbound worker pool
//! - **aggregation**: exact per-resource cost for a customer and period
//! - **invoice**: idempotent record creation and billing notifications
//! - **scheduler**: month-end runs over all active customers
//! - **cache**/**refresh**: bounded-staleness reads and summary view refresh

pub mod aggregation;
pub mod cache;
pub mod invoice;
pub mod lock;
pub mod metering;
pub mod metrics;
pub mod publisher;
pub mod redis_client;
pub mod refresh;
pub mod scheduler;
pub mod service;
pub mod store;

#[cfg(test)]
mod testing;

pub use aggregation::{AggregationEngine, AggregationResult, ResourceCost};
pub use cache::{CacheBackend, CacheConfig, CachedQueries, InMemoryCache, RedisCache};
pub use invoice::{InvoiceConfig, InvoiceGenerator, InvoiceNumberSequence};
pub use lock::{LocalRunLock, LockToken, RedisRunLock, RunLock};
pub use metering::{
    BatchDisposition, BatchIngestor, DeliveredBatch, IngestReport, IngestWorkers, IngestorConfig,
    UsageBatchSource, WorkerConfig,
};
pub use metrics::PipelineMetrics;
pub use publisher::{BillingEventPublisher, InMemoryPublisher, NatsBillingPublisher};
pub use redis_client::RedisClient;
pub use refresh::SummaryRefresher;
pub use scheduler::{BatchRunner, CustomerFailure, RunOutcome, RunSummary, RunnerConfig};
pub use service::BillingService;
pub use store::{CustomerDirectory, EventStore, InMemoryStore, RecordStore, SummaryViews};
