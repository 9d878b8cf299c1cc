//! Meterflow Service Binary
//!
//! Consumes usage batches from JetStream, runs month-end billing and keeps the
//! summary views fresh.

mod config;
mod nats;

use std::sync::Arc;

use anyhow::Result;
use meterflow_billing::{
    AggregationEngine, BatchIngestor, BatchRunner, BillingService, InMemoryStore, IngestWorkers,
    InvoiceGenerator, LocalRunLock, NatsBillingPublisher, PipelineMetrics, RedisClient,
    RedisRunLock, RunLock, SummaryRefresher,
};
use meterflow_common::{Customer, VERSION};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::ServiceConfig;
use crate::nats::{ensure_streams, JetStreamUsageSource};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Meterflow service v{}", VERSION);

    let config = ServiceConfig::load()?;
    info!("Loaded configuration: {:?}", config);

    let registry = prometheus::Registry::new();
    let metrics = Arc::new(PipelineMetrics::new()?);
    metrics.register(&registry)?;

    // Stores
    let store = Arc::new(InMemoryStore::new());
    if let Some(path) = &config.customers_file {
        let customers: Vec<Customer> = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        info!(path = %path, customers = customers.len(), "Loaded customer directory");
        for customer in customers {
            store.upsert_customer(customer);
        }
    }

    // Bus
    let client = async_nats::connect(&config.nats.url).await?;
    let jetstream = async_nats::jetstream::new(client);
    ensure_streams(
        &jetstream,
        &config.nats.usage_stream,
        &config.nats.billing_stream,
    )
    .await?;
    info!(url = %config.nats.url, "Connected to NATS");

    // Run lock
    let lock: Arc<dyn RunLock> = match &config.redis_url {
        Some(url) => match RedisClient::connect(url).await {
            Ok(redis) => Arc::new(RedisRunLock::new(redis)),
            Err(e) => {
                warn!(error = %e, "Redis unavailable, using in-process run lock");
                Arc::new(LocalRunLock::new())
            }
        },
        None => Arc::new(LocalRunLock::new()),
    };

    // Billing
    let store_timeout = config.store_timeout();
    let billing = Arc::new(BillingService::new(
        AggregationEngine::new(store.clone(), store.clone(), store.clone(), store_timeout),
        InvoiceGenerator::new(
            store.clone(),
            Arc::new(NatsBillingPublisher::new(jetstream.clone())),
            config.invoice(),
            metrics.clone(),
        ),
        store.clone(),
        store.clone(),
        store_timeout,
    ));

    let runner = Arc::new(BatchRunner::new(
        billing.clone(),
        store.clone(),
        lock,
        config.runner(),
        metrics.clone(),
    ));
    let refresher = Arc::new(SummaryRefresher::new(
        store.clone(),
        store_timeout,
        metrics.clone(),
    ));

    // Ingestion
    let ingestor = Arc::new(BatchIngestor::new(
        store.clone(),
        config.ingestor(),
        metrics.clone(),
    ));
    let source = Arc::new(
        JetStreamUsageSource::new(
            jetstream.clone(),
            &config.nats.usage_stream,
            &config.nats.consumer_name,
            config.fetch_max_wait(),
        )
        .await?,
    );

    let cancel = CancellationToken::new();
    let mut tasks = IngestWorkers::new(source, ingestor, config.workers()).spawn(cancel.clone());
    tasks.push(refresher.spawn(config.refresh_interval(), cancel.clone()));
    tasks.push(runner.spawn(config.schedule_interval(), cancel.clone()));

    info!("Meterflow service started");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Task ended abnormally");
        }
    }

    info!(
        metric_families = registry.gather().len(),
        "Meterflow service stopped"
    );
    Ok(())
}
