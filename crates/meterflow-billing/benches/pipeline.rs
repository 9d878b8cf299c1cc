//! Meterflow pipeline benchmarks
//!
//! - Period aggregation over stored usage
//! - Sub-batch ingestion into the in-memory store
//! - Invoice number generation

use std::sync::Arc;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use meterflow_billing::aggregation::summarize;
use meterflow_billing::{
    BatchIngestor, InMemoryStore, IngestorConfig, InvoiceNumberSequence, PipelineMetrics,
};
use meterflow_common::{Customer, StoredUsageRecord, UsageEvent};
use rust_decimal_macros::dec;
use uuid::Uuid;

const RESOURCES: [&str; 4] = ["cpu", "memory", "storage", "api_calls"];

fn usage_events(n: usize) -> Vec<UsageEvent> {
    let customer = Uuid::new_v4();
    (0..n)
        .map(|i| {
            UsageEvent::new(customer, RESOURCES[i % RESOURCES.len()], dec!(1.5), "unit")
                .with_unit_price(dec!(0.0042))
        })
        .collect()
}

fn bench_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregation");

    for size in [100usize, 1_000, 10_000].iter() {
        let records: Vec<StoredUsageRecord> = usage_events(*size)
            .into_iter()
            .enumerate()
            .map(|(i, event)| StoredUsageRecord {
                id: i as u64,
                event,
                ingested_at: Utc::now(),
            })
            .collect();

        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("summarize", size), &records, |b, records| {
            b.iter(|| summarize(black_box(records)))
        });
    }

    group.finish();
}

fn bench_ingestion(c: &mut Criterion) {
    let mut group = c.benchmark_group("ingestion");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let metrics = Arc::new(PipelineMetrics::new().unwrap());

    for size in [50usize, 500, 5_000].iter() {
        let events = usage_events(*size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::new("sub_batches", size), &events, |b, events| {
            b.iter(|| {
                let ingestor = BatchIngestor::new(
                    Arc::new(InMemoryStore::new()),
                    IngestorConfig::default(),
                    metrics.clone(),
                );
                runtime.block_on(ingestor.ingest(black_box(events)))
            })
        });
    }

    group.finish();
}

fn bench_invoice_numbers(c: &mut Criterion) {
    let sequence = InvoiceNumberSequence::new();
    let customer = Customer::active("Bench", "bench@example.test", "pro");

    c.bench_function("invoice_number", |b| b.iter(|| sequence.next(black_box(&customer))));
}

criterion_group!(benches, bench_aggregation, bench_ingestion, bench_invoice_numbers);
criterion_main!(benches);
