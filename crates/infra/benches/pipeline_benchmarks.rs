use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use docflow_core::{Classification, Document, DocumentId, DocumentKind, DocumentStatus, TenantId};
use docflow_events::{InMemoryBroker, JobEnvelope, QueueBroker};
use docflow_infra::collaborators::{InMemoryReviewQueue, ScriptedClassifier, StaticPostingValidator};
use docflow_infra::config::{PipelineConfig, RoutingPolicy};
use docflow_infra::document_store::{DocumentStore, InMemoryDocumentStore};
use docflow_infra::jobs::{Components, Dispatcher};
use docflow_infra::router::review_priority;
use docflow_observability::InMemoryEventSink;
use serde_json::{Map, json};

fn invoice(confidence: f64, field_count: usize) -> Classification {
    let mut fields = Map::new();
    for i in 0..field_count {
        fields.insert(format!("line_{i}"), json!(format!("{}.00", i * 10)));
    }
    Classification::new(DocumentKind::Invoice, fields, confidence)
}

fn bench_envelope_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_codec");

    for payload_len in [256usize, 4 * 1024, 64 * 1024] {
        let job = JobEnvelope::new(DocumentId::parse("doc-bench").unwrap(), "x".repeat(payload_len));
        let bytes = job.to_bytes().unwrap();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("parse", payload_len), &bytes, |b, bytes| {
            b.iter(|| JobEnvelope::parse(black_box(bytes)).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("retry_copy", payload_len), &job, |b, job| {
            b.iter(|| {
                black_box(job)
                    .for_retry("classifier failed", chrono::Utc::now())
                    .to_bytes()
                    .unwrap()
            });
        });
    }

    group.finish();
}

fn bench_routing_decision(c: &mut Criterion) {
    let policy = RoutingPolicy::default();

    c.bench_function("review_priority", |b| {
        b.iter(|| {
            for step in 0..100u32 {
                let confidence = f64::from(step) / 100.0;
                black_box(review_priority(
                    &policy,
                    black_box(confidence),
                    Some(f64::from(step)),
                    DocumentStatus::Classified,
                ));
            }
        });
    });
}

fn bench_persistence(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
    let mut group = c.benchmark_group("apply_classification");

    for field_count in [4usize, 64] {
        let store = InMemoryDocumentStore::new();
        let id = DocumentId::parse("doc-bench").unwrap();
        store.insert(Document::extracted(id.clone(), TenantId::new(), Some(90.0)));
        let result = invoice(0.95, field_count);

        group.bench_with_input(BenchmarkId::from_parameter(field_count), &result, |b, result| {
            b.iter(|| rt.block_on(store.apply_classification(&id, result)).unwrap());
        });
    }

    group.finish();
}

fn bench_end_to_end(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap();

    let config = PipelineConfig {
        receive_wait: Duration::from_millis(50),
        ..PipelineConfig::default()
    };
    let broker = Arc::new(InMemoryBroker::new());
    let store = Arc::new(InMemoryDocumentStore::new());
    let dispatcher = Dispatcher::assemble(
        config.clone(),
        Components {
            broker: broker.clone(),
            store: store.clone(),
            classifier: Arc::new(ScriptedClassifier::always(invoice(0.95, 8))),
            validator: Arc::new(StaticPostingValidator::valid()),
            reviews: Arc::new(InMemoryReviewQueue::new()),
            events: Arc::new(InMemoryEventSink::new()),
        },
    );
    rt.block_on(dispatcher.declare_topology()).unwrap();

    let id = DocumentId::parse("doc-bench").unwrap();
    store.insert(Document::extracted(id.clone(), TenantId::new(), Some(90.0)));
    let body = JobEnvelope::new(id, "INVOICE").to_bytes().unwrap();
    let primary = config.topology().primary();
    let ledger = config.ledger_topology().primary();

    c.bench_function("dispatch_valid_invoice", |b| {
        b.iter(|| {
            rt.block_on(async {
                broker.publish(&primary, body.clone()).await.unwrap();
                let disposition = dispatcher.poll_once().await.unwrap();
                // Keep the ledger queue from growing across iterations.
                let forwarded = broker.receive(&ledger, Duration::ZERO).await.unwrap();
                if let Some(delivery) = forwarded {
                    broker.ack(&delivery).await.unwrap();
                }
                black_box(disposition)
            })
        });
    });
}

criterion_group!(
    benches,
    bench_envelope_codec,
    bench_routing_decision,
    bench_persistence,
    bench_end_to_end
);
criterion_main!(benches);
