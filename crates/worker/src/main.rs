use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use docflow_infra::config::PipelineConfig;
use docflow_infra::document_store::PostgresDocumentStore;
use docflow_infra::event_bus::RedisQueueBroker;
use docflow_infra::external::{HttpClassifier, HttpPostingValidator, HttpReviewRouter};
use docflow_infra::jobs::{Components, Dispatcher, Worker, WorkerConfig};
use docflow_observability::TracingEventSink;

fn required(key: &str) -> anyhow::Result<String> {
    std::env::var(key).with_context(|| format!("{key} must be set"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    docflow_observability::init();

    let config = PipelineConfig::from_env().context("invalid DOCFLOW_* configuration")?;

    let database_url = required("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = PostgresDocumentStore::new(pool);
    store.ensure_schema().await.context("failed to ensure schema")?;

    let redis_url = std::env::var("REDIS_URL").unwrap_or_else(|_| {
        tracing::warn!("REDIS_URL not set; using redis://127.0.0.1:6379");
        "redis://127.0.0.1:6379".to_string()
    });
    let consumer = std::env::var("DOCFLOW_CONSUMER_NAME")
        .unwrap_or_else(|_| format!("{}-{}", config.service_name, std::process::id()));
    let broker = RedisQueueBroker::new(&redis_url, consumer.clone())?;

    let classifier = HttpClassifier::with_timeout(&required("CLASSIFIER_URL")?, config.classify_timeout)?;
    let validator = HttpPostingValidator::new(&required("POSTING_VALIDATOR_URL")?)?;
    let reviews = HttpReviewRouter::new(&required("REVIEW_QUEUE_URL")?)?;

    let worker_config = WorkerConfig::default()
        .with_name(consumer)
        .with_error_backoff(config.error_backoff);

    let dispatcher = Dispatcher::assemble(
        config,
        Components {
            broker: Arc::new(broker),
            store: Arc::new(store),
            classifier: Arc::new(classifier),
            validator: Arc::new(validator),
            reviews: Arc::new(reviews),
            events: Arc::new(TracingEventSink),
        },
    );

    tracing::info!(queue = %dispatcher.queue(), "starting classification worker");
    let handle = Worker::new(Arc::new(dispatcher), worker_config).start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown requested; finishing in-flight job");
    let stats = handle.stats();
    handle.shutdown().await;
    tracing::info!(
        deliveries = stats.deliveries,
        succeeded = stats.succeeded,
        retried = stats.retried,
        dead_lettered = stats.dead_lettered,
        dropped = stats.dropped,
        "worker stopped"
    );

    Ok(())
}
