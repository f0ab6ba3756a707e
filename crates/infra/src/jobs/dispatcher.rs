//! Queue consumer: one delivery at a time, exactly one settlement per delivery.
//!
//! Ack discipline:
//! - after the pipeline succeeded (outbox published),
//! - after a retry copy or dead-letter record was published,
//! - after a drop decision (malformed envelope, unresolvable conflict).
//!
//! If the retry/dead-letter outcome cannot be recorded the delivery is released back to
//! the broker unacknowledged and the error surfaces to the worker loop, which backs off.
//! A failed ack is retried a bounded number of times; after that the delivery is released
//! too, so the prefetch slot never stays occupied.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{Instrument, debug, info_span, warn};

use docflow_events::{BrokerError, Delivery, JobEnvelope, QueueBroker, QueueTopology};
use docflow_observability::{QueueEvent, QueueEventSink, QueueEventType};

use crate::collaborators::{Classifier, PostingValidator, ReviewRouter};
use crate::config::PipelineConfig;
use crate::document_store::{DocumentStore, PersistError};
use crate::pipeline::{ClassificationPipeline, PipelineError};
use crate::router::DownstreamRouter;

use super::scheduler::{RetryScheduler, ScheduleError};
use super::types::Disposition;

/// Prefetch per worker instance. Strictly sequential processing.
pub const PREFETCH: u16 = 1;

/// Ack attempts per delivery before it is released for redelivery.
pub const ACK_ATTEMPTS: u32 = 3;

const ACK_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The retry or dead-letter outcome could not be recorded; the delivery was released.
    #[error("failed to record job outcome: {0}")]
    Record(#[from] ScheduleError),

    /// The outcome was recorded but every ack attempt failed; the delivery was released.
    #[error("failed to acknowledge delivery: {0}")]
    Ack(BrokerError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Everything a classification dispatcher talks to.
pub struct Components {
    pub broker: Arc<dyn QueueBroker>,
    pub store: Arc<dyn DocumentStore>,
    pub classifier: Arc<dyn Classifier>,
    pub validator: Arc<dyn PostingValidator>,
    pub reviews: Arc<dyn ReviewRouter>,
    pub events: Arc<dyn QueueEventSink>,
}

pub struct Dispatcher {
    service: String,
    topology: QueueTopology,
    downstream: Vec<QueueTopology>,
    config: PipelineConfig,
    broker: Arc<dyn QueueBroker>,
    pipeline: ClassificationPipeline,
    scheduler: RetryScheduler,
    events: Arc<dyn QueueEventSink>,
}

impl Dispatcher {
    pub fn new(
        config: PipelineConfig,
        broker: Arc<dyn QueueBroker>,
        pipeline: ClassificationPipeline,
        scheduler: RetryScheduler,
        events: Arc<dyn QueueEventSink>,
    ) -> Self {
        Self {
            service: config.service_name.clone(),
            topology: config.topology(),
            downstream: vec![config.ledger_topology()],
            config,
            broker,
            pipeline,
            scheduler,
            events,
        }
    }

    /// Wire pipeline, router and retry scheduler from `config`.
    pub fn assemble(config: PipelineConfig, components: Components) -> Self {
        let Components {
            broker,
            store,
            classifier,
            validator,
            reviews,
            events,
        } = components;

        let router = DownstreamRouter::new(
            config.routing.clone(),
            config.ledger_topology().primary(),
            validator,
            reviews,
            store.clone(),
        );
        let pipeline = ClassificationPipeline::new(
            config.service_name.clone(),
            config.classify_timeout,
            classifier,
            store.clone(),
            router,
            broker.clone(),
            events.clone(),
        );
        let scheduler = RetryScheduler::new(
            config.service_name.clone(),
            config.retry_policy(),
            config.topology(),
            store,
            broker.clone(),
            events.clone(),
        );

        Self::new(config, broker, pipeline, scheduler, events)
    }

    pub fn queue(&self) -> String {
        self.topology.primary()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Declare this stage's queues and the downstream stages' queues, then set prefetch.
    pub async fn declare_topology(&self) -> Result<(), DispatchError> {
        for topology in std::iter::once(&self.topology).chain(self.downstream.iter()) {
            for declaration in topology.declarations() {
                self.broker.declare(&declaration).await?;
            }
        }
        self.broker.set_prefetch(PREFETCH).await?;
        Ok(())
    }

    /// Wait for one delivery and handle it. `Ok(None)` when the queue stayed empty.
    pub async fn poll_once(&self) -> Result<Option<Disposition>, DispatchError> {
        let delivery = self
            .broker
            .receive(&self.topology.primary(), self.config.receive_wait)
            .await?;

        match delivery {
            Some(delivery) => self.handle(&delivery).await.map(Some),
            None => Ok(None),
        }
    }

    /// Process one delivery and settle it exactly once.
    pub async fn handle(&self, delivery: &Delivery) -> Result<Disposition, DispatchError> {
        let job = match JobEnvelope::parse(delivery.body()) {
            Ok(job) => job,
            Err(err) => {
                warn!(
                    queue = %delivery.queue(),
                    delivery_tag = %delivery.tag(),
                    error = %err,
                    "data integrity: dropping malformed job message"
                );
                self.record(
                    QueueEventType::Dropped,
                    json!({ "reason": "malformed", "error": err.to_string() }),
                );
                self.ack(delivery).await?;
                return Ok(Disposition::Drop);
            }
        };

        let span = info_span!(
            "classification_job",
            document_id = %job.document_id(),
            trace_id = %job.trace_id(),
            correlation_id = %job.correlation_id(),
            attempt = job.attempts(),
            redelivered = delivery.redelivered(),
        );

        self.process(delivery, &job).instrument(span).await
    }

    async fn process(&self, delivery: &Delivery, job: &JobEnvelope) -> Result<Disposition, DispatchError> {
        self.record(QueueEventType::Started, job_metadata(job));

        let outcome = self.pipeline.run(job).await;

        let disposition = match outcome {
            Ok(outcome) => {
                debug!(
                    review = ?outcome.review,
                    held = outcome.held,
                    forwarded = outcome.forwarded_to.len(),
                    "job succeeded"
                );
                let mut metadata = job_metadata(job);
                metadata["kind"] = json!(outcome.committed.classification.kind.as_str());
                metadata["confidence"] = json!(outcome.committed.classification.confidence);
                self.record(QueueEventType::Succeeded, metadata);
                Disposition::Success
            }
            Err(PipelineError::Persist(PersistError::Conflict(reason))) => {
                warn!(reason = %reason, "dropping job: document already carries a different result");
                let mut metadata = job_metadata(job);
                metadata["reason"] = json!("conflict");
                metadata["error"] = json!(reason);
                self.record(QueueEventType::Dropped, metadata);
                Disposition::Drop
            }
            Err(err) => {
                let mut metadata = job_metadata(job);
                metadata["stage"] = json!(err.stage().as_str());
                metadata["error"] = json!(err.to_string());
                self.record(QueueEventType::Failed, metadata);

                let recorded = match &err {
                    PipelineError::Persist(PersistError::NotFound(_))
                        if self.config.dead_letter_missing_documents =>
                    {
                        self.scheduler
                            .dead_letter(job, job.next_attempt(), &err.to_string())
                            .await
                            .map(|()| Disposition::DeadLetter)
                    }
                    _ => {
                        self.scheduler
                            .handle_failure(job, err.stage(), &err.to_string())
                            .await
                    }
                };

                match recorded {
                    Ok(disposition) => disposition,
                    Err(record_err) => {
                        warn!(error = %record_err, "could not record outcome; releasing delivery");
                        if let Err(release_err) = self.broker.release(delivery).await {
                            warn!(error = %release_err, "failed to release delivery");
                        }
                        return Err(DispatchError::Record(record_err));
                    }
                }
            }
        };

        self.ack(delivery).await?;
        Ok(disposition)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), DispatchError> {
        let mut attempt = 1;
        loop {
            match self.broker.ack(delivery).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < ACK_ATTEMPTS => {
                    warn!(error = %err, attempt, "ack failed; retrying");
                    attempt += 1;
                    tokio::time::sleep(ACK_RETRY_DELAY).await;
                }
                Err(err) => {
                    warn!(error = %err, attempt, "ack failed; releasing delivery for redelivery");
                    if let Err(release_err) = self.broker.release(delivery).await {
                        warn!(error = %release_err, "failed to release delivery");
                    }
                    return Err(DispatchError::Ack(err));
                }
            }
        }
    }

    fn record(&self, event_type: QueueEventType, metadata: serde_json::Value) {
        self.events.record(QueueEvent::new(
            self.service.clone(),
            self.topology.primary(),
            event_type,
            metadata,
        ));
    }
}

fn job_metadata(job: &JobEnvelope) -> serde_json::Value {
    json!({
        "documentId": job.document_id().as_str(),
        "traceId": job.trace_id().as_str(),
        "correlationId": job.correlation_id().as_str(),
        "attempt": job.attempts(),
    })
}
