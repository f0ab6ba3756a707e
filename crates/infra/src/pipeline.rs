//! The classification stage: classify, persist, route, publish.
//!
//! [`ClassificationPipeline::run`] handles one well-formed job end to end and reports
//! either the committed result or a typed [`PipelineError`]. It never settles the
//! delivery and never schedules retries; that is the dispatcher's job.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::instrument;

use docflow_events::{BrokerError, EnvelopeError, JobEnvelope, QueueBroker};
use docflow_observability::{QueueEvent, QueueEventSink, QueueEventType};

use crate::collaborators::{ClassifyError, Classifier, CollaboratorError, ReviewPriority};
use crate::document_store::{CommittedClassification, DocumentStore, PersistError};
use crate::jobs::FailureStage;
use crate::router::{DownstreamRouter, RouteError};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Persist(#[from] PersistError),

    #[error("posting validation failed: {0}")]
    Validation(CollaboratorError),

    #[error("failed to publish downstream job: {0}")]
    Publish(BrokerError),

    #[error(transparent)]
    Encode(EnvelopeError),
}

impl PipelineError {
    pub fn stage(&self) -> FailureStage {
        match self {
            PipelineError::Classify(_) => FailureStage::Classify,
            PipelineError::Persist(_) => FailureStage::Persist,
            PipelineError::Validation(_) => FailureStage::Route,
            PipelineError::Publish(_) | PipelineError::Encode(_) => FailureStage::Publish,
        }
    }
}

impl From<RouteError> for PipelineError {
    fn from(err: RouteError) -> Self {
        match err {
            RouteError::Validator(e) => PipelineError::Validation(e),
            RouteError::Encode(e) => PipelineError::Encode(e),
        }
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineOutcome {
    pub committed: CommittedClassification,
    pub review: Option<ReviewPriority>,
    pub held: bool,
    /// Downstream queues a job was published to.
    pub forwarded_to: Vec<String>,
}

pub struct ClassificationPipeline {
    service: String,
    classify_timeout: Duration,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn DocumentStore>,
    router: DownstreamRouter,
    broker: Arc<dyn QueueBroker>,
    events: Arc<dyn QueueEventSink>,
}

impl ClassificationPipeline {
    pub fn new(
        service: impl Into<String>,
        classify_timeout: Duration,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn DocumentStore>,
        router: DownstreamRouter,
        broker: Arc<dyn QueueBroker>,
        events: Arc<dyn QueueEventSink>,
    ) -> Self {
        Self {
            service: service.into(),
            classify_timeout,
            classifier,
            store,
            router,
            broker,
            events,
        }
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    #[instrument(
        skip(self, job),
        fields(
            document_id = %job.document_id(),
            trace_id = %job.trace_id(),
            attempt = job.attempts()
        ),
        err
    )]
    pub async fn run(&self, job: &JobEnvelope) -> Result<PipelineOutcome, PipelineError> {
        let result = match tokio::time::timeout(
            self.classify_timeout,
            self.classifier.classify(job.payload()),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(ClassifyError::Timeout(self.classify_timeout).into()),
        };
        result
            .validate()
            .map_err(|e| ClassifyError::InvalidResult(e.to_string()))?;

        let committed = self
            .store
            .apply_classification(job.document_id(), &result)
            .await?;

        tracing::debug!(
            kind = %committed.classification.kind,
            confidence = committed.classification.confidence,
            outcome = ?committed.outcome,
            "classification committed"
        );

        let plan = self.router.plan(job, &committed).await?;
        self.router.apply(&committed, &plan).await;

        let mut forwarded_to = Vec::with_capacity(plan.outbox.len());
        for message in &plan.outbox {
            let body = message.envelope.to_bytes().map_err(PipelineError::Encode)?;
            self.broker
                .publish(&message.queue, body)
                .await
                .map_err(PipelineError::Publish)?;

            self.events.record(QueueEvent::new(
                self.service.clone(),
                message.queue.clone(),
                QueueEventType::Enqueued,
                json!({
                    "documentId": message.envelope.document_id().as_str(),
                    "traceId": message.envelope.trace_id().as_str(),
                    "correlationId": message.envelope.correlation_id().as_str(),
                }),
            ));
            forwarded_to.push(message.queue.clone());
        }

        Ok(PipelineOutcome {
            committed,
            review: plan.review,
            held: plan.hold.is_some(),
            forwarded_to,
        })
    }
}
