//! Retry scheduling: republish with a delay, or dead-letter once the budget is spent.
//!
//! Retry state travels in the envelope (`attempts`, `lastError`); the scheduler keeps
//! nothing in memory between deliveries.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use docflow_events::{
    BrokerError, DeadLetterRecord, EnvelopeError, JobEnvelope, QueueBroker, QueueTopology,
};
use docflow_observability::{QueueEvent, QueueEventSink, QueueEventType};

use crate::document_store::DocumentStore;

use super::types::{Disposition, FailureStage, RetryDecision, RetryPolicy};

/// Failure to durably record a retry or dead-letter outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Encode(#[from] EnvelopeError),

    #[error("failed to publish to {queue}: {source}")]
    Publish { queue: String, source: BrokerError },
}

pub struct RetryScheduler {
    service: String,
    policy: RetryPolicy,
    topology: QueueTopology,
    store: Arc<dyn DocumentStore>,
    broker: Arc<dyn QueueBroker>,
    events: Arc<dyn QueueEventSink>,
}

impl RetryScheduler {
    pub fn new(
        service: impl Into<String>,
        policy: RetryPolicy,
        topology: QueueTopology,
        store: Arc<dyn DocumentStore>,
        broker: Arc<dyn QueueBroker>,
        events: Arc<dyn QueueEventSink>,
    ) -> Self {
        Self {
            service: service.into(),
            policy,
            topology,
            store,
            broker,
            events,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record a failed attempt: retry copy or dead-letter record, per the retry policy.
    ///
    /// Returns once the outcome is durably published; only then may the delivery be acked.
    pub async fn handle_failure(
        &self,
        job: &JobEnvelope,
        stage: FailureStage,
        error: &str,
    ) -> Result<Disposition, ScheduleError> {
        match self.policy.decide(job.attempts()) {
            RetryDecision::Retry { .. } => {
                self.schedule(job, stage, error).await?;
                Ok(Disposition::Retry)
            }
            RetryDecision::DeadLetter { attempts } => {
                self.dead_letter(job, attempts, error).await?;
                Ok(Disposition::DeadLetter)
            }
        }
    }

    /// Mark the document as still processing and republish to the retry queue.
    pub async fn schedule(
        &self,
        job: &JobEnvelope,
        stage: FailureStage,
        error: &str,
    ) -> Result<(), ScheduleError> {
        if let Err(err) = self.store.mark_retrying(job.document_id(), error).await {
            warn!(error = %err, "failed to mark document for retry");
        }

        let retry = job.for_retry(error, Utc::now());
        let queue = self.topology.retry();
        self.publish(&queue, retry.to_bytes()?).await?;

        info!(
            attempt = retry.attempts(),
            max_retries = self.policy.max_retries,
            delay_ms = self.policy.delay.as_millis() as u64,
            stage = stage.as_str(),
            error = %error,
            "job scheduled for retry"
        );
        self.events.record(QueueEvent::new(
            self.service.clone(),
            queue,
            QueueEventType::Retried,
            json!({
                "documentId": job.document_id().as_str(),
                "traceId": job.trace_id().as_str(),
                "correlationId": job.correlation_id().as_str(),
                "attempt": retry.attempts(),
                "stage": stage.as_str(),
                "error": error,
            }),
        ));
        Ok(())
    }

    /// Mark the document `ERROR` and publish a dead-letter record carrying `attempts`.
    pub async fn dead_letter(
        &self,
        job: &JobEnvelope,
        attempts: u32,
        error: &str,
    ) -> Result<(), ScheduleError> {
        let reason = format!("classification failed after {attempts} attempts: {error}");
        if let Err(err) = self.store.mark_error(job.document_id(), &reason).await {
            warn!(error = %err, "failed to mark document as ERROR");
        }

        let record = DeadLetterRecord::new(job.clone(), self.topology.stage(), attempts, error);
        let queue = self.topology.dlq();
        self.publish(&queue, record.to_bytes()?).await?;

        warn!(attempts, error = %error, "job dead-lettered");
        self.events.record(QueueEvent::new(
            self.service.clone(),
            queue,
            QueueEventType::DeadLettered,
            json!({
                "documentId": job.document_id().as_str(),
                "traceId": job.trace_id().as_str(),
                "correlationId": job.correlation_id().as_str(),
                "attempts": attempts,
                "error": error,
            }),
        ));
        Ok(())
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), ScheduleError> {
        self.broker
            .publish(queue, body)
            .await
            .map_err(|source| ScheduleError::Publish {
                queue: queue.to_string(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use docflow_core::{Document, DocumentId, DocumentStatus, TenantId};
    use docflow_events::InMemoryBroker;
    use docflow_observability::InMemoryEventSink;

    use crate::document_store::InMemoryDocumentStore;

    struct Fixture {
        scheduler: RetryScheduler,
        broker: Arc<InMemoryBroker>,
        store: Arc<InMemoryDocumentStore>,
        events: Arc<InMemoryEventSink>,
        topology: QueueTopology,
    }

    async fn fixture(max_retries: u32) -> Fixture {
        let topology = QueueTopology::new("classification", Duration::from_secs(15));
        let broker = Arc::new(InMemoryBroker::new());
        for decl in topology.declarations() {
            broker.declare(&decl).await.unwrap();
        }
        let store = Arc::new(InMemoryDocumentStore::new());
        store.insert(Document::extracted(
            DocumentId::parse("doc-1").unwrap(),
            TenantId::new(),
            Some(80.0),
        ));
        let events = Arc::new(InMemoryEventSink::new());
        let scheduler = RetryScheduler::new(
            "test-worker",
            RetryPolicy::new(max_retries, Duration::from_secs(15)),
            topology.clone(),
            store.clone(),
            broker.clone(),
            events.clone(),
        );
        Fixture {
            scheduler,
            broker,
            store,
            events,
            topology,
        }
    }

    fn job(attempts: u32) -> JobEnvelope {
        let mut job = JobEnvelope::new(DocumentId::parse("doc-1").unwrap(), "text");
        for _ in 0..attempts {
            job = job.for_retry("earlier failure", Utc::now());
        }
        job
    }

    #[tokio::test]
    async fn failure_within_budget_republishes_with_next_attempt() {
        let f = fixture(5).await;
        let original = job(1);

        let disposition = f
            .scheduler
            .handle_failure(&original, FailureStage::Classify, "classifier timed out")
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::Retry);

        // Held in the retry queue until its TTL expires.
        assert_eq!(f.broker.depth(&f.topology.retry()), 1);
        let parked = f.broker.messages(&f.topology.retry());
        let retried = JobEnvelope::parse(&parked[0]).unwrap();
        assert_eq!(retried.attempts(), 2);
        assert_eq!(retried.last_error(), Some("classifier timed out"));
        assert_eq!(retried.trace_id(), original.trace_id());

        assert_eq!(f.events.of_type(QueueEventType::Retried).len(), 1);
        let doc = f.store.document(original.document_id()).unwrap();
        assert_eq!(doc.status, DocumentStatus::Extracted);
    }

    #[tokio::test]
    async fn exhausted_budget_dead_letters_once() {
        let f = fixture(2).await;
        let original = job(2);

        let disposition = f
            .scheduler
            .handle_failure(&original, FailureStage::Classify, "always fails")
            .await
            .unwrap();
        assert_eq!(disposition, Disposition::DeadLetter);

        let dlq = f.broker.messages(&f.topology.dlq());
        assert_eq!(dlq.len(), 1);
        let record = DeadLetterRecord::parse(&dlq[0]).unwrap();
        assert_eq!(record.attempts, 3);
        assert_eq!(record.job, original);
        assert_eq!(record.stage, "classification");

        let doc = f.store.document(original.document_id()).unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert_eq!(f.broker.depth(&f.topology.retry()), 0);
    }

    #[tokio::test]
    async fn missing_document_does_not_block_retry() {
        let f = fixture(5).await;
        f.store.remove(&DocumentId::parse("doc-1").unwrap());

        f.scheduler
            .handle_failure(&job(0), FailureStage::Persist, "document not found")
            .await
            .unwrap();
        assert_eq!(f.broker.depth(&f.topology.retry()), 1);
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let topology = QueueTopology::new("classification", Duration::from_secs(15));
        // Nothing declared: the broker refuses the publish.
        let scheduler = RetryScheduler::new(
            "test-worker",
            RetryPolicy::default(),
            topology,
            Arc::new(InMemoryDocumentStore::new()),
            Arc::new(InMemoryBroker::new()),
            Arc::new(InMemoryEventSink::new()),
        );

        let err = scheduler
            .handle_failure(&job(0), FailureStage::Classify, "boom")
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::Publish { .. }));
    }
}
