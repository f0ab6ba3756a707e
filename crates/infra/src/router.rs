//! Downstream routing of classified documents.
//!
//! After a classification commits, a document goes to exactly one of:
//! - **human review** (low confidence, poor extraction quality, or an error state)
//! - **ledger posting** (monetary kind, validated for posting)
//! - nowhere (non-monetary kinds that need no review)
//!
//! Routing is split in two. [`DownstreamRouter::plan`] computes a [`RoutingPlan`] whose
//! outbox messages the pipeline publishes after the commit; [`DownstreamRouter::apply`]
//! carries out the best-effort side effects (review entry, posting hold), whose failures
//! are logged and never fail the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use docflow_core::{DocumentId, DocumentKind, DocumentStatus, TenantId};
use docflow_events::{EnvelopeError, JobEnvelope};

use crate::collaborators::{CollaboratorError, PostingValidator, ReviewPriority, ReviewRouter};
use crate::config::RoutingPolicy;
use crate::document_store::{CommittedClassification, DocumentStore};

/// Review priority for a classified document, or `None` when no review is needed.
///
/// Missing quality scores never trigger review on their own.
pub fn review_priority(
    policy: &RoutingPolicy,
    confidence: f64,
    quality: Option<f64>,
    status: DocumentStatus,
) -> Option<ReviewPriority> {
    let low_confidence = confidence < policy.review_confidence_threshold;
    let low_quality = quality.is_some_and(|q| q < policy.review_quality_threshold);

    if !(low_confidence || low_quality || status == DocumentStatus::Error) {
        return None;
    }

    let urgent = confidence < policy.urgent_confidence_below
        || quality.is_some_and(|q| q < policy.urgent_quality_below);

    Some(if urgent {
        ReviewPriority::Urgent
    } else if low_confidence || low_quality {
        ReviewPriority::High
    } else {
        ReviewPriority::Medium
    })
}

/// Payload of a ledger-posting job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerPostingSummary {
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub kind: DocumentKind,
    pub confidence: f64,
    pub fields: Map<String, Value>,
    pub classified_at: DateTime<Utc>,
}

impl LedgerPostingSummary {
    pub fn from_committed(committed: &CommittedClassification) -> Self {
        Self {
            document_id: committed.document_id.clone(),
            tenant_id: committed.tenant_id,
            kind: committed.classification.kind.clone(),
            confidence: committed.classification.confidence,
            fields: committed.classification.fields.clone(),
            classified_at: committed.committed_at,
        }
    }
}

/// A message to publish once the classification has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub queue: String,
    pub envelope: JobEnvelope,
}

/// Routing decision for one committed classification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingPlan {
    pub review: Option<ReviewPriority>,
    /// Explanation attached to a document that was eligible for posting but failed validation.
    pub hold: Option<String>,
    pub outbox: Vec<OutboundMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("posting validation unavailable: {0}")]
    Validator(#[from] CollaboratorError),

    #[error(transparent)]
    Encode(#[from] EnvelopeError),
}

/// Decides where a classified document goes next.
pub struct DownstreamRouter {
    policy: RoutingPolicy,
    ledger_queue: String,
    validator: Arc<dyn PostingValidator>,
    reviews: Arc<dyn ReviewRouter>,
    store: Arc<dyn DocumentStore>,
}

impl DownstreamRouter {
    pub fn new(
        policy: RoutingPolicy,
        ledger_queue: impl Into<String>,
        validator: Arc<dyn PostingValidator>,
        reviews: Arc<dyn ReviewRouter>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        Self {
            policy,
            ledger_queue: ledger_queue.into(),
            validator,
            reviews,
            store,
        }
    }

    pub fn policy(&self) -> &RoutingPolicy {
        &self.policy
    }

    /// Compute the routing plan. Only a validator outage fails; an invalid document is a hold.
    pub async fn plan(
        &self,
        job: &JobEnvelope,
        committed: &CommittedClassification,
    ) -> Result<RoutingPlan, RouteError> {
        let review = review_priority(
            &self.policy,
            committed.classification.confidence,
            committed.quality_score,
            committed.status,
        );

        let mut plan = RoutingPlan {
            review,
            ..RoutingPlan::default()
        };

        if review.is_some() || !self.policy.is_monetary(&committed.classification.kind) {
            return Ok(plan);
        }

        let validation = self
            .validator
            .validate_for_posting(committed.tenant_id, &committed.document_id)
            .await?;

        if !validation.is_valid {
            plan.hold = Some(hold_message(&validation.errors));
            return Ok(plan);
        }

        let summary = LedgerPostingSummary::from_committed(committed);
        let payload = serde_json::to_string(&summary)
            .map_err(|e| EnvelopeError::Encode(e.to_string()))?;
        plan.outbox.push(OutboundMessage {
            queue: self.ledger_queue.clone(),
            envelope: job.downstream(payload),
        });
        Ok(plan)
    }

    /// Best-effort side effects of a plan. Never fails.
    pub async fn apply(&self, committed: &CommittedClassification, plan: &RoutingPlan) {
        if let Some(priority) = plan.review {
            self.route_to_review(committed, priority).await;
        }

        if let Some(message) = &plan.hold {
            if let Err(err) = self
                .store
                .hold_for_posting(&committed.document_id, message)
                .await
            {
                tracing::warn!(
                    document_id = %committed.document_id,
                    error = %err,
                    "failed to record posting hold"
                );
            } else {
                tracing::info!(
                    document_id = %committed.document_id,
                    reason = %message,
                    "document held from ledger posting"
                );
            }
        }
    }

    async fn route_to_review(&self, committed: &CommittedClassification, priority: ReviewPriority) {
        match self
            .reviews
            .route_to_review(committed.tenant_id, &committed.document_id, priority)
            .await
        {
            Ok(true) => {
                if let Err(err) = self.store.mark_pending_review(&committed.document_id).await {
                    tracing::warn!(
                        document_id = %committed.document_id,
                        error = %err,
                        "routed to review but failed to mark PENDING_REVIEW"
                    );
                }
            }
            Ok(false) => {
                tracing::info!(
                    document_id = %committed.document_id,
                    priority = priority.as_str(),
                    "review queue declined document"
                );
            }
            Err(err) => {
                tracing::warn!(
                    document_id = %committed.document_id,
                    priority = priority.as_str(),
                    error = %err,
                    "review routing failed"
                );
            }
        }
    }
}

fn hold_message(errors: &[String]) -> String {
    if errors.is_empty() {
        "held from ledger posting: validation failed".to_string()
    } else {
        format!("held from ledger posting: {}", errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryReviewQueue, StaticPostingValidator};
    use crate::document_store::InMemoryDocumentStore;
    use docflow_core::{ApplyOutcome, Classification, Document};
    use proptest::prelude::*;

    fn policy() -> RoutingPolicy {
        RoutingPolicy::default()
    }

    #[test]
    fn confident_clean_document_needs_no_review() {
        assert_eq!(
            review_priority(&policy(), 0.95, Some(90.0), DocumentStatus::Classified),
            None
        );
    }

    #[test]
    fn priority_tiers() {
        let p = policy();
        assert_eq!(
            review_priority(&p, 0.4, Some(90.0), DocumentStatus::Classified),
            Some(ReviewPriority::Urgent)
        );
        assert_eq!(
            review_priority(&p, 0.95, Some(45.0), DocumentStatus::Classified),
            Some(ReviewPriority::Urgent)
        );
        assert_eq!(
            review_priority(&p, 0.7, Some(90.0), DocumentStatus::Classified),
            Some(ReviewPriority::High)
        );
        assert_eq!(
            review_priority(&p, 0.95, Some(60.0), DocumentStatus::Classified),
            Some(ReviewPriority::High)
        );
        assert_eq!(
            review_priority(&p, 0.95, Some(90.0), DocumentStatus::Error),
            Some(ReviewPriority::Medium)
        );
    }

    #[test]
    fn missing_quality_is_not_a_review_reason() {
        assert_eq!(
            review_priority(&policy(), 0.9, None, DocumentStatus::Classified),
            None
        );
    }

    proptest! {
        #[test]
        fn review_needed_iff_below_a_threshold(
            confidence in 0.0f64..=1.0,
            quality in 0.0f64..=100.0,
        ) {
            let p = policy();
            let priority = review_priority(&p, confidence, Some(quality), DocumentStatus::Classified);
            let below = confidence < p.review_confidence_threshold || quality < p.review_quality_threshold;
            prop_assert_eq!(priority.is_some(), below);

            let urgent = confidence < p.urgent_confidence_below || quality < p.urgent_quality_below;
            prop_assert_eq!(priority == Some(ReviewPriority::Urgent), urgent);
        }
    }

    fn committed_at() -> DateTime<Utc> {
        "2026-03-01T10:00:00Z".parse().unwrap()
    }

    fn committed(kind: DocumentKind, confidence: f64, quality: f64) -> CommittedClassification {
        CommittedClassification {
            document_id: DocumentId::parse("doc-9").unwrap(),
            tenant_id: TenantId::new(),
            classification: Classification::new(kind, Map::new(), confidence),
            status: DocumentStatus::Classified,
            quality_score: Some(quality),
            outcome: ApplyOutcome::Applied,
            committed_at: committed_at(),
        }
    }

    fn router(validator: StaticPostingValidator) -> DownstreamRouter {
        DownstreamRouter::new(
            policy(),
            "ledger.primary",
            Arc::new(validator),
            Arc::new(InMemoryReviewQueue::new()),
            Arc::new(InMemoryDocumentStore::new()),
        )
    }

    fn job() -> JobEnvelope {
        JobEnvelope::new(DocumentId::parse("doc-9").unwrap(), "raw")
    }

    #[tokio::test]
    async fn valid_invoice_yields_one_ledger_job_with_same_trace() {
        let job = job();
        let plan = router(StaticPostingValidator::valid())
            .plan(&job, &committed(DocumentKind::Invoice, 0.95, 90.0))
            .await
            .unwrap();

        assert_eq!(plan.review, None);
        assert_eq!(plan.outbox.len(), 1);
        let out = &plan.outbox[0];
        assert_eq!(out.queue, "ledger.primary");
        assert_eq!(out.envelope.trace_id(), job.trace_id());
        assert_eq!(out.envelope.correlation_id(), job.correlation_id());
        assert_eq!(out.envelope.attempts(), 0);

        let summary: LedgerPostingSummary = serde_json::from_str(out.envelope.payload()).unwrap();
        assert_eq!(summary.kind, DocumentKind::Invoice);
        assert_eq!(summary.classified_at, committed_at());
    }

    #[tokio::test]
    async fn non_monetary_kind_goes_nowhere() {
        let plan = router(StaticPostingValidator::valid())
            .plan(&job(), &committed(DocumentKind::Contract, 0.95, 90.0))
            .await
            .unwrap();
        assert_eq!(plan, RoutingPlan::default());
    }

    #[tokio::test]
    async fn invalid_posting_is_held_not_forwarded() {
        let plan = router(StaticPostingValidator::invalid(vec!["missing VAT id".into()]))
            .plan(&job(), &committed(DocumentKind::Receipt, 0.95, 90.0))
            .await
            .unwrap();

        assert!(plan.outbox.is_empty());
        assert_eq!(
            plan.hold.as_deref(),
            Some("held from ledger posting: missing VAT id")
        );
    }

    #[tokio::test]
    async fn validator_outage_is_an_error() {
        let err = router(StaticPostingValidator::unavailable("connection refused"))
            .plan(&job(), &committed(DocumentKind::Invoice, 0.95, 90.0))
            .await
            .unwrap_err();
        assert!(matches!(err, RouteError::Validator(_)));
    }

    #[tokio::test]
    async fn low_confidence_invoice_skips_validator() {
        let plan = router(StaticPostingValidator::unavailable("not called"))
            .plan(&job(), &committed(DocumentKind::Invoice, 0.4, 90.0))
            .await
            .unwrap();
        assert_eq!(plan.review, Some(ReviewPriority::Urgent));
        assert!(plan.outbox.is_empty());
    }

    #[tokio::test]
    async fn apply_marks_pending_review_and_swallows_failures() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let id = DocumentId::parse("doc-9").unwrap();
        let mut doc = Document::extracted(id.clone(), TenantId::new(), Some(90.0));
        doc.apply_classification(
            &Classification::new(DocumentKind::Invoice, Map::new(), 0.4),
            Utc::now(),
        )
        .unwrap();
        store.insert(doc);

        let queue = Arc::new(InMemoryReviewQueue::new());
        let router = DownstreamRouter::new(
            policy(),
            "ledger.primary",
            Arc::new(StaticPostingValidator::valid()),
            queue.clone(),
            store.clone(),
        );
        let c = committed(DocumentKind::Invoice, 0.4, 90.0);
        let plan = router.plan(&job(), &c).await.unwrap();
        router.apply(&c, &plan).await;

        assert_eq!(queue.entries().len(), 1);
        assert_eq!(
            store.document(&id).unwrap().status,
            DocumentStatus::PendingReview
        );

        let failing = DownstreamRouter::new(
            policy(),
            "ledger.primary",
            Arc::new(StaticPostingValidator::valid()),
            Arc::new(InMemoryReviewQueue::unavailable("down")),
            Arc::new(InMemoryDocumentStore::new()),
        );
        failing.apply(&c, &plan).await;
    }
}
