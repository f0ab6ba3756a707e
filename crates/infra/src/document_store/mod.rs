//! Transactional document persistence boundary.
//!
//! Every mutation follows the same shape: lock the document row exclusively, apply a
//! domain transition from `docflow_core::Document`, write the row back and commit.
//! Nothing is visible to other components before the commit; a failure anywhere rolls
//! the whole transaction back.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use docflow_core::{
    ApplyOutcome, Classification, Document, DocumentId, DocumentStatus, DomainError, TenantId,
};

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

/// Persistence failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistError {
    /// The document row does not exist (possibly deleted).
    #[error("document not found: {0}")]
    NotFound(DocumentId),

    /// The document was moved on by a competing attempt with a different result.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Deadlock, serialization failure, lost connection: worth retrying.
    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl PersistError {
    pub(crate) fn from_domain(id: &DocumentId, err: DomainError) -> Self {
        match err {
            DomainError::Conflict(msg) | DomainError::InvariantViolation(msg) => {
                PersistError::Conflict(msg)
            }
            other => PersistError::Storage(other.to_string()),
        }
    }
}

/// What the router needs from a committed classification.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedClassification {
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub classification: Classification,
    /// Status after commit.
    pub status: DocumentStatus,
    pub quality_score: Option<f64>,
    pub outcome: ApplyOutcome,
    /// When the stored classification was written (unchanged by a no-op re-apply).
    pub committed_at: DateTime<Utc>,
}

impl CommittedClassification {
    pub(crate) fn from_document(
        document: &Document,
        classification: &Classification,
        outcome: ApplyOutcome,
    ) -> Self {
        Self {
            document_id: document.id.clone(),
            tenant_id: document.tenant_id,
            classification: classification.clone(),
            status: document.status,
            quality_score: document.quality_score,
            outcome,
            committed_at: document.updated_at,
        }
    }
}

/// Document persistence used by the pipeline.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Merge a classification result and mark the document `CLASSIFIED`, in one transaction.
    async fn apply_classification(
        &self,
        document_id: &DocumentId,
        result: &Classification,
    ) -> Result<CommittedClassification, PersistError>;

    /// Flag the document as still in progress after a failed attempt.
    async fn mark_retrying(&self, document_id: &DocumentId, reason: &str) -> Result<(), PersistError>;

    /// Terminal failure: status `ERROR` with a human-readable reason.
    async fn mark_error(&self, document_id: &DocumentId, reason: &str) -> Result<(), PersistError>;

    async fn mark_pending_review(&self, document_id: &DocumentId) -> Result<(), PersistError>;

    /// Attach an explanatory message for a document held back from ledger posting.
    async fn hold_for_posting(&self, document_id: &DocumentId, message: &str) -> Result<(), PersistError>;

    async fn get(&self, document_id: &DocumentId) -> Result<Option<Document>, PersistError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id() -> DocumentId {
        DocumentId::parse("doc-1").unwrap()
    }

    #[test]
    fn domain_rejections_map_to_conflict() {
        assert_eq!(
            PersistError::from_domain(&id(), DomainError::conflict("different result")),
            PersistError::Conflict("different result".to_string())
        );
        assert_eq!(
            PersistError::from_domain(&id(), DomainError::invariant("backward move")),
            PersistError::Conflict("backward move".to_string())
        );
    }

    #[test]
    fn other_domain_errors_are_storage_errors() {
        let err = PersistError::from_domain(&id(), DomainError::invalid_id("blank"));
        assert!(matches!(err, PersistError::Storage(msg) if msg.contains("blank")));
    }

    #[test]
    fn committed_timestamp_is_the_documents_write_time() {
        let mut doc = Document::extracted(id(), TenantId::new(), Some(90.0));
        let result = Classification::new(docflow_core::DocumentKind::Receipt, Default::default(), 0.9);
        let at = "2026-03-01T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let outcome = doc.apply_classification(&result, at).unwrap();

        let committed = CommittedClassification::from_document(&doc, &result, outcome);
        assert_eq!(committed.committed_at, at);
        assert_eq!(committed.status, DocumentStatus::Classified);
    }
}
