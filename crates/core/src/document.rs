//! Document entity and its classification state machine.
//!
//! Pure domain logic: the persister loads a document under a row lock, applies one of
//! these transitions, and writes the result back inside the same transaction.

use core::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DomainError, DomainResult};
use crate::id::{DocumentId, TenantId};

/// Processing status of a document.
///
/// Forward order: `Extracted < Classified < PendingReview`. `Error` can be entered from
/// anywhere and is left only when an operator replays a dead-lettered job.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Extracted,
    Classified,
    PendingReview,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Extracted => "EXTRACTED",
            DocumentStatus::Classified => "CLASSIFIED",
            DocumentStatus::PendingReview => "PENDING_REVIEW",
            DocumentStatus::Error => "ERROR",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DocumentStatus::Extracted => 0,
            DocumentStatus::Classified => 1,
            DocumentStatus::PendingReview => 2,
            DocumentStatus::Error => u8::MAX,
        }
    }

    /// Whether moving from `self` to `next` keeps the status monotonic.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        match (self, next) {
            (_, DocumentStatus::Error) => true,
            (DocumentStatus::Error, _) => true,
            (current, next) => next.rank() >= current.rank(),
        }
    }
}

impl core::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EXTRACTED" => Ok(DocumentStatus::Extracted),
            "CLASSIFIED" => Ok(DocumentStatus::Classified),
            "PENDING_REVIEW" => Ok(DocumentStatus::PendingReview),
            "ERROR" => Ok(DocumentStatus::Error),
            other => Err(DomainError::validation(format!("unknown document status: {other}"))),
        }
    }
}

/// Kind of document as decided by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    Receipt,
    BankStatement,
    Contract,
    #[serde(other)]
    Unknown,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Invoice => "invoice",
            DocumentKind::Receipt => "receipt",
            DocumentKind::BankStatement => "bank_statement",
            DocumentKind::Contract => "contract",
            DocumentKind::Unknown => "unknown",
        }
    }
}

impl core::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentKind {
    type Err = DomainError;

    /// Unrecognised kinds map to `Unknown` rather than failing.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "invoice" => DocumentKind::Invoice,
            "receipt" => DocumentKind::Receipt,
            "bank_statement" => DocumentKind::BankStatement,
            "contract" => DocumentKind::Contract,
            _ => DocumentKind::Unknown,
        })
    }
}

/// Output of the classification capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub kind: DocumentKind,
    #[serde(default)]
    pub fields: Map<String, Value>,
    pub confidence: f64,
}

impl Classification {
    pub fn new(kind: DocumentKind, fields: Map<String, Value>, confidence: f64) -> Self {
        Self {
            kind,
            fields,
            confidence,
        }
    }

    /// Reject results the classifier should never have produced.
    pub fn validate(&self) -> DomainResult<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(DomainError::validation(format!(
                "confidence out of range: {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// Outcome of applying a classification to a document.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The document was updated and must be written back.
    Applied,
    /// The document already carries this exact result; nothing to write.
    AlreadyApplied,
}

/// A document as seen by the classification pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub status: DocumentStatus,
    pub kind: Option<DocumentKind>,
    /// Structured data accumulated by every stage (extraction, classification, ...).
    pub structured_data: Map<String, Value>,
    pub confidence: Option<f64>,
    /// Extraction quality on a 0-100 scale.
    pub quality_score: Option<f64>,
    pub error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A freshly extracted document awaiting classification.
    pub fn extracted(id: DocumentId, tenant_id: TenantId, quality_score: Option<f64>) -> Self {
        Self {
            id,
            tenant_id,
            status: DocumentStatus::Extracted,
            kind: None,
            structured_data: Map::new(),
            confidence: None,
            quality_score,
            error_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_structured_data(mut self, data: Map<String, Value>) -> Self {
        self.structured_data = data;
        self
    }

    /// True when the stored classification equals `result` (fields compared by key).
    pub fn carries(&self, result: &Classification) -> bool {
        self.kind.as_ref() == Some(&result.kind)
            && self.confidence == Some(result.confidence)
            && result
                .fields
                .iter()
                .all(|(k, v)| self.structured_data.get(k) == Some(v))
    }

    /// Merge a classification result and move to `CLASSIFIED`.
    ///
    /// Unrelated structured data is preserved. A new result is only taken from `EXTRACTED`
    /// or `ERROR` (operator replay). From `CLASSIFIED` onward the document must already
    /// carry the same result, which is a no-op; a different result is a conflict and
    /// nothing is modified.
    pub fn apply_classification(
        &mut self,
        result: &Classification,
        at: DateTime<Utc>,
    ) -> DomainResult<ApplyOutcome> {
        if !matches!(self.status, DocumentStatus::Extracted | DocumentStatus::Error) {
            if self.carries(result) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            return Err(DomainError::conflict(format!(
                "document {} is {} with a different classification",
                self.id, self.status
            )));
        }

        for (key, value) in &result.fields {
            self.structured_data.insert(key.clone(), value.clone());
        }
        self.kind = Some(result.kind.clone());
        self.confidence = Some(result.confidence);
        self.status = DocumentStatus::Classified;
        self.error_message = None;
        self.updated_at = at;
        Ok(ApplyOutcome::Applied)
    }

    /// Flag the document as still being processed after a failed attempt.
    ///
    /// Only moves the status back to `EXTRACTED` where that is not a backward step;
    /// the failure reason is recorded either way.
    pub fn mark_retrying(&mut self, reason: &str, at: DateTime<Utc>) {
        if self.status.can_transition_to(DocumentStatus::Extracted) {
            self.status = DocumentStatus::Extracted;
        }
        self.error_message = Some(format!("retrying after failure: {reason}"));
        self.updated_at = at;
    }

    pub fn mark_error(&mut self, reason: &str, at: DateTime<Utc>) {
        self.status = DocumentStatus::Error;
        self.error_message = Some(reason.to_string());
        self.updated_at = at;
    }

    pub fn mark_pending_review(&mut self, at: DateTime<Utc>) -> DomainResult<()> {
        if !self.status.can_transition_to(DocumentStatus::PendingReview) {
            return Err(DomainError::invariant(format!(
                "cannot move document {} from {} to PENDING_REVIEW",
                self.id, self.status
            )));
        }
        self.status = DocumentStatus::PendingReview;
        self.updated_at = at;
        Ok(())
    }

    /// Attach an explanatory message without changing status (posting hold).
    pub fn hold(&mut self, message: &str, at: DateTime<Utc>) {
        self.error_message = Some(message.to_string());
        self.updated_at = at;
    }
}
