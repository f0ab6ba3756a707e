//! External collaborators consumed by the pipeline.
//!
//! Each collaborator is a narrow async trait. Production adapters live in
//! [`crate::external`]; the in-memory implementations here are for tests/dev.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use docflow_core::{Classification, DocumentId, TenantId};

/// Classification capability failure. Always retryable.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClassifyError {
    #[error("classification timed out after {0:?}")]
    Timeout(Duration),

    #[error("classifier failed: {0}")]
    Failed(String),

    #[error("classifier returned an invalid result: {0}")]
    InvalidResult(String),
}

/// Failure talking to a non-classification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{service} unavailable: {message}")]
    Unavailable {
        service: &'static str,
        message: String,
    },

    #[error("{service} returned an invalid response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },
}

/// `classify(payload) -> { kind, fields, confidence }`.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, payload: &str) -> Result<Classification, ClassifyError>;
}

/// Outcome of the posting validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostingValidation {
    pub is_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl PostingValidation {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            is_valid: false,
            errors,
        }
    }
}

/// Decides whether a classified document may be posted to the ledger.
#[async_trait]
pub trait PostingValidator: Send + Sync {
    async fn validate_for_posting(
        &self,
        tenant_id: TenantId,
        document_id: &DocumentId,
    ) -> Result<PostingValidation, CollaboratorError>;
}

/// Urgency of a human review entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewPriority {
    Urgent,
    High,
    Medium,
}

impl ReviewPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewPriority::Urgent => "urgent",
            ReviewPriority::High => "high",
            ReviewPriority::Medium => "medium",
        }
    }
}

/// Creates or updates a review-queue entry. Returns `true` if the document was routed.
#[async_trait]
pub trait ReviewRouter: Send + Sync {
    async fn route_to_review(
        &self,
        tenant_id: TenantId,
        document_id: &DocumentId,
        priority: ReviewPriority,
    ) -> Result<bool, CollaboratorError>;
}

/// Scripted classifier for tests/dev.
///
/// Replays queued responses in order; once the script runs out, the fallback answers.
#[derive(Debug)]
pub struct ScriptedClassifier {
    script: Mutex<VecDeque<Result<Classification, ClassifyError>>>,
    fallback: Result<Classification, ClassifyError>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn always(result: Classification) -> Self {
        Self::with_fallback(Ok(result))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_fallback(Err(ClassifyError::Failed(message.into())))
    }

    fn with_fallback(fallback: Result<Classification, ClassifyError>) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer `response` before falling back.
    pub fn then(self, response: Result<Classification, ClassifyError>) -> Self {
        self.script.lock().unwrap().push_back(response);
        self
    }

    /// Sleep this long before answering (to exercise timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Payloads received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, payload: &str) -> Result<Classification, ClassifyError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(payload.to_string());
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .script
            .lock()
            .map_err(|_| ClassifyError::Failed("script lock poisoned".to_string()))?
            .pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Posting validator with a fixed answer, for tests/dev.
#[derive(Debug)]
pub struct StaticPostingValidator {
    answer: Result<PostingValidation, CollaboratorError>,
}

impl StaticPostingValidator {
    pub fn valid() -> Self {
        Self {
            answer: Ok(PostingValidation::valid()),
        }
    }

    pub fn invalid(errors: Vec<String>) -> Self {
        Self {
            answer: Ok(PostingValidation::invalid(errors)),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            answer: Err(CollaboratorError::Unavailable {
                service: "posting-validator",
                message: message.into(),
            }),
        }
    }
}

#[async_trait]
impl PostingValidator for StaticPostingValidator {
    async fn validate_for_posting(
        &self,
        _tenant_id: TenantId,
        _document_id: &DocumentId,
    ) -> Result<PostingValidation, CollaboratorError> {
        self.answer.clone()
    }
}

/// In-memory review queue for tests/dev. Entries are upserted per document.
#[derive(Debug, Default)]
pub struct InMemoryReviewQueue {
    entries: Mutex<Vec<(TenantId, DocumentId, ReviewPriority)>>,
    failure: Option<String>,
}

impl InMemoryReviewQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// A review queue whose every call fails.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            failure: Some(message.into()),
        }
    }

    pub fn entries(&self) -> Vec<(TenantId, DocumentId, ReviewPriority)> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewRouter for InMemoryReviewQueue {
    async fn route_to_review(
        &self,
        tenant_id: TenantId,
        document_id: &DocumentId,
        priority: ReviewPriority,
    ) -> Result<bool, CollaboratorError> {
        if let Some(message) = &self.failure {
            return Err(CollaboratorError::Unavailable {
                service: "review-queue",
                message: message.clone(),
            });
        }

        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CollaboratorError::Unavailable {
                service: "review-queue",
                message: "lock poisoned".to_string(),
            })?;
        match entries.iter_mut().find(|(t, d, _)| *t == tenant_id && d == document_id) {
            Some(entry) => entry.2 = priority,
            None => entries.push((tenant_id, document_id.clone(), priority)),
        }
        Ok(true)
    }
}
