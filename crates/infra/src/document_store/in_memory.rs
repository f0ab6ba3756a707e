use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::Utc;

use docflow_core::{Classification, Document, DocumentId, DomainResult};

use super::{CommittedClassification, DocumentStore, PersistError};

/// In-memory document store.
///
/// Intended for tests/dev. Each operation works on a copy of the document and only
/// swaps it in on success, so a failed transition leaves the stored row untouched.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
    failing_applies: AtomicU32,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, document: Document) {
        self.documents
            .write()
            .unwrap()
            .insert(document.id.clone(), document);
    }

    pub fn remove(&self, document_id: &DocumentId) -> Option<Document> {
        self.documents.write().unwrap().remove(document_id)
    }

    pub fn document(&self, document_id: &DocumentId) -> Option<Document> {
        self.documents.read().unwrap().get(document_id).cloned()
    }

    /// Make the next `count` classification commits fail with a transient error.
    pub fn fail_next_applies(&self, count: u32) {
        self.failing_applies.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_applies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Lock, copy, mutate, swap. The copy is discarded if `op` fails.
    fn locked_update<T>(
        &self,
        document_id: &DocumentId,
        op: impl FnOnce(&mut Document) -> DomainResult<T>,
    ) -> Result<(T, Document), PersistError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| PersistError::Storage("lock poisoned".to_string()))?;

        let current = documents
            .get(document_id)
            .ok_or_else(|| PersistError::NotFound(document_id.clone()))?;

        let mut working = current.clone();
        let out = op(&mut working).map_err(|e| PersistError::from_domain(document_id, e))?;
        documents.insert(document_id.clone(), working.clone());
        Ok((out, working))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn apply_classification(
        &self,
        document_id: &DocumentId,
        result: &Classification,
    ) -> Result<CommittedClassification, PersistError> {
        if self.take_injected_failure() {
            return Err(PersistError::Transient(
                "injected failure: deadlock detected".to_string(),
            ));
        }

        let (outcome, document) =
            self.locked_update(document_id, |doc| doc.apply_classification(result, Utc::now()))?;
        Ok(CommittedClassification::from_document(&document, result, outcome))
    }

    async fn mark_retrying(&self, document_id: &DocumentId, reason: &str) -> Result<(), PersistError> {
        self.locked_update(document_id, |doc| {
            doc.mark_retrying(reason, Utc::now());
            Ok(())
        })
        .map(|_| ())
    }

    async fn mark_error(&self, document_id: &DocumentId, reason: &str) -> Result<(), PersistError> {
        self.locked_update(document_id, |doc| {
            doc.mark_error(reason, Utc::now());
            Ok(())
        })
        .map(|_| ())
    }

    async fn mark_pending_review(&self, document_id: &DocumentId) -> Result<(), PersistError> {
        self.locked_update(document_id, |doc| doc.mark_pending_review(Utc::now()))
            .map(|_| ())
    }

    async fn hold_for_posting(&self, document_id: &DocumentId, message: &str) -> Result<(), PersistError> {
        self.locked_update(document_id, |doc| {
            doc.hold(message, Utc::now());
            Ok(())
        })
        .map(|_| ())
    }

    async fn get(&self, document_id: &DocumentId) -> Result<Option<Document>, PersistError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| PersistError::Storage("lock poisoned".to_string()))?;
        Ok(documents.get(document_id).cloned())
    }
}
