use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::{CorrelationId, DocumentId, TraceId};

/// Failure to read or write a job envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The bytes on the wire are not a valid envelope. Never retried.
    #[error("malformed envelope: {0}")]
    Malformed(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

/// Envelope for a pipeline job, as carried on every queue hop.
///
/// Notes:
/// - `attempts` is per stage and grows by exactly one on each retry republish.
/// - `trace_id` / `correlation_id` never change once set; downstream jobs inherit them.
/// - `payload` is opaque to the pipeline and only interpreted by the stage handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "WireEnvelope")]
pub struct JobEnvelope {
    document_id: DocumentId,
    payload: String,
    trace_id: TraceId,
    correlation_id: CorrelationId,
    attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error_at: Option<DateTime<Utc>>,
}

/// Loosely-typed wire shape; every field is checked in `TryFrom`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    document_id: Option<String>,
    payload: Option<String>,
    trace_id: Option<String>,
    correlation_id: Option<String>,
    attempts: Option<u32>,
    last_error: Option<String>,
    last_error_at: Option<DateTime<Utc>>,
}

impl TryFrom<WireEnvelope> for JobEnvelope {
    type Error = EnvelopeError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let document_id = wire
            .document_id
            .ok_or_else(|| EnvelopeError::Malformed("missing documentId".to_string()))
            .and_then(|id| {
                DocumentId::parse(id).map_err(|e| EnvelopeError::Malformed(e.to_string()))
            })?;

        let payload = wire
            .payload
            .ok_or_else(|| EnvelopeError::Malformed("missing payload".to_string()))?;

        let trace_id = non_blank(wire.trace_id)
            .and_then(|t| TraceId::parse(t).ok())
            .unwrap_or_else(TraceId::generate);

        let correlation_id = non_blank(wire.correlation_id)
            .and_then(|c| CorrelationId::parse(c).ok())
            .unwrap_or_else(CorrelationId::generate);

        Ok(Self {
            document_id,
            payload,
            trace_id,
            correlation_id,
            attempts: wire.attempts.unwrap_or(0),
            last_error: wire.last_error,
            last_error_at: wire.last_error_at,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl JobEnvelope {
    /// A brand new job: fresh trace and correlation ids, zero attempts.
    pub fn new(document_id: DocumentId, payload: impl Into<String>) -> Self {
        Self::with_trace(
            document_id,
            payload,
            TraceId::generate(),
            CorrelationId::generate(),
        )
    }

    pub fn with_trace(
        document_id: DocumentId,
        payload: impl Into<String>,
        trace_id: TraceId,
        correlation_id: CorrelationId,
    ) -> Self {
        Self {
            document_id,
            payload: payload.into(),
            trace_id,
            correlation_id,
            attempts: 0,
            last_error: None,
            last_error_at: None,
        }
    }

    /// Parse an envelope from raw message bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    pub fn document_id(&self) -> &DocumentId {
        &self.document_id
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn trace_id(&self) -> &TraceId {
        &self.trace_id
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_error_at(&self) -> Option<DateTime<Utc>> {
        self.last_error_at
    }

    /// Attempt number the next delivery of this job would carry.
    pub fn next_attempt(&self) -> u32 {
        self.attempts.saturating_add(1)
    }

    /// Copy for the retry queue: identical except for the attempt counter and failure context.
    pub fn for_retry(&self, error: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            attempts: self.next_attempt(),
            last_error: Some(error.into()),
            last_error_at: Some(at),
            ..self.clone()
        }
    }

    /// A job for the next pipeline stage. Keeps the trace linkage, restarts attempts at 0.
    pub fn downstream(&self, payload: impl Into<String>) -> Self {
        Self::with_trace(
            self.document_id.clone(),
            payload,
            self.trace_id.clone(),
            self.correlation_id.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc_id() -> DocumentId {
        DocumentId::parse("doc-42").unwrap()
    }

    #[test]
    fn missing_attempts_defaults_to_zero() {
        let raw = json!({
            "documentId": "doc-42",
            "payload": "INVOICE #1",
            "traceId": "t-1",
            "correlationId": "c-1"
        });
        let env = JobEnvelope::parse(raw.to_string().as_bytes()).unwrap();
        assert_eq!(env.attempts(), 0);
        assert_eq!(env.trace_id().as_str(), "t-1");
        assert!(env.last_error().is_none());
    }

    #[test]
    fn missing_trace_id_is_generated() {
        let raw = json!({ "documentId": "doc-42", "payload": "x" });
        let env = JobEnvelope::parse(raw.to_string().as_bytes()).unwrap();
        assert!(!env.trace_id().as_str().is_empty());
        assert!(!env.correlation_id().as_str().is_empty());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            JobEnvelope::parse(b"not json at all"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn missing_document_id_is_malformed() {
        let raw = json!({ "payload": "x" });
        assert!(matches!(
            JobEnvelope::parse(raw.to_string().as_bytes()),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn negative_attempts_is_malformed() {
        let raw = json!({ "documentId": "d", "payload": "x", "attempts": -1 });
        assert!(JobEnvelope::parse(raw.to_string().as_bytes()).is_err());
    }

    #[test]
    fn retry_copy_increments_attempts_and_keeps_identity() {
        let env = JobEnvelope::new(doc_id(), "payload");
        let now = Utc::now();
        let retry = env.for_retry("classifier timed out", now);

        assert_eq!(retry.attempts(), 1);
        assert_eq!(retry.last_error(), Some("classifier timed out"));
        assert_eq!(retry.last_error_at(), Some(now));
        assert_eq!(retry.trace_id(), env.trace_id());
        assert_eq!(retry.correlation_id(), env.correlation_id());
        assert_eq!(retry.payload(), env.payload());

        let again = retry.for_retry("still down", now);
        assert_eq!(again.attempts(), 2);
    }

    #[test]
    fn downstream_job_resets_attempts_and_keeps_trace() {
        let env = JobEnvelope::new(doc_id(), "payload").for_retry("boom", Utc::now());
        let next = env.downstream("{\"kind\":\"invoice\"}");

        assert_eq!(next.attempts(), 0);
        assert!(next.last_error().is_none());
        assert_eq!(next.trace_id(), env.trace_id());
        assert_eq!(next.correlation_id(), env.correlation_id());
        assert_eq!(next.document_id(), env.document_id());
    }

    #[test]
    fn wire_format_uses_camel_case() {
        let env = JobEnvelope::new(doc_id(), "p").for_retry("e", Utc::now());
        let value: serde_json::Value = serde_json::from_slice(&env.to_bytes().unwrap()).unwrap();
        assert_eq!(value["documentId"], "doc-42");
        assert_eq!(value["attempts"], 1);
        assert!(value.get("lastErrorAt").is_some());
    }
}
