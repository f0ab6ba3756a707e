//! Dead-letter records (audit trail of jobs that exhausted their retries).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{EnvelopeError, JobEnvelope};

/// Snapshot of a job at the moment its retries ran out.
///
/// Written once to the stage's DLQ and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// The job exactly as last delivered (full original payload).
    pub job: JobEnvelope,
    pub stage: String,
    /// Attempt count that exceeded the retry budget.
    pub attempts: u32,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(job: JobEnvelope, stage: impl Into<String>, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            job,
            stage: stage.into(),
            attempts,
            error: error.into(),
            dead_lettered_at: Utc::now(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// The job to republish when an operator replays this record.
    pub fn replay(&self) -> JobEnvelope {
        self.job.downstream(self.job.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_core::DocumentId;

    #[test]
    fn record_keeps_full_job() {
        let job = JobEnvelope::new(DocumentId::parse("d-1").unwrap(), "raw text");
        let record = DeadLetterRecord::new(job.clone(), "classification", 3, "always fails");

        let parsed = DeadLetterRecord::parse(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed.job, job);
        assert_eq!(parsed.attempts, 3);
        assert_eq!(parsed.stage, "classification");
    }

    #[test]
    fn replay_starts_a_fresh_episode_with_same_trace() {
        let job = JobEnvelope::new(DocumentId::parse("d-1").unwrap(), "raw text")
            .for_retry("boom", Utc::now());
        let record = DeadLetterRecord::new(job.clone(), "classification", 6, "boom");

        let replay = record.replay();
        assert_eq!(replay.attempts(), 0);
        assert_eq!(replay.trace_id(), job.trace_id());
        assert_eq!(replay.payload(), "raw text");
    }
}
