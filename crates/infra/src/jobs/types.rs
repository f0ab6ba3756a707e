//! Core job types and policies.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy: a fixed delay (the retry queue TTL) and a bounded number of retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retries (0 = dead-letter on first failure)
    pub max_retries: u32,
    /// Delay before a retried job is delivered again
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Create a policy with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Decide what happens to a job that failed after `attempts` previous retries.
    pub fn decide(&self, attempts: u32) -> RetryDecision {
        let next_attempt = attempts.saturating_add(1);
        if next_attempt <= self.max_retries {
            RetryDecision::Retry { next_attempt }
        } else {
            RetryDecision::DeadLetter {
                attempts: next_attempt,
            }
        }
    }
}

/// Outcome of [`RetryPolicy::decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish to the retry queue carrying `next_attempt`.
    Retry { next_attempt: u32 },
    /// Retry budget exhausted; `attempts` is recorded on the dead-letter record.
    DeadLetter { attempts: u32 },
}

/// What happened to one delivery. Exactly one per delivery; the delivery is acked after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Processed and committed (outbox published)
    Success,
    /// Failed; a retry copy was published
    Retry,
    /// Failed for good; a dead-letter record was published
    DeadLetter,
    /// Discarded without retry (malformed message, unresolvable conflict)
    Drop,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Success => "success",
            Disposition::Retry => "retry",
            Disposition::DeadLetter => "dead_letter",
            Disposition::Drop => "drop",
        }
    }
}

/// Step of the pipeline a failure came from (reported in telemetry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Classify,
    Persist,
    Route,
    Publish,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Classify => "classify",
            FailureStage::Persist => "persist",
            FailureStage::Route => "route",
            FailureStage::Publish => "publish",
        }
    }
}
