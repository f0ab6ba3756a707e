//! Queue topology per pipeline stage: primary, retry (TTL delay) and dead-letter.

use std::time::Duration;

/// Declaration of a single queue and its broker-level arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    /// Messages expire after this long and are routed to `dead_letter_to`.
    pub message_ttl: Option<Duration>,
    /// Where expired or rejected messages go. `None` means terminal.
    pub dead_letter_to: Option<String>,
}

/// The three queues of one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    stage: String,
    retry_delay: Duration,
}

impl QueueTopology {
    pub fn new(stage: impl Into<String>, retry_delay: Duration) -> Self {
        Self {
            stage: stage.into(),
            retry_delay,
        }
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn primary(&self) -> String {
        format!("{}.primary", self.stage)
    }

    pub fn retry(&self) -> String {
        format!("{}.retry", self.stage)
    }

    pub fn dlq(&self) -> String {
        format!("{}.dlq", self.stage)
    }

    /// Declarations in dependency order (DLQ first, so every dead-letter target exists).
    pub fn declarations(&self) -> [QueueDeclaration; 3] {
        [
            QueueDeclaration {
                name: self.dlq(),
                durable: true,
                message_ttl: None,
                dead_letter_to: None,
            },
            QueueDeclaration {
                name: self.primary(),
                durable: true,
                message_ttl: None,
                dead_letter_to: Some(self.dlq()),
            },
            QueueDeclaration {
                name: self.retry(),
                durable: true,
                message_ttl: Some(self.retry_delay),
                dead_letter_to: Some(self.primary()),
            },
        ]
    }
}
