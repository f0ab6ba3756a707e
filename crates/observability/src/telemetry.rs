//! Queue lifecycle telemetry.
//!
//! Workers emit one [`QueueEvent`] per lifecycle step of a job (start, success, failure,
//! retry, dead-letter, drop, downstream enqueue). Sinks are fire-and-forget: recording
//! never fails and never blocks the pipeline.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;

/// What happened to a job on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueEventType {
    Started,
    Succeeded,
    Failed,
    Retried,
    DeadLettered,
    Dropped,
    Enqueued,
}

impl QueueEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueEventType::Started => "started",
            QueueEventType::Succeeded => "succeeded",
            QueueEventType::Failed => "failed",
            QueueEventType::Retried => "retried",
            QueueEventType::DeadLettered => "dead_lettered",
            QueueEventType::Dropped => "dropped",
            QueueEventType::Enqueued => "enqueued",
        }
    }
}

/// A single telemetry record, keyed by job identity in `metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEvent {
    pub service: String,
    pub queue: String,
    pub event_type: QueueEventType,
    pub metadata: JsonValue,
    pub occurred_at: DateTime<Utc>,
}

impl QueueEvent {
    pub fn new(
        service: impl Into<String>,
        queue: impl Into<String>,
        event_type: QueueEventType,
        metadata: JsonValue,
    ) -> Self {
        Self {
            service: service.into(),
            queue: queue.into(),
            event_type,
            metadata,
            occurred_at: Utc::now(),
        }
    }
}

/// Destination for queue telemetry.
pub trait QueueEventSink: Send + Sync + 'static {
    fn record(&self, event: QueueEvent);
}

impl<S: QueueEventSink + ?Sized> QueueEventSink for Arc<S> {
    fn record(&self, event: QueueEvent) {
        (**self).record(event)
    }
}

/// Emits every queue event as a structured `tracing` event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl QueueEventSink for TracingEventSink {
    fn record(&self, event: QueueEvent) {
        ::tracing::info!(
            target: "docflow::queue_events",
            service = %event.service,
            queue = %event.queue,
            event_type = event.event_type.as_str(),
            metadata = %event.metadata,
            "queue event"
        );
    }
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    inner: Mutex<Vec<QueueEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<QueueEvent> {
        self.inner.lock().unwrap().clone()
    }

    pub fn of_type(&self, event_type: QueueEventType) -> Vec<QueueEvent> {
        self.all()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }
}

impl QueueEventSink for InMemoryEventSink {
    fn record(&self, event: QueueEvent) {
        // A poisoned sink loses telemetry, never the job.
        if let Ok(mut events) = self.inner.lock() {
            events.push(event);
        }
    }
}
