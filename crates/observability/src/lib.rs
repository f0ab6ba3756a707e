//! Tracing, logging and queue telemetry (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    self::tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Queue lifecycle events for an external metrics collector.
pub mod telemetry;

pub use telemetry::{InMemoryEventSink, QueueEvent, QueueEventSink, QueueEventType, TracingEventSink};
