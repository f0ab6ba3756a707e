//! Infrastructure layer: persistence, queue brokers, pipeline, config, external services.

pub mod collaborators;
pub mod config;
pub mod document_store;
pub mod event_bus;
pub mod jobs;
pub mod pipeline;
pub mod router;

/// External service clients/adapters.
#[cfg(feature = "http")]
pub mod external;
