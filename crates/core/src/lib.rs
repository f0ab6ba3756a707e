//! `docflow-core` — domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod document;
pub mod error;
pub mod id;

pub use document::{ApplyOutcome, Classification, Document, DocumentKind, DocumentStatus};
pub use error::{DomainError, DomainResult};
pub use id::{CorrelationId, DocumentId, TenantId, TraceId};
