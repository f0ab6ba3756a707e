//! Queue worker with retry, delay and dead-letter handling.
//!
//! ## Design
//!
//! - One delivery at a time (prefetch 1), one [`Disposition`] per delivery
//! - Retry state travels in the envelope; delay comes from the retry queue TTL
//! - Dead-letter records once the retry budget is spent
//! - Ack only after the outcome is durably recorded
//!
//! ## Components
//!
//! - `RetryPolicy`: retry budget and delay
//! - `RetryScheduler`: republishes to the retry queue or dead-letters
//! - `Dispatcher`: parses, runs the pipeline, decides, settles
//! - `Worker`: the long-running consume loop with graceful shutdown

pub mod dispatcher;
pub mod scheduler;
pub mod types;
pub mod worker;

pub use dispatcher::{ACK_ATTEMPTS, Components, DispatchError, Dispatcher, PREFETCH};
pub use scheduler::{RetryScheduler, ScheduleError};
pub use types::{Disposition, FailureStage, RetryDecision, RetryPolicy};
pub use worker::{Worker, WorkerConfig, WorkerHandle, WorkerStats};
