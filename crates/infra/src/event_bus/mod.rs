//! Infrastructure queue broker implementations.
//!
//! The broker abstraction and the in-memory broker live in `docflow-events` as pure
//! mechanics. This module provides infrastructure-backed implementations (e.g. Redis).

#[cfg(feature = "redis")]
pub mod redis_queue;

#[cfg(feature = "redis")]
pub use redis_queue::RedisQueueBroker;
