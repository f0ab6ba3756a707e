//! Durable queue abstraction (mechanics only).
//!
//! The pipeline talks to its broker through [`QueueBroker`]: declare the topology,
//! publish raw message bodies, pull one delivery at a time and settle it.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a delivery that is never acknowledged is redelivered
//!   (after a crash, or when explicitly released).
//! - **Settle exactly once**: each delivery is acked, rejected or released once.
//!   Settling an unknown or already-settled delivery is an error.
//! - **Prefetch**: a consumer holds at most `prefetch` unsettled deliveries per queue.
//!
//! ## Settlement
//!
//! | Call | Effect |
//! |------|--------|
//! | `ack` | message is done and removed |
//! | `reject` | broker-level rejection: routed to the queue's dead-letter target |
//! | `release` | returned to the queue unchanged, to be delivered again |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::topology::QueueDeclaration;

/// Broker-assigned handle identifying one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub String);

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer and not yet settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: DeliveryTag,
    queue: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, queue: impl Into<String>, body: Vec<u8>, redelivered: bool) -> Self {
        Self {
            tag,
            queue: queue.into(),
            body,
            redelivered,
        }
    }

    pub fn tag(&self) -> &DeliveryTag {
        &self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// True when the broker handed this message out before without it being acked.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("queue not declared: {0}")]
    UnknownQueue(String),

    #[error("queue {0} already declared with different arguments")]
    TopologyMismatch(String),

    #[error("unknown or already settled delivery: {0}")]
    UnknownDelivery(DeliveryTag),

    #[error("prefetch limit {limit} reached on {queue}")]
    PrefetchExceeded { queue: String, limit: u16 },

    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),
}

/// Transport-agnostic durable queue broker.
///
/// Implementations must be safe to share across tasks; settlement calls for a given
/// delivery come from the task that received it.
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Declare a queue (idempotent for identical arguments).
    async fn declare(&self, queue: &QueueDeclaration) -> Result<(), BrokerError>;

    /// Limit unsettled deliveries per queue for this consumer.
    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError>;

    /// Publish a message body. Returns once the broker has durably accepted it.
    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Wait up to `wait` for the next delivery on `queue`.
    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn reject(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError>;
}

#[async_trait]
impl<B> QueueBroker for Arc<B>
where
    B: QueueBroker + ?Sized,
{
    async fn declare(&self, queue: &QueueDeclaration) -> Result<(), BrokerError> {
        (**self).declare(queue).await
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<(), BrokerError> {
        (**self).set_prefetch(prefetch).await
    }

    async fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        (**self).publish(queue, body).await
    }

    async fn receive(&self, queue: &str, wait: Duration) -> Result<Option<Delivery>, BrokerError> {
        (**self).receive(queue, wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).ack(delivery).await
    }

    async fn reject(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).reject(delivery).await
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        (**self).release(delivery).await
    }
}
