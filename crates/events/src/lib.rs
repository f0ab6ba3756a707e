//! `docflow-events` — job envelopes and durable queue mechanics.
//!
//! Pure mechanics: what travels on the wire and how a broker is driven.
//! Concrete network brokers live in `docflow-infra`.

pub mod bus;
pub mod dead_letter;
pub mod envelope;
pub mod in_memory_bus;
pub mod topology;

pub use bus::{BrokerError, Delivery, DeliveryTag, QueueBroker};
pub use dead_letter::DeadLetterRecord;
pub use envelope::{EnvelopeError, JobEnvelope};
pub use in_memory_bus::{BrokerStats, InMemoryBroker};
pub use topology::{QueueDeclaration, QueueTopology};
