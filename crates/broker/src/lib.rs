//! Broker boundary for the order saga choreography.
//!
//! This crate defines the canonical [`EventEnvelope`] every service exchanges,
//! and the narrow [`Broker`] interface the choreography core consumes:
//! keyed publish to a topic, and per-partition consumption with explicit
//! commit and redelivery.
//!
//! Two implementations are provided:
//! - [`InMemoryBroker`]: a partitioned, append-only log kept in memory, used
//!   by tests and by the single-process deployment.
//! - `KafkaBroker` (feature `kafka`): a Kafka-compatible client built on rdkafka.

mod backlog;
pub mod broker;
pub mod envelope;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use backlog::PartitionBacklog;
pub use broker::{Broker, Delivery, PartitionConsumer, PartitionStream, Record, RecordPosition};
pub use common::OrderId;
pub use envelope::{EventEnvelope, EventEnvelopeBuilder, EventId, EventType};
pub use error::{BrokerError, EnvelopeError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerBuilder};
pub use memory::InMemoryBroker;
