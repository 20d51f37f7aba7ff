use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::Serialize;

use crate::{EnvelopeError, EventEnvelope, Result};

/// A keyed record to append to a topic.
#[derive(Debug, Clone)]
pub struct Record {
    /// Partition key. Records sharing a key land in the same partition.
    pub key: String,

    /// Encoded message body.
    pub payload: Vec<u8>,
}

impl Record {
    /// Creates a record from a key and raw bytes.
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            payload,
        }
    }

    /// Encodes an envelope into a record keyed by its order ID.
    pub fn from_envelope(envelope: &EventEnvelope) -> std::result::Result<Self, EnvelopeError> {
        Ok(Self {
            key: envelope.key().to_string(),
            payload: envelope.encode()?,
        })
    }
}

/// Where the broker stored an accepted record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
}

impl std::fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// Per-partition consumption cursor.
///
/// A dispatcher worker owns one consumer and processes its deliveries
/// sequentially, which is what preserves per-key ordering.
#[async_trait]
pub trait PartitionConsumer: Send {
    /// The topic this consumer reads.
    fn topic(&self) -> &str;

    /// The partition this consumer reads.
    fn partition(&self) -> u32;

    /// Waits for the next record.
    ///
    /// Returns `None` once the broker connection is closed. Implementations
    /// must be cancel-safe: dropping the future must not lose a record.
    async fn next_delivery(&mut self) -> Option<Delivery>;

    /// Acknowledges consumption of `delivery` and everything before it.
    async fn commit(&mut self, delivery: &Delivery) -> Result<()>;

    /// Rewinds so that the next call to [`next_delivery`](Self::next_delivery)
    /// yields `delivery` again.
    async fn redeliver(&mut self, delivery: &Delivery) -> Result<()>;
}

/// Stream of partition consumers assigned to a subscription.
pub type PartitionStream = Pin<Box<dyn Stream<Item = Box<dyn PartitionConsumer>> + Send>>;

/// The broker as seen by the choreography core.
///
/// Delivery is at-least-once and ordered within a partition only.
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends a record to a topic and returns where it was stored.
    async fn publish(&self, topic: &str, record: Record) -> Result<RecordPosition>;

    /// Joins `group` on the given topics.
    ///
    /// Each assigned (topic, partition) is yielded once as a
    /// [`PartitionConsumer`] starting at the group's committed offset.
    async fn subscribe(&self, group: &str, topics: &[&str]) -> Result<PartitionStream>;

    /// Releases the broker connection. Pending `next_delivery` calls return `None`.
    async fn close(&self) -> Result<()>;
}
