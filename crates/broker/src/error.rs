use thiserror::Error;

use crate::{EventType, OrderId};

/// Errors that can occur when talking to the broker.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker refused or failed to append a record.
    #[error("Publish to topic '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// A consumer could not be created or subscribed.
    #[error("Subscription to topics {topics:?} failed: {reason}")]
    Subscribe { topics: Vec<String>, reason: String },

    /// Acknowledging a delivery failed. The record may be redelivered.
    #[error("Commit of {topic}/{partition}@{offset} failed: {reason}")]
    Commit {
        topic: String,
        partition: u32,
        offset: u64,
        reason: String,
    },

    /// The connection to the broker could not be established or released.
    #[error("Broker connection error: {0}")]
    Connection(String),

    /// The broker connection has been closed.
    #[error("Broker connection is closed")]
    Closed,
}

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised while building, encoding or decoding an [`EventEnvelope`](crate::EventEnvelope).
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The bytes are not a JSON envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// A required builder field was not set.
    #[error("Missing envelope field: {0}")]
    MissingField(&'static str),

    /// The order ID is empty.
    #[error("Envelope order ID is blank")]
    BlankOrderId,

    /// The partition key differs from the order ID.
    #[error("Envelope key '{key}' does not match order ID '{order_id}'")]
    KeyMismatch { key: String, order_id: OrderId },

    /// The payload belongs to a different order than the envelope.
    #[error("Payload order ID '{payload}' does not match envelope order ID '{envelope}'")]
    OrderIdMismatch { envelope: OrderId, payload: OrderId },

    /// The payload is not a JSON object.
    #[error("Envelope payload must be a JSON object")]
    PayloadNotObject,

    /// The payload does not match the schema of its event type.
    #[error("Invalid {event_type} payload: {source}")]
    Payload {
        event_type: EventType,
        #[source]
        source: serde_json::Error,
    },

    /// The event type name is not recognized.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}
