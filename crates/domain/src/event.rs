//! Binding between typed payloads and event envelopes.

use broker::{EnvelopeError, EventEnvelope, EventType, OrderId};
use serde::{Serialize, de::DeserializeOwned};

/// Trait for event payloads.
///
/// A payload knows which event type carries it and which saga instance it
/// belongs to, so it can be wrapped into an envelope keyed by its order ID.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// Returns the event type this payload travels under.
    fn event_type(&self) -> EventType;

    /// Returns the order this payload belongs to.
    fn order_id(&self) -> &OrderId;

    /// Wraps the payload into a validated envelope keyed by its order ID.
    fn to_envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        EventEnvelope::builder()
            .event_type(self.event_type())
            .order_id(self.order_id().clone())
            .payload(self)?
            .build()
    }

    /// Decodes the payload carried by an envelope.
    ///
    /// The payload's order ID must equal the envelope's: the envelope's ID is
    /// the partition key and the key every idempotency record is stored under.
    fn from_envelope(envelope: &EventEnvelope) -> Result<Self, EnvelopeError> {
        let payload: Self = envelope.payload_as()?;
        if payload.order_id() != envelope.order_id() {
            return Err(EnvelopeError::OrderIdMismatch {
                envelope: envelope.order_id().clone(),
                payload: payload.order_id().clone(),
            });
        }
        Ok(payload)
    }
}
