//! The canonical wire shape of every message on the broker.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{EnvelopeError, OrderId};

/// Unique identifier for one envelope instance.
///
/// Used for tracing and dead-letter correlation only. Two redeliveries of the
/// same logical event may carry different IDs if the producer re-emitted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of event an envelope carries.
///
/// `PaymentResolved` keeps the historical wire name `payment-succeeded`: it is
/// emitted when the payment stage finishes, whether the payment succeeded or
/// failed. The outcome lives in the payload's `paymentStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// A validated order entered the saga.
    #[serde(rename = "order_created")]
    OrderCreated,

    /// Reserved by the naming convention; not emitted by the current choreography.
    #[serde(rename = "process_payment")]
    ProcessPayment,

    /// The payment stage produced an outcome (SUCCESS or FAILED).
    #[serde(rename = "payment-succeeded")]
    PaymentResolved,

    /// A notification was handed to the delivery channel.
    #[serde(rename = "notification_sent")]
    NotificationSent,

    /// No notification was sent because no contact was available.
    #[serde(rename = "notification_skipped")]
    NotificationSkipped,
}

impl EventType {
    /// Every event type, in saga order.
    pub const ALL: [EventType; 5] = [
        EventType::OrderCreated,
        EventType::ProcessPayment,
        EventType::PaymentResolved,
        EventType::NotificationSent,
        EventType::NotificationSkipped,
    ];

    /// Returns the wire name of the event type.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::OrderCreated => "order_created",
            EventType::ProcessPayment => "process_payment",
            EventType::PaymentResolved => "payment-succeeded",
            EventType::NotificationSent => "notification_sent",
            EventType::NotificationSkipped => "notification_skipped",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EventType {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EnvelopeError::UnknownEventType(s.to_string()))
    }
}

/// A message exchanged over the broker.
///
/// Envelopes are immutable: fields are only readable, and the one
/// transformation the publisher applies ([`with_produced_at`](Self::with_produced_at))
/// consumes the envelope and returns a new one.
///
/// On the wire an envelope is a JSON object with camelCase keys:
///
/// ```json
/// {"eventId": "…", "eventType": "order_created", "key": "O1", "orderId": "O1",
///  "payload": {"orderId": "O1", "product": "Book", "price": 20.0},
///  "producedAt": "2026-01-01T00:00:00Z"}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    event_id: EventId,
    event_type: EventType,
    key: String,
    order_id: OrderId,
    payload: serde_json::Value,
    produced_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Creates a new envelope builder.
    pub fn builder() -> EventEnvelopeBuilder {
        EventEnvelopeBuilder::default()
    }

    /// Returns the envelope instance ID.
    pub fn event_id(&self) -> EventId {
        self.event_id
    }

    /// Returns the event type.
    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    /// Returns the partition key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the order this event belongs to.
    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Returns the raw JSON payload.
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Returns when the publisher emitted the envelope.
    pub fn produced_at(&self) -> DateTime<Utc> {
        self.produced_at
    }

    /// Deserializes the payload into its typed schema.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        serde_json::from_value(self.payload.clone()).map_err(|source| EnvelopeError::Payload {
            event_type: self.event_type,
            source,
        })
    }

    /// Returns a copy of this envelope stamped with the given emit time.
    pub fn with_produced_at(self, produced_at: DateTime<Utc>) -> Self {
        Self {
            produced_at,
            ..self
        }
    }

    /// Checks the structural invariants of the envelope.
    ///
    /// - the order ID is not blank
    /// - the key equals the order ID
    /// - the payload is a JSON object
    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.order_id.is_blank() {
            return Err(EnvelopeError::BlankOrderId);
        }
        if self.key != self.order_id.as_str() {
            return Err(EnvelopeError::KeyMismatch {
                key: self.key.clone(),
                order_id: self.order_id.clone(),
            });
        }
        if !self.payload.is_object() {
            return Err(EnvelopeError::PayloadNotObject);
        }
        Ok(())
    }

    /// Encodes the envelope as JSON bytes.
    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Malformed)
    }

    /// Decodes and validates an envelope from JSON bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: EventEnvelope =
            serde_json::from_slice(bytes).map_err(EnvelopeError::Malformed)?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// Builder for constructing envelopes.
///
/// The key defaults to the order ID; the emit time defaults to now and is
/// overwritten by the publisher.
#[derive(Debug, Default)]
pub struct EventEnvelopeBuilder {
    event_id: Option<EventId>,
    event_type: Option<EventType>,
    key: Option<String>,
    order_id: Option<OrderId>,
    payload: Option<serde_json::Value>,
    produced_at: Option<DateTime<Utc>>,
}

impl EventEnvelopeBuilder {
    /// Sets the event ID. If not set, a new ID will be generated.
    pub fn event_id(mut self, id: EventId) -> Self {
        self.event_id = Some(id);
        self
    }

    /// Sets the event type.
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    /// Sets the order ID.
    pub fn order_id(mut self, order_id: impl Into<OrderId>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Overrides the partition key. Only useful to build invalid envelopes in tests.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, EnvelopeError> {
        self.payload = Some(serde_json::to_value(payload).map_err(EnvelopeError::Malformed)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Sets the emit time.
    pub fn produced_at(mut self, produced_at: DateTime<Utc>) -> Self {
        self.produced_at = Some(produced_at);
        self
    }

    /// Builds and validates the envelope.
    pub fn build(self) -> Result<EventEnvelope, EnvelopeError> {
        let order_id = self.order_id.ok_or(EnvelopeError::MissingField("orderId"))?;
        let envelope = EventEnvelope {
            event_id: self.event_id.unwrap_or_default(),
            event_type: self
                .event_type
                .ok_or(EnvelopeError::MissingField("eventType"))?,
            key: self.key.unwrap_or_else(|| order_id.as_str().to_string()),
            order_id,
            payload: self.payload.ok_or(EnvelopeError::MissingField("payload"))?,
            produced_at: self.produced_at.unwrap_or_else(Utc::now),
        };
        envelope.validate()?;
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_created(order_id: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .event_type(EventType::OrderCreated)
            .order_id(order_id)
            .payload_raw(json!({"orderId": order_id, "product": "Book", "price": 20}))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_keys_envelope_by_order_id() {
        let envelope = order_created("O1");
        assert_eq!(envelope.key(), "O1");
        assert_eq!(envelope.order_id().as_str(), "O1");
        assert_eq!(envelope.event_type(), EventType::OrderCreated);
    }

    #[test]
    fn builder_rejects_key_mismatch() {
        let result = EventEnvelope::builder()
            .event_type(EventType::OrderCreated)
            .order_id("O1")
            .key("O2")
            .payload_raw(json!({}))
            .build();
        assert!(matches!(result, Err(EnvelopeError::KeyMismatch { .. })));
    }

    #[test]
    fn builder_rejects_missing_fields_and_blank_ids() {
        let missing = EventEnvelope::builder().order_id("O1").build();
        assert!(matches!(missing, Err(EnvelopeError::MissingField("eventType"))));

        let blank = EventEnvelope::builder()
            .event_type(EventType::OrderCreated)
            .order_id(" ")
            .payload_raw(json!({}))
            .build();
        assert!(matches!(blank, Err(EnvelopeError::BlankOrderId)));

        let scalar = EventEnvelope::builder()
            .event_type(EventType::OrderCreated)
            .order_id("O1")
            .payload_raw(json!(42))
            .build();
        assert!(matches!(scalar, Err(EnvelopeError::PayloadNotObject)));
    }

    #[test]
    fn wire_format_uses_camel_case_and_historical_names() {
        let envelope = EventEnvelope::builder()
            .event_type(EventType::PaymentResolved)
            .order_id("O1")
            .payload_raw(json!({"paymentStatus": "FAILED"}))
            .build()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(value["eventType"], "payment-succeeded");
        assert_eq!(value["orderId"], "O1");
        assert_eq!(value["key"], "O1");
        assert!(value.get("producedAt").is_some());
    }

    #[test]
    fn decode_validates_invariants() {
        let bytes = serde_json::to_vec(&json!({
            "eventId": Uuid::new_v4(),
            "eventType": "order_created",
            "key": "other",
            "orderId": "O1",
            "payload": {},
            "producedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(matches!(
            EventEnvelope::decode(&bytes),
            Err(EnvelopeError::KeyMismatch { .. })
        ));

        assert!(matches!(
            EventEnvelope::decode(b"not json"),
            Err(EnvelopeError::Malformed(_))
        ));

        let original = order_created("O3");
        let decoded = EventEnvelope::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_event_type_fails_to_decode() {
        let bytes = serde_json::to_vec(&json!({
            "eventId": Uuid::new_v4(),
            "eventType": "order_shipped",
            "key": "O1",
            "orderId": "O1",
            "payload": {},
            "producedAt": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert!(EventEnvelope::decode(&bytes).is_err());
        assert!("order_shipped".parse::<EventType>().is_err());
    }

    #[test]
    fn event_type_round_trips_through_its_name() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
    }

    #[test]
    fn with_produced_at_keeps_everything_else() {
        let envelope = order_created("O1");
        let at = DateTime::parse_from_rfc3339("2030-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let stamped = envelope.clone().with_produced_at(at);
        assert_eq!(stamped.produced_at(), at);
        assert_eq!(stamped.event_id(), envelope.event_id());
        assert_eq!(stamped.payload(), envelope.payload());
    }

    #[test]
    fn payload_as_reports_event_type_on_mismatch() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            missing: String,
        }
        let err = order_created("O1").payload_as::<Needs>().unwrap_err();
        assert!(err.to_string().contains("order_created"));
    }
}
