//! Payloads carried by the choreography's events.

use broker::{EventType, OrderId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::EventPayload;

use super::value_objects::ContactFields;
use super::{CustomerContact, Money, ProductId};

/// Payload of `order_created`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "OrderCreatedWire")]
pub struct OrderCreated {
    /// The saga instance.
    pub order_id: OrderId,

    /// The product ordered.
    pub product: ProductId,

    /// Amount to charge.
    pub price: Money,

    /// How to reach the customer, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_contact: Option<CustomerContact>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreatedWire {
    order_id: OrderId,
    product: ProductId,
    price: Money,
    #[serde(flatten)]
    contact: ContactFields,
}

impl From<OrderCreatedWire> for OrderCreated {
    fn from(wire: OrderCreatedWire) -> Self {
        Self {
            order_id: wire.order_id,
            product: wire.product,
            price: wire.price,
            customer_contact: wire.contact.into_contact(),
        }
    }
}

impl OrderCreated {
    /// Returns the contact if one is present and not blank.
    pub fn contact(&self) -> Option<&CustomerContact> {
        self.customer_contact.as_ref().filter(|c| !c.is_blank())
    }
}

impl EventPayload for OrderCreated {
    fn event_type(&self) -> EventType {
        EventType::OrderCreated
    }

    fn order_id(&self) -> &OrderId {
        &self.order_id
    }
}

/// Outcome of a payment authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
}

impl PaymentStatus {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Success => "SUCCESS",
            PaymentStatus::Failed => "FAILED",
        }
    }

    /// Returns true for `SUCCESS`.
    pub fn is_success(&self) -> bool {
        matches!(self, PaymentStatus::Success)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of `payment-succeeded`, emitted for both outcomes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "PaymentResolvedWire")]
pub struct PaymentResolved {
    /// The saga instance.
    pub order_id: OrderId,

    /// SUCCESS or FAILED.
    pub payment_status: PaymentStatus,

    /// Amount charged or declined.
    pub amount: Money,

    /// Contact copied from the order, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_contact: Option<CustomerContact>,

    /// Human-readable summary.
    pub message: String,

    /// When the authorizer decided.
    pub processed_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResolvedWire {
    order_id: OrderId,
    payment_status: PaymentStatus,
    amount: Money,
    #[serde(flatten)]
    contact: ContactFields,
    message: String,
    #[serde(alias = "timestamp")]
    processed_at: DateTime<Utc>,
}

impl From<PaymentResolvedWire> for PaymentResolved {
    fn from(wire: PaymentResolvedWire) -> Self {
        Self {
            order_id: wire.order_id,
            payment_status: wire.payment_status,
            amount: wire.amount,
            customer_contact: wire.contact.into_contact(),
            message: wire.message,
            processed_at: wire.processed_at,
        }
    }
}

impl PaymentResolved {
    /// Builds the outcome for an order, timestamped now.
    pub fn for_order(order: &OrderCreated, payment_status: PaymentStatus) -> Self {
        Self {
            order_id: order.order_id.clone(),
            payment_status,
            amount: order.price,
            customer_contact: order.contact().cloned(),
            message: format!("Payment processed for order {}", order.order_id),
            processed_at: Utc::now(),
        }
    }

    /// Returns the contact if one is present and not blank.
    pub fn contact(&self) -> Option<&CustomerContact> {
        self.customer_contact.as_ref().filter(|c| !c.is_blank())
    }
}

impl EventPayload for PaymentResolved {
    fn event_type(&self) -> EventType {
        EventType::PaymentResolved
    }

    fn order_id(&self) -> &OrderId {
        &self.order_id
    }
}

/// Whether a notification went out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Sent,
    Skipped,
}

impl NotificationStatus {
    /// Returns the wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Sent => "sent",
            NotificationStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of `notification_sent` and `notification_skipped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationOutcome {
    /// The saga instance.
    pub order_id: OrderId,

    /// The event that triggered the notification.
    #[serde(rename = "type")]
    pub trigger: EventType,

    /// Sent or skipped.
    pub status: NotificationStatus,

    /// Who was notified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<CustomerContact>,

    /// Why nothing was sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// When the outcome was decided.
    pub timestamp: DateTime<Utc>,
}

impl NotificationOutcome {
    /// Reason recorded when the payload carries no contact.
    pub const NO_CONTACT: &'static str = "no contact";

    /// A notification was handed to the delivery channel.
    pub fn sent(order_id: OrderId, trigger: EventType, recipient: CustomerContact) -> Self {
        Self {
            order_id,
            trigger,
            status: NotificationStatus::Sent,
            recipient: Some(recipient),
            reason: None,
            timestamp: Utc::now(),
        }
    }

    /// Nothing was sent.
    pub fn skipped(order_id: OrderId, trigger: EventType, reason: impl Into<String>) -> Self {
        Self {
            order_id,
            trigger,
            status: NotificationStatus::Skipped,
            recipient: None,
            reason: Some(reason.into()),
            timestamp: Utc::now(),
        }
    }
}

impl EventPayload for NotificationOutcome {
    fn event_type(&self) -> EventType {
        match self.status {
            NotificationStatus::Sent => EventType::NotificationSent,
            NotificationStatus::Skipped => EventType::NotificationSkipped,
        }
    }

    fn order_id(&self) -> &OrderId {
        &self.order_id
    }
}
