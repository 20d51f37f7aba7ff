//! Inbound order commands.

use broker::{EventType, OrderId};
use serde::{Deserialize, Serialize};

use super::value_objects::ContactFields;
use super::{CustomerContact, Money, OrderCreated, OrderError, ProductId};

/// Command to place a new order.
///
/// Fields are optional on the wire so that missing values surface as
/// [`OrderError`]s rather than decoding failures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "NewOrderWire")]
pub struct NewOrder {
    /// Caller-supplied order ID. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,

    /// The product being ordered.
    #[serde(default)]
    pub product: Option<String>,

    /// Price in major units.
    #[serde(default)]
    pub price: Option<f64>,

    /// How to reach the customer. Legacy producers send `customerEmail` or
    /// `email`; `customerContact` wins when several are present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_contact: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderWire {
    #[serde(default)]
    order_id: Option<OrderId>,
    #[serde(default)]
    product: Option<String>,
    #[serde(default)]
    price: Option<f64>,
    #[serde(flatten)]
    contact: ContactFields,
}

impl From<NewOrderWire> for NewOrder {
    fn from(wire: NewOrderWire) -> Self {
        Self {
            order_id: wire.order_id,
            product: wire.product,
            price: wire.price,
            customer_contact: wire.contact.into_raw(),
        }
    }
}

impl NewOrder {
    /// Creates a new command for a product at a price.
    pub fn new(product: impl Into<String>, price: f64) -> Self {
        Self {
            product: Some(product.into()),
            price: Some(price),
            ..Self::default()
        }
    }

    /// Sets the order ID.
    pub fn with_order_id(mut self, order_id: impl Into<OrderId>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }

    /// Sets the customer contact.
    pub fn with_contact(mut self, contact: impl Into<String>) -> Self {
        self.customer_contact = Some(contact.into());
        self
    }

    /// Validates the command and produces the `order_created` payload.
    ///
    /// Assigns a fresh order ID when none was supplied. A blank contact is
    /// treated as absent.
    pub fn validate(self) -> Result<OrderCreated, OrderError> {
        let product = self
            .product
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(OrderError::MissingProduct)?;

        let price = Money::try_from(self.price.ok_or(OrderError::MissingPrice)?)?;
        if !price.is_positive() {
            return Err(OrderError::InvalidPrice { price });
        }

        let order_id = match self.order_id {
            Some(id) if id.is_blank() => return Err(OrderError::BlankOrderId),
            Some(id) => id,
            None => OrderId::generate(),
        };

        Ok(OrderCreated {
            order_id,
            product: ProductId::new(product),
            price,
            customer_contact: self.customer_contact.and_then(CustomerContact::parse),
        })
    }
}

/// The inbound envelope accepted by the order ingress: `{topic, message}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitOrderRequest {
    /// Target topic. Only the order topic is accepted; absent means the order topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,

    /// The order command.
    pub message: NewOrder,
}

impl SubmitOrderRequest {
    /// Wraps a command addressed to the order topic.
    pub fn new(message: NewOrder) -> Self {
        Self {
            topic: Some(EventType::OrderCreated.as_str().to_string()),
            message,
        }
    }

    /// Returns the requested topic, defaulting to the order topic.
    pub fn topic(&self) -> &str {
        self.topic
            .as_deref()
            .unwrap_or(EventType::OrderCreated.as_str())
    }

    /// Checks the topic and validates the command.
    pub fn validate(self) -> Result<OrderCreated, OrderError> {
        let expected = EventType::OrderCreated.as_str();
        if self.topic() != expected {
            return Err(OrderError::UnsupportedTopic {
                topic: self.topic().to_string(),
                expected,
            });
        }
        self.message.validate()
    }
}
