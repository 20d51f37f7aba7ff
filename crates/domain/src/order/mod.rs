//! Order command, value objects and event payloads.

mod commands;
mod events;
mod value_objects;

pub use commands::{NewOrder, SubmitOrderRequest};
pub use events::{
    NotificationOutcome, NotificationStatus, OrderCreated, PaymentResolved, PaymentStatus,
};
pub use value_objects::{CustomerContact, Money, ProductId};

use thiserror::Error;

/// Errors raised while validating a new-order command.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrderError {
    /// The command names no product.
    #[error("Product is required")]
    MissingProduct,

    /// The command carries no price.
    #[error("Price is required")]
    MissingPrice,

    /// The price is zero or negative.
    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: Money },

    /// The amount cannot be represented in cents.
    #[error("Invalid amount: {value}")]
    InvalidAmount { value: f64 },

    /// A caller-supplied order ID is blank.
    #[error("Order ID must not be blank")]
    BlankOrderId,

    /// The command targets a topic other than the order topic.
    #[error("Unsupported topic '{topic}' (expected '{expected}')")]
    UnsupportedTopic {
        topic: String,
        expected: &'static str,
    },
}
