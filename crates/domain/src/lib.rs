//! Domain layer for the order saga.
//!
//! This crate provides:
//! - The inbound new-order command and its validation
//! - Value objects (money, product, customer contact)
//! - Typed payloads for every event the choreography exchanges
//! - The [`EventPayload`] trait binding a payload to its event type

pub mod event;
pub mod order;

pub use event::EventPayload;
pub use order::{
    CustomerContact, Money, NewOrder, NotificationOutcome, NotificationStatus, OrderCreated,
    OrderError, PaymentResolved, PaymentStatus, ProductId, SubmitOrderRequest,
};
