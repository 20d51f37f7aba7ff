//! Choreography core for the order saga.
//!
//! Each participant consumes the events it subscribes to and publishes
//! events describing what happened; no stage calls another. This crate
//! provides:
//! - [`Publisher`]: fire-and-forget emission with outcome classification
//! - [`ConsumerDispatcher`]: per-partition dispatch with acknowledgement,
//!   redelivery backoff and dead-letter routing
//! - Idempotency stores making at-least-once delivery safe
//! - The order, payment and notification stages
//! - [`SagaTrail`]: saga state reconstructed from the event trail
//!
//! ```text
//! OrderStage ──order_created──┬──► PaymentStage ──payment-succeeded──┐
//!                             └──► NotificationStage ◄───────────────┘
//!                                        │
//!                                        └──► notification-outcomes
//! ```

pub mod dead_letter;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod publisher;
pub mod retry;
pub mod services;
pub mod stages;
pub mod state;
pub mod topics;

pub use dead_letter::{
    DeadLetter, DeadLetterReason, DeadLetterSink, InMemoryDeadLetterSink, LoggingDeadLetterSink,
    TopicDeadLetterSink,
};
pub use dispatcher::{ConsumerDispatcher, DispatchOutcome, DispatcherConfig, EventHandler};
pub use error::{ChoreographyError, IdempotencyError, Result};
pub use idempotency::{
    Claim, IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore, PostgresIdempotencyStore,
};
pub use publisher::{PublishHandle, PublishOutcome, Publisher};
pub use retry::RedeliveryPolicy;
pub use services::{
    InMemoryAuthorizer, InMemoryNotifier, LoggingNotifier, NotificationMessage, Notifier,
    PaymentAuthorizer, RandomAuthorizer,
};
pub use stages::{NotificationStage, OrderStage, PaymentStage, ReceiptStatus, SubmitReceipt};
pub use state::{DEFAULT_TRACKED_ORDERS, SagaState, SagaTracker, SagaTrail};
