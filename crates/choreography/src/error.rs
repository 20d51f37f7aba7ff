//! Choreography error types.

use broker::{BrokerError, EnvelopeError};
use domain::OrderError;
use thiserror::Error;

/// Errors that can occur while submitting an order or handling an event.
#[derive(Debug, Error)]
pub enum ChoreographyError {
    /// The inbound order command is malformed.
    #[error("Validation error: {0}")]
    Validation(#[from] OrderError),

    /// An envelope or its payload could not be decoded.
    #[error("Decode error: {0}")]
    Decode(#[from] EnvelopeError),

    /// A broker call made by the dispatcher itself failed.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The payment authorizer failed before producing an outcome.
    #[error("Payment authorization failed: {0}")]
    Authorization(String),

    /// The notification channel failed.
    #[error("Notification delivery failed: {0}")]
    Notification(String),

    /// The idempotency store failed.
    #[error("Idempotency store error: {0}")]
    Idempotency(#[from] IdempotencyError),

    /// The handler panicked. The record is redelivered like any other failure.
    #[error("Handler panicked: {0}")]
    HandlerPanicked(String),

    /// A stored record could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChoreographyError {
    /// Returns false for errors that redelivery cannot fix.
    ///
    /// The dispatcher dead-letters these immediately instead of redelivering.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ChoreographyError::Validation(_)
                | ChoreographyError::Decode(_)
                | ChoreographyError::Serialization(_)
        )
    }
}

/// Convenience type alias for choreography results.
pub type Result<T> = std::result::Result<T, ChoreographyError>;

/// Errors raised by idempotency store backends.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The database rejected a query.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The key kept changing under concurrent inserts and removals.
    #[error("Idempotency key '{0}' is contended")]
    Contended(String),
}
