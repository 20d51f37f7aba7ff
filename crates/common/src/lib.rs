//! Shared identifiers for the order saga choreography.

mod types;

pub use types::OrderId;
