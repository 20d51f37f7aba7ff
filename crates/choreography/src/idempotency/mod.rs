//! Keyed "already processed" records that make at-least-once delivery safe.
//!
//! Each stage owns its store; nothing is shared across stages.

mod memory;
mod postgres;

pub use memory::InMemoryIdempotencyStore;
pub use postgres::PostgresIdempotencyStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::IdempotencyError;

/// Identifies one logical operation: a scope (the owning stage) and a key
/// within it (usually derived from the order ID).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    scope: String,
    key: String,
}

impl IdempotencyKey {
    /// Creates a key.
    pub fn new(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
        }
    }

    /// Returns the scope.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Returns the key within the scope.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.scope, self.key)
    }
}

/// Result of [`IdempotencyStore::record_if_absent`].
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    /// This call stored the value.
    Inserted,
    /// A value was already stored; it is returned unchanged.
    Existing(Value),
}

/// Trait for idempotency store backends.
///
/// Implementations must make `record_if_absent` atomic: of two concurrent
/// calls for the same key exactly one observes [`Claim::Inserted`].
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Returns the stored value for a key.
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<Value>, IdempotencyError>;

    /// Stores a value unless the key already has one.
    async fn record_if_absent(
        &self,
        key: &IdempotencyKey,
        value: Value,
    ) -> Result<Claim, IdempotencyError>;

    /// Forgets a key. Removing an absent key is not an error.
    async fn remove(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError>;
}
