use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one order and of the saga instance that follows it.
///
/// The value is opaque: callers may supply their own (`"O1"`), otherwise
/// the order stage assigns a UUIDv4 string. It doubles as the partition key
/// for every event of the saga, so it must never change once assigned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    /// Creates an order ID from an existing value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a new random order ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the order ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if the ID is empty or only whitespace.
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OrderId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for OrderId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for OrderId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_id_generate_creates_unique_ids() {
        let id1 = OrderId::generate();
        let id2 = OrderId::generate();
        assert_ne!(id1, id2);
        assert!(Uuid::parse_str(id1.as_str()).is_ok());
    }

    #[test]
    fn order_id_preserves_caller_value() {
        let id = OrderId::new("O1");
        assert_eq!(id.as_str(), "O1");
        assert_eq!(id.to_string(), "O1");
        assert!(!id.is_blank());
        assert!(OrderId::new("  ").is_blank());
    }

    #[test]
    fn order_id_serializes_as_plain_string() {
        let id = OrderId::from("O2");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"O2\"");
        let deserialized: OrderId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, deserialized);
    }
}
