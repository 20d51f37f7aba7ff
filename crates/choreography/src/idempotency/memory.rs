use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Claim, IdempotencyKey, IdempotencyStore};
use crate::error::IdempotencyError;

/// Process-local idempotency store.
///
/// Records are lost on restart, so duplicates across restarts are only
/// caught by the PostgreSQL backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdempotencyStore {
    records: Arc<RwLock<HashMap<IdempotencyKey, Value>>>,
}

impl InMemoryIdempotencyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored keys.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    /// Returns true if no key is stored.
    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<Value>, IdempotencyError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn record_if_absent(
        &self,
        key: &IdempotencyKey,
        value: Value,
    ) -> Result<Claim, IdempotencyError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.get(key) {
            return Ok(Claim::Existing(existing.clone()));
        }
        records.insert(key.clone(), value);
        Ok(Claim::Inserted)
    }

    async fn remove(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn first_record_wins() {
        let store = InMemoryIdempotencyStore::new();
        let key = IdempotencyKey::new("payment", "O1");

        let first = store
            .record_if_absent(&key, json!({"paymentStatus": "SUCCESS"}))
            .await
            .unwrap();
        let second = store
            .record_if_absent(&key, json!({"paymentStatus": "FAILED"}))
            .await
            .unwrap();

        assert_eq!(first, Claim::Inserted);
        assert_eq!(second, Claim::Existing(json!({"paymentStatus": "SUCCESS"})));
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(json!({"paymentStatus": "SUCCESS"}))
        );
    }

    #[tokio::test]
    async fn scopes_are_independent() {
        let store = InMemoryIdempotencyStore::new();

        store
            .record_if_absent(&IdempotencyKey::new("payment", "O1"), json!(1))
            .await
            .unwrap();
        let claim = store
            .record_if_absent(&IdempotencyKey::new("notification", "O1"), json!(2))
            .await
            .unwrap();

        assert_eq!(claim, Claim::Inserted);
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn remove_releases_the_key() {
        let store = InMemoryIdempotencyStore::new();
        let key = IdempotencyKey::new("notification", "O1:order_created");

        store.record_if_absent(&key, json!(true)).await.unwrap();
        store.remove(&key).await.unwrap();
        store.remove(&key).await.unwrap();

        assert!(store.get(&key).await.unwrap().is_none());
        assert_eq!(
            store.record_if_absent(&key, json!(true)).await.unwrap(),
            Claim::Inserted
        );
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let store = InMemoryIdempotencyStore::new();
        let key = IdempotencyKey::new("payment", "O1");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                store.record_if_absent(&key, json!(i)).await.unwrap()
            }));
        }

        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() == Claim::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
    }
}
