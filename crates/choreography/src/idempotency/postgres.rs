use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;

use super::{Claim, IdempotencyKey, IdempotencyStore};
use crate::error::IdempotencyError;

/// Attempts before giving up on a key that is removed between insert and read.
const CLAIM_ATTEMPTS: usize = 3;

/// PostgreSQL-backed idempotency store.
///
/// Uses the `idempotency_keys` table with primary key `(scope, key)`;
/// insert-if-absent is `INSERT ... ON CONFLICT DO NOTHING`.
#[derive(Clone)]
pub struct PostgresIdempotencyStore {
    pool: PgPool,
}

impl PostgresIdempotencyStore {
    /// Creates a new PostgreSQL idempotency store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Deletes records stored before `cutoff` and returns how many were removed.
    pub async fn prune_recorded_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, IdempotencyError> {
        let removed = sqlx::query("DELETE FROM idempotency_keys WHERE recorded_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::debug!(removed, %cutoff, "pruned idempotency records");
        Ok(removed)
    }
}

#[async_trait]
impl IdempotencyStore for PostgresIdempotencyStore {
    async fn get(&self, key: &IdempotencyKey) -> Result<Option<Value>, IdempotencyError> {
        let value = sqlx::query_scalar::<_, Value>(
            "SELECT value FROM idempotency_keys WHERE scope = $1 AND key = $2",
        )
        .bind(key.scope())
        .bind(key.key())
        .fetch_optional(&self.pool)
        .await?;
        Ok(value)
    }

    async fn record_if_absent(
        &self,
        key: &IdempotencyKey,
        value: Value,
    ) -> Result<Claim, IdempotencyError> {
        for _ in 0..CLAIM_ATTEMPTS {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (scope, key, value)
                VALUES ($1, $2, $3)
                ON CONFLICT (scope, key) DO NOTHING
                "#,
            )
            .bind(key.scope())
            .bind(key.key())
            .bind(&value)
            .execute(&self.pool)
            .await?
            .rows_affected();

            if inserted == 1 {
                return Ok(Claim::Inserted);
            }
            if let Some(existing) = self.get(key).await? {
                return Ok(Claim::Existing(existing));
            }
        }
        Err(IdempotencyError::Contended(key.to_string()))
    }

    async fn remove(&self, key: &IdempotencyKey) -> Result<(), IdempotencyError> {
        sqlx::query("DELETE FROM idempotency_keys WHERE scope = $1 AND key = $2")
            .bind(key.scope())
            .bind(key.key())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
