//! Persistence seam for pairing records.
//!
//! Every mutating method is a single conditional write so concurrent
//! verifications are serialised by the store itself, not by the caller.
//! `PairingService` holds an `Arc<dyn PairingStore>`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::pairing::PairingRecord;

#[async_trait]
pub trait PairingStore: Send + Sync {
    /// Inserts a new record. Fails if `pairing_id` already exists.
    async fn insert(&self, record: &PairingRecord) -> Result<()>;

    async fn find_by_id(&self, pairing_id: &str) -> Result<Option<PairingRecord>>;

    /// Most recently created record with this code-only hash that is unused
    /// and unexpired at `now`.
    async fn find_latest_active_by_code_hash(
        &self,
        code_only_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PairingRecord>>;

    /// Atomically increments `attempts`, returning the new count, or `None`
    /// if the record does not exist.
    async fn record_failed_attempt(&self, pairing_id: &str) -> Result<Option<i32>>;

    /// Lowers `expires_at` to `at`. An earlier expiry is left unchanged.
    async fn force_expire(&self, pairing_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Sets `used_at = now` only if the record is still unused, unexpired and
    /// below `max_attempts`. Returns whether this call performed the write.
    async fn mark_used(&self, pairing_id: &str, now: DateTime<Utc>, max_attempts: i32)
        -> Result<bool>;

    /// Deletes records whose expiry is at or before `now`, returning how many were removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// PostgreSQL-backed store over the `extension_pairings` table.
#[derive(Clone)]
pub struct PgPairingStore {
    pool: PgPool,
}

impl PgPairingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PairingStore for PgPairingStore {
    async fn insert(&self, record: &PairingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO extension_pairings
                (pairing_id, user_id, device_name, code_hash, code_only_hash,
                 attempts, used_at, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&record.pairing_id)
        .bind(record.user_id)
        .bind(&record.device_name)
        .bind(&record.code_hash)
        .bind(&record.code_only_hash)
        .bind(record.attempts)
        .bind(record.used_at)
        .bind(record.created_at)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, pairing_id: &str) -> Result<Option<PairingRecord>> {
        Ok(sqlx::query_as::<_, PairingRecord>(
            "SELECT * FROM extension_pairings WHERE pairing_id = $1",
        )
        .bind(pairing_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn find_latest_active_by_code_hash(
        &self,
        code_only_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PairingRecord>> {
        Ok(sqlx::query_as::<_, PairingRecord>(
            r#"
            SELECT *
            FROM extension_pairings
            WHERE code_only_hash = $1
              AND used_at IS NULL
              AND expires_at > $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(code_only_hash)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn record_failed_attempt(&self, pairing_id: &str) -> Result<Option<i32>> {
        Ok(sqlx::query_scalar::<_, i32>(
            r#"
            UPDATE extension_pairings
            SET attempts = attempts + 1
            WHERE pairing_id = $1
            RETURNING attempts
            "#,
        )
        .bind(pairing_id)
        .fetch_optional(&self.pool)
        .await?)
    }

    async fn force_expire(&self, pairing_id: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE extension_pairings SET expires_at = LEAST(expires_at, $2) WHERE pairing_id = $1",
        )
        .bind(pairing_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_used(
        &self,
        pairing_id: &str,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE extension_pairings
            SET used_at = $2
            WHERE pairing_id = $1
              AND used_at IS NULL
              AND expires_at > $2
              AND attempts < $3
            "#,
        )
        .bind(pairing_id)
        .bind(now)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM extension_pairings WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
