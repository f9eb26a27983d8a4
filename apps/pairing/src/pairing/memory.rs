use std::collections::HashMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::pairing::PairingRecord;
use crate::pairing::store::PairingStore;

/// In-process store for tests and local runs without Postgres.
///
/// Each method takes the map lock once, so a predicate check and its write
/// happen under the same guard.
#[derive(Default)]
pub struct InMemoryPairingStore {
    records: Mutex<HashMap<String, PairingRecord>>,
}

impl InMemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub async fn count(&self) -> usize {
        self.records.lock().await.len()
    }
}

#[async_trait]
impl PairingStore for InMemoryPairingStore {
    async fn insert(&self, record: &PairingRecord) -> Result<()> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.pairing_id) {
            bail!("duplicate pairing id {}", record.pairing_id);
        }
        records.insert(record.pairing_id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, pairing_id: &str) -> Result<Option<PairingRecord>> {
        Ok(self.records.lock().await.get(pairing_id).cloned())
    }

    async fn find_latest_active_by_code_hash(
        &self,
        code_only_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PairingRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.code_only_hash == code_only_hash)
            .filter(|r| !r.is_used() && !r.is_expired_at(now))
            .max_by_key(|r| r.created_at)
            .cloned())
    }

    async fn record_failed_attempt(&self, pairing_id: &str) -> Result<Option<i32>> {
        let mut records = self.records.lock().await;
        Ok(records.get_mut(pairing_id).map(|r| {
            r.attempts += 1;
            r.attempts
        }))
    }

    async fn force_expire(&self, pairing_id: &str, at: DateTime<Utc>) -> Result<()> {
        if let Some(r) = self.records.lock().await.get_mut(pairing_id) {
            r.expires_at = r.expires_at.min(at);
        }
        Ok(())
    }

    async fn mark_used(
        &self,
        pairing_id: &str,
        now: DateTime<Utc>,
        max_attempts: i32,
    ) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(pairing_id) {
            Some(r) if !r.is_used() && !r.is_expired_at(now) && r.attempts < max_attempts => {
                r.used_at = Some(now);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, r| !r.is_expired_at(now));
        Ok((before - records.len()) as u64)
    }
}
