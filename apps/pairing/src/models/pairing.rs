use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One device-pairing attempt as persisted in `extension_pairings`.
///
/// The plaintext code is never stored, only the two hashes derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PairingRecord {
    pub pairing_id: String,
    pub user_id: Uuid,
    pub device_name: String,
    pub code_hash: String,
    pub code_only_hash: String,
    pub attempts: i32,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PairingRecord {
    pub fn is_used(&self) -> bool {
        self.used_at.is_some()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
