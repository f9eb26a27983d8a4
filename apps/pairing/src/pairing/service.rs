use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::errors::PairingError;
use crate::models::pairing::PairingRecord;
use crate::pairing::code::{
    generate_code, generate_pairing_id, normalize_code, normalize_device_name, CodeHasher,
};
use crate::pairing::store::PairingStore;
use crate::pairing::sweeper;
use crate::pairing::token::{bearer_token, TokenSigner};

pub const PAIRING_TTL_MINUTES: i64 = 10;
pub const MAX_ATTEMPTS: i32 = 8;
/// Delay before a locked-out pairing expires.
pub const LOCKOUT_EXPIRY_SECS: i64 = 5;

/// Returned once by [`PairingService::start`]; the code is not recoverable afterwards.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedPairing {
    pub pairing_id: String,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatus {
    pub paired: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPairing {
    pub token: String,
    pub user_id: Uuid,
}

/// Links browser extensions to user accounts via short-lived six-digit codes.
#[derive(Clone)]
pub struct PairingService {
    store: Arc<dyn PairingStore>,
    hasher: CodeHasher,
    signer: TokenSigner,
}

impl PairingService {
    pub fn new(store: Arc<dyn PairingStore>, hasher: CodeHasher, signer: TokenSigner) -> Self {
        Self {
            store,
            hasher,
            signer,
        }
    }

    /// Builds the service from the signing secret, issuer, audience and hash
    /// salt in `config`.
    pub fn from_config(store: Arc<dyn PairingStore>, config: &Config) -> Self {
        Self::new(
            store,
            CodeHasher::new(config.hash_salt.clone()),
            TokenSigner::new(
                &config.token_secret,
                config.token_issuer.clone(),
                config.token_audience.clone(),
            ),
        )
    }

    pub async fn start(
        &self,
        user_id: Uuid,
        device_name: Option<&str>,
    ) -> Result<StartedPairing, PairingError> {
        let pairing_id = generate_pairing_id();
        let code = generate_code();
        let now = Utc::now();
        let expires_at = now + Duration::minutes(PAIRING_TTL_MINUTES);

        let record = PairingRecord {
            pairing_id: pairing_id.clone(),
            user_id,
            device_name: normalize_device_name(device_name),
            code_hash: self.hasher.full_hash(&pairing_id, &code),
            code_only_hash: self.hasher.code_only_hash(&code),
            attempts: 0,
            used_at: None,
            created_at: now,
            expires_at,
        };
        self.store.insert(&record).await.map_err(internal)?;

        info!(
            "Started extension pairing {pairing_id} for user {user_id} ({})",
            record.device_name
        );

        Ok(StartedPairing {
            pairing_id,
            code,
            expires_at,
        })
    }

    /// Reports whether `pairing_id` has been consumed. Only its owner may ask.
    pub async fn status(
        &self,
        user_id: Uuid,
        pairing_id: &str,
    ) -> Result<PairingStatus, PairingError> {
        let record = self
            .store
            .find_by_id(pairing_id)
            .await
            .map_err(internal)?
            .ok_or(PairingError::NotFound)?;

        if record.user_id != user_id {
            warn!("User {user_id} asked for status of pairing {pairing_id} they do not own");
            return Err(PairingError::Forbidden);
        }

        Ok(PairingStatus {
            paired: record.is_used(),
            used_at: record.used_at,
            expires_at: record.expires_at,
        })
    }

    /// Verifies `code` and, on success, consumes the pairing and issues an
    /// extension token. Without `pairing_id` the latest unused pairing whose
    /// code matches is used.
    pub async fn complete(
        &self,
        pairing_id: Option<&str>,
        code: &str,
    ) -> Result<CompletedPairing, PairingError> {
        let code = normalize_code(code);
        if code.is_empty() {
            return Err(PairingError::MissingCode);
        }

        let now = Utc::now();
        let record = match pairing_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(id) => self.store.find_by_id(id).await,
            None => {
                let code_only_hash = self.hasher.code_only_hash(&code);
                self.store
                    .find_latest_active_by_code_hash(&code_only_hash, now)
                    .await
            }
        }
        .map_err(internal)?
        .ok_or(PairingError::NotFound)?;

        check_pending(&record, now)?;

        if !self
            .hasher
            .verify(&record.pairing_id, &code, &record.code_hash)
        {
            return Err(self.record_failure(&record.pairing_id).await);
        }

        let consumed = self
            .store
            .mark_used(&record.pairing_id, now, MAX_ATTEMPTS)
            .await
            .map_err(internal)?;
        if !consumed {
            return Err(self.classify_lost_write(&record.pairing_id, now).await);
        }

        let token = self
            .signer
            .issue(record.user_id, &record.pairing_id)
            .map_err(|e| internal(e.into()))?;

        info!(
            "Completed extension pairing {} for user {}",
            record.pairing_id, record.user_id
        );

        Ok(CompletedPairing {
            token,
            user_id: record.user_id,
        })
    }

    /// Returns the user bound to an extension token in an `Authorization`
    /// header value, or `None` if the header is absent or the token invalid.
    pub fn authenticate_from_header(&self, header_value: Option<&str>) -> Option<Uuid> {
        let token = bearer_token(header_value?)?;
        match self.signer.verify(token) {
            Ok(claims) => Some(claims.user_id),
            Err(e) => {
                debug!("Rejected extension token: {e}");
                None
            }
        }
    }

    /// Deletes pairings whose expiry is at or before `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<u64, PairingError> {
        sweeper::sweep_expired(self.store.as_ref(), now)
            .await
            .map_err(internal)
    }

    async fn record_failure(&self, pairing_id: &str) -> PairingError {
        let attempts = match self.store.record_failed_attempt(pairing_id).await {
            Ok(Some(n)) => n,
            Ok(None) => return PairingError::NotFound,
            Err(e) => return internal(e),
        };

        if attempts < MAX_ATTEMPTS {
            return PairingError::InvalidCode;
        }

        warn!("Pairing {pairing_id} locked after {attempts} failed attempts");
        let lockout = Utc::now() + Duration::seconds(LOCKOUT_EXPIRY_SECS);
        if let Err(e) = self.store.force_expire(pairing_id, lockout).await {
            return internal(e);
        }
        PairingError::TooManyAttempts
    }

    /// Explains why a conditional consume wrote nothing. A concurrent winner
    /// shows up as `already_paired`.
    async fn classify_lost_write(&self, pairing_id: &str, now: DateTime<Utc>) -> PairingError {
        match self.store.find_by_id(pairing_id).await {
            Ok(Some(record)) => match check_pending(&record, now) {
                Err(e) => e,
                Ok(()) => PairingError::AlreadyPaired,
            },
            Ok(None) => PairingError::NotFound,
            Err(e) => internal(e),
        }
    }
}

/// Rejects records that are consumed, expired or locked out.
fn check_pending(record: &PairingRecord, now: DateTime<Utc>) -> Result<(), PairingError> {
    if record.is_used() {
        return Err(PairingError::AlreadyPaired);
    }
    if record.is_expired_at(now) {
        return Err(PairingError::Expired);
    }
    if record.attempts >= MAX_ATTEMPTS {
        return Err(PairingError::TooManyAttempts);
    }
    Ok(())
}

fn internal(e: anyhow::Error) -> PairingError {
    error!("Pairing internal error: {e:?}");
    PairingError::Internal(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pairing::memory::InMemoryPairingStore;
    use crate::pairing::token::ExtensionClaims;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    const SECRET: &str = "test-secret";

    fn signer() -> TokenSigner {
        TokenSigner::new(SECRET, "issuer", "audience")
    }

    fn service() -> (PairingService, Arc<InMemoryPairingStore>) {
        let store = Arc::new(InMemoryPairingStore::new());
        let service = PairingService::new(store.clone(), CodeHasher::new("salt"), signer());
        (service, store)
    }

    /// Any six-digit code other than `code`.
    fn wrong_code(code: &str) -> String {
        if code == "111111" {
            "222222".to_string()
        } else {
            "111111".to_string()
        }
    }

    #[tokio::test]
    async fn test_full_pairing_scenario() {
        let (service, _) = service();
        let user = Uuid::new_v4();
        let started = service.start(user, Some("Chrome")).await.unwrap();

        let status = service.status(user, &started.pairing_id).await.unwrap();
        assert!(!status.paired);
        assert!(status.used_at.is_none());

        let done = service
            .complete(Some(&started.pairing_id), &started.code)
            .await
            .unwrap();
        assert_eq!(done.user_id, user);
        assert!(!done.token.is_empty());

        let status = service.status(user, &started.pairing_id).await.unwrap();
        assert!(status.paired);
        assert!(status.used_at.is_some());

        let again = service
            .complete(Some(&started.pairing_id), &started.code)
            .await;
        assert!(matches!(again, Err(PairingError::AlreadyPaired)));
    }

    #[tokio::test]
    async fn test_from_config_uses_configured_issuer() {
        let config = Config {
            database_url: String::new(),
            rust_log: "info".to_string(),
            token_secret: SECRET.to_string(),
            token_issuer: "issuer".to_string(),
            token_audience: "audience".to_string(),
            hash_salt: "salt".to_string(),
            sweep_interval_secs: 60,
        };
        let service = PairingService::from_config(Arc::new(InMemoryPairingStore::new()), &config);
        let user = Uuid::new_v4();
        let started = service.start(user, None).await.unwrap();
        let done = service
            .complete(Some(&started.pairing_id), &started.code)
            .await
            .unwrap();

        // Tokens from either construction path verify against the same signer.
        assert_eq!(signer().verify(&done.token).unwrap().user_id, user);
    }

    #[tokio::test]
    async fn test_plaintext_code_is_not_stored() {
        let (service, store) = service();
        let started = service.start(Uuid::new_v4(), None).await.unwrap();
        let record = store
            .find_by_id(&started.pairing_id)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.code_hash.contains(&started.code));
        assert!(!record.code_only_hash.contains(&started.code));
        assert_eq!(record.device_name, "Browser extension");
        assert_eq!(
            record.expires_at - record.created_at,
            Duration::minutes(PAIRING_TTL_MINUTES)
        );
    }

    #[tokio::test]
    async fn test_status_serializes_camel_case() {
        let (service, _) = service();
        let user = Uuid::new_v4();
        let started = service.start(user, None).await.unwrap();
        let status = service.status(user, &started.pairing_id).await.unwrap();

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["paired"], false);
        assert!(json["usedAt"].is_null());
        assert!(json["expiresAt"].is_string());
        assert!(json.get("code").is_none());
    }

    #[tokio::test]
    async fn test_status_rejects_other_users() {
        let (service, _) = service();
        let owner = Uuid::new_v4();
        let started = service.start(owner, None).await.unwrap();
        let result = service.status(Uuid::new_v4(), &started.pairing_id).await;
        assert!(matches!(result, Err(PairingError::Forbidden)));

        service
            .complete(Some(&started.pairing_id), &started.code)
            .await
            .unwrap();
        let result = service.status(Uuid::new_v4(), &started.pairing_id).await;
        assert!(matches!(result, Err(PairingError::Forbidden)));
    }

    #[tokio::test]
    async fn test_unknown_pairing_not_found() {
        let (service, _) = service();
        let status = service.status(Uuid::new_v4(), "nope").await;
        assert!(matches!(status, Err(PairingError::NotFound)));
        let complete = service.complete(Some("nope"), "123456").await;
        assert!(matches!(complete, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn test_missing_code() {
        let (service, _) = service();
        let result = service.complete(None, " - ").await;
        assert!(matches!(result, Err(PairingError::MissingCode)));
    }

    #[tokio::test]
    async fn test_code_with_separators_is_accepted() {
        let (service, _) = service();
        let started = service.start(Uuid::new_v4(), None).await.unwrap();
        let spaced = format!("{} {}", &started.code[..3], &started.code[3..]);
        assert!(service
            .complete(Some(&started.pairing_id), &spaced)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_code_only_completion_uses_latest_pairing() {
        let (service, store) = service();
        let user = Uuid::new_v4();
        let started = service.start(user, None).await.unwrap();

        let done = service.complete(None, &started.code).await.unwrap();
        assert_eq!(done.user_id, user);
        let record = store
            .find_by_id(&started.pairing_id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.is_used());

        let again = service.complete(None, &started.code).await;
        assert!(matches!(again, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn test_valid_code_against_wrong_pairing_is_invalid() {
        let (service, _) = service();
        let a = service.start(Uuid::new_v4(), None).await.unwrap();
        let b = service.start(Uuid::new_v4(), None).await.unwrap();

        let result = service.complete(Some(&b.pairing_id), &a.code).await;
        if a.code != b.code {
            assert!(matches!(result, Err(PairingError::InvalidCode)));
        }

        // Pairing A is unaffected.
        assert!(service.complete(Some(&a.pairing_id), &a.code).await.is_ok());
    }

    #[tokio::test]
    async fn test_lockout_after_max_attempts() {
        let (service, store) = service();
        let started = service.start(Uuid::new_v4(), None).await.unwrap();
        let wrong = wrong_code(&started.code);

        for _ in 0..MAX_ATTEMPTS - 1 {
            let result = service.complete(Some(&started.pairing_id), &wrong).await;
            assert!(matches!(result, Err(PairingError::InvalidCode)));
        }
        let result = service.complete(Some(&started.pairing_id), &wrong).await;
        assert!(matches!(result, Err(PairingError::TooManyAttempts)));

        let record = store
            .find_by_id(&started.pairing_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.attempts, MAX_ATTEMPTS);
        assert!(record.expires_at <= Utc::now() + Duration::seconds(LOCKOUT_EXPIRY_SECS));

        let result = service
            .complete(Some(&started.pairing_id), &started.code)
            .await;
        assert!(matches!(
            result,
            Err(PairingError::TooManyAttempts) | Err(PairingError::Expired)
        ));
    }

    #[tokio::test]
    async fn test_expired_pairing_cannot_complete() {
        let (service, store) = service();
        let started = service.start(Uuid::new_v4(), None).await.unwrap();
        store
            .force_expire(&started.pairing_id, Utc::now() - Duration::seconds(1))
            .await
            .unwrap();

        let result = service
            .complete(Some(&started.pairing_id), &started.code)
            .await;
        assert!(matches!(result, Err(PairingError::Expired)));

        // Expired pairings are also invisible to code-only lookup.
        let result = service.complete(None, &started.code).await;
        assert!(matches!(result, Err(PairingError::NotFound)));
    }

    #[tokio::test]
    async fn test_concurrent_completions_have_one_winner() {
        let (service, _) = service();
        let started = service.start(Uuid::new_v4(), None).await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                let id = started.pairing_id.clone();
                let code = started.code.clone();
                tokio::spawn(async move { service.complete(Some(&id), &code).await })
            })
            .collect();

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(matches!(e, PairingError::AlreadyPaired), "got {e:?}"),
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_authenticate_from_issued_token() {
        let (service, _) = service();
        let user = Uuid::new_v4();
        let started = service.start(user, None).await.unwrap();
        let done = service
            .complete(Some(&started.pairing_id), &started.code)
            .await
            .unwrap();

        let header = format!("Bearer {}", done.token);
        assert_eq!(service.authenticate_from_header(Some(&header)), Some(user));
    }

    #[tokio::test]
    async fn test_authenticate_rejects_bad_headers() {
        let (service, _) = service();
        let user = Uuid::new_v4();
        let now = Utc::now();
        let claims = ExtensionClaims {
            sub: user.to_string(),
            subject_type: "extension".to_string(),
            scope: "application_import".to_string(),
            user_id: user,
            pairing_id: "p".to_string(),
            iss: "issuer".to_string(),
            aud: "audience".to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::days(1)).timestamp(),
        };

        let expired = signer()
            .sign(&ExtensionClaims {
                iat: (now - Duration::days(2)).timestamp(),
                exp: (now - Duration::hours(1)).timestamp(),
                ..claims.clone()
            })
            .unwrap();
        let wrong_scope = signer()
            .sign(&ExtensionClaims {
                scope: "full_access".to_string(),
                ..claims.clone()
            })
            .unwrap();
        let wrong_type = signer()
            .sign(&ExtensionClaims {
                subject_type: "user".to_string(),
                ..claims.clone()
            })
            .unwrap();
        let valid = signer().sign(&claims).unwrap();

        assert_eq!(service.authenticate_from_header(None), None);
        assert_eq!(service.authenticate_from_header(Some("")), None);
        assert_eq!(
            service.authenticate_from_header(Some(&format!("Basic {valid}"))),
            None
        );
        assert_eq!(
            service.authenticate_from_header(Some("Bearer not.a.jwt")),
            None
        );
        for token in [expired, wrong_scope, wrong_type] {
            let header = format!("Bearer {token}");
            assert_eq!(service.authenticate_from_header(Some(&header)), None);
        }
        assert_eq!(
            service.authenticate_from_header(Some(&format!("Bearer {valid}"))),
            Some(user)
        );
    }

    /// Store whose first `find_by_id` hands back the unconsumed record while a
    /// competing completion consumes it underneath, so the caller's later
    /// conditional write finds nothing to update.
    struct RacedStore {
        inner: InMemoryPairingStore,
        raced: AtomicBool,
        mark_used_results: StdMutex<Vec<bool>>,
    }

    #[async_trait]
    impl PairingStore for RacedStore {
        async fn insert(&self, record: &PairingRecord) -> anyhow::Result<()> {
            self.inner.insert(record).await
        }

        async fn find_by_id(&self, pairing_id: &str) -> anyhow::Result<Option<PairingRecord>> {
            let snapshot = self.inner.find_by_id(pairing_id).await?;
            if !self.raced.swap(true, Ordering::SeqCst) {
                assert!(self
                    .inner
                    .mark_used(pairing_id, Utc::now(), MAX_ATTEMPTS)
                    .await?);
            }
            Ok(snapshot)
        }

        async fn find_latest_active_by_code_hash(
            &self,
            code_only_hash: &str,
            now: DateTime<Utc>,
        ) -> anyhow::Result<Option<PairingRecord>> {
            self.inner
                .find_latest_active_by_code_hash(code_only_hash, now)
                .await
        }

        async fn record_failed_attempt(&self, pairing_id: &str) -> anyhow::Result<Option<i32>> {
            self.inner.record_failed_attempt(pairing_id).await
        }

        async fn force_expire(&self, pairing_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
            self.inner.force_expire(pairing_id, at).await
        }

        async fn mark_used(
            &self,
            pairing_id: &str,
            now: DateTime<Utc>,
            max_attempts: i32,
        ) -> anyhow::Result<bool> {
            let consumed = self.inner.mark_used(pairing_id, now, max_attempts).await?;
            self.mark_used_results.lock().unwrap().push(consumed);
            Ok(consumed)
        }

        async fn delete_expired(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
            self.inner.delete_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_completion_losing_the_consume_race_is_already_paired() {
        let store = Arc::new(RacedStore {
            inner: InMemoryPairingStore::new(),
            raced: AtomicBool::new(false),
            mark_used_results: StdMutex::new(Vec::new()),
        });
        let service = PairingService::new(store.clone(), CodeHasher::new("salt"), signer());
        let user = Uuid::new_v4();
        let started = service.start(user, None).await.unwrap();

        let result = service
            .complete(Some(&started.pairing_id), &started.code)
            .await;

        assert!(matches!(result, Err(PairingError::AlreadyPaired)));
        assert_eq!(*store.mark_used_results.lock().unwrap(), vec![false]);
        let status = service.status(user, &started.pairing_id).await.unwrap();
        assert!(status.paired);
    }
}
