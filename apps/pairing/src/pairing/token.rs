//! Scoped bearer tokens issued to a paired browser extension.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const SUBJECT_TYPE_EXTENSION: &str = "extension";
pub const SCOPE_APPLICATION_IMPORT: &str = "application_import";
pub const TOKEN_TTL_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    #[error("Token subject type or scope does not match an extension token")]
    WrongShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionClaims {
    pub sub: String,
    pub subject_type: String,
    pub scope: String,
    pub user_id: Uuid,
    pub pairing_id: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub exp: i64,
}

/// HS256 signer/verifier for extension tokens.
#[derive(Clone)]
pub struct TokenSigner {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    audience: String,
}

impl TokenSigner {
    pub fn new(secret: &str, issuer: impl Into<String>, audience: impl Into<String>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            issuer: issuer.into(),
            audience: audience.into(),
        }
    }

    /// Issues a 30-day `application_import` token for `user_id`.
    pub fn issue(&self, user_id: Uuid, pairing_id: &str) -> Result<String, TokenError> {
        let now = Utc::now();
        self.sign(&ExtensionClaims {
            sub: user_id.to_string(),
            subject_type: SUBJECT_TYPE_EXTENSION.to_string(),
            scope: SCOPE_APPLICATION_IMPORT.to_string(),
            user_id,
            pairing_id: pairing_id.to_string(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::days(TOKEN_TTL_DAYS)).timestamp(),
        })
    }

    pub fn sign(&self, claims: &ExtensionClaims) -> Result<String, TokenError> {
        Ok(encode(&Header::new(Algorithm::HS256), claims, &self.encoding)?)
    }

    /// Verifies signature, issuer, audience and expiry, then the extension
    /// subject type and scope.
    pub fn verify(&self, token: &str) -> Result<ExtensionClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);
        validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);
        validation.leeway = 0;

        let claims = decode::<ExtensionClaims>(token, &self.decoding, &validation)?.claims;
        if claims.subject_type != SUBJECT_TYPE_EXTENSION || claims.scope != SCOPE_APPLICATION_IMPORT
        {
            return Err(TokenError::WrongShape);
        }
        Ok(claims)
    }
}

/// Pulls the token out of an `Authorization: Bearer <token>` value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    let (scheme, token) = header_value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
