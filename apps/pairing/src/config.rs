use anyhow::{Context, Result};

/// Signing secret used when no secret variable is set. Local development only.
pub const DEV_TOKEN_SECRET: &str = "dev-extension-token-secret-change-me";

/// Checked in order; the first non-empty value wins.
const TOKEN_SECRET_VARS: [&str; 3] = ["EXTENSION_TOKEN_SECRET", "JWT_SECRET", "AUTH_SECRET"];

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub rust_log: String,
    pub token_secret: String,
    pub token_issuer: String,
    pub token_audience: String,
    pub hash_salt: String,
    pub sweep_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let token_secret = resolve_token_secret(|key| std::env::var(key).ok());
        let hash_salt = optional_env("PAIRING_HASH_SALT").unwrap_or_else(|| token_secret.clone());

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            token_secret,
            token_issuer: optional_env("EXTENSION_TOKEN_ISSUER")
                .unwrap_or_else(|| "application-tracker".to_string()),
            token_audience: optional_env("EXTENSION_TOKEN_AUDIENCE")
                .unwrap_or_else(|| "application-tracker-extension".to_string()),
            hash_salt,
            sweep_interval_secs: std::env::var("PAIRING_SWEEP_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse::<u64>()
                .context("PAIRING_SWEEP_INTERVAL_SECS must be a whole number of seconds")?,
        })
    }
}

/// Picks the first non-empty signing secret from `lookup`, falling back to
/// [`DEV_TOKEN_SECRET`].
pub fn resolve_token_secret<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    for key in TOKEN_SECRET_VARS {
        if let Some(value) = lookup(key) {
            let value = value.trim();
            if !value.is_empty() {
                return value.to_string();
            }
        }
    }
    DEV_TOKEN_SECRET.to_string()
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
