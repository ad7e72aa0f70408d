use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Token endpoint used when `OAUTH_TOKEN_URL` is not set.
pub const DEFAULT_TOKEN_URL: &str = "https://accounts.secure.freee.co.jp/public_api/token";

/// Application configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // ── Server ──────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,

    // ── Database ────────────────────────────────────────────────────────
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_acquire_timeout_secs: u64,
    /// Upper bound for any single statement, including row-lock waits.
    pub db_statement_timeout_secs: u64,

    // ── Crypto ──────────────────────────────────────────────────────────
    /// 32-byte base64-encoded key for AES-256-GCM encryption of stored tokens.
    pub token_encryption_key: String,

    // ── Service-to-service auth ─────────────────────────────────────────
    /// Shared secret expected in `x-internal-secret` on privileged routes.
    pub internal_api_key: String,

    // ── OAuth provider ──────────────────────────────────────────────────
    pub provider: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub issuer_timeout_secs: u64,

    // ── Token lifecycle ─────────────────────────────────────────────────
    pub token_skew_secs: i64,
    /// Background keeper period. 0 disables the keeper.
    pub refresh_interval_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("PORT", 8080)?,

            database_url: std::env::var("DATABASE_URL")
                .context("DATABASE_URL is required (PostgreSQL connection string)")?,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 10)?,
            db_acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 5)?,
            db_statement_timeout_secs: env_or("DB_STATEMENT_TIMEOUT_SECS", 10)?,

            token_encryption_key: std::env::var("TOKEN_ENCRYPTION_KEY")
                .context("TOKEN_ENCRYPTION_KEY is required (32 bytes, base64)")?,

            internal_api_key: std::env::var("INTERNAL_API_KEY")
                .context("INTERNAL_API_KEY is required for privileged endpoints")?,

            provider: std::env::var("OAUTH_PROVIDER").unwrap_or_else(|_| "freee".into()),
            token_url: std::env::var("OAUTH_TOKEN_URL")
                .unwrap_or_else(|_| DEFAULT_TOKEN_URL.into()),
            client_id: std::env::var("OAUTH_CLIENT_ID").context("OAUTH_CLIENT_ID is required")?,
            client_secret: std::env::var("OAUTH_CLIENT_SECRET")
                .context("OAUTH_CLIENT_SECRET is required")?,
            issuer_timeout_secs: env_or("OAUTH_TIMEOUT_SECS", 15)?,

            token_skew_secs: env_or("TOKEN_SKEW_SECS", 60)?,
            refresh_interval_secs: env_or("TOKEN_REFRESH_INTERVAL_SECS", 300)?,
        })
    }

    pub fn skew(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_skew_secs)
    }

    pub fn issuer_timeout(&self) -> Duration {
        Duration::from_secs(self.issuer_timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }

    /// Statement and lock-wait budget inside a refresh unit of work. A waiter
    /// must outlast the lock holder's issuer call plus its own statements.
    pub fn unit_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.issuer_timeout_secs + self.db_statement_timeout_secs)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {key}")),
        Err(_) => Ok(default),
    }
}
