//! PostgreSQL-backed credential store.
//!
//! Table `oauth_token`, one row per provider. Tokens are sealed with
//! AES-256-GCM before they touch the database. The pool connects lazily and
//! the schema is created on first use, so the service can boot before the
//! database is reachable and report `StorageUnavailable` until it is.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use tokio::sync::OnceCell;

use super::{CredentialRecord, CredentialStore, CredentialUnit, CredentialWrite};
use crate::config::Config;
use crate::crypto::TokenCipher;
use crate::error::BrokerError;

const SELECT_RECORD: &str = r#"
    SELECT provider, access_token, refresh_token, expires_at, token_type, scope, updated_at
    FROM oauth_token
    WHERE provider = $1
"#;

const UPSERT_RECORD: &str = r#"
    INSERT INTO oauth_token
        (provider, access_token, refresh_token, expires_at, token_type, scope, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, NOW())
    ON CONFLICT (provider)
    DO UPDATE SET
        access_token = EXCLUDED.access_token,
        refresh_token = EXCLUDED.refresh_token,
        expires_at = EXCLUDED.expires_at,
        token_type = EXCLUDED.token_type,
        scope = EXCLUDED.scope,
        updated_at = NOW()
"#;

/// Lock-wait budget for units when none is configured.
const DEFAULT_UNIT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct PgCredentialStore {
    pool: PgPool,
    cipher: Arc<TokenCipher>,
    schema: OnceCell<()>,
    unit_timeout: Duration,
}

impl PgCredentialStore {
    /// Build a lazily-connecting pool with bounded acquire, statement and
    /// lock-wait timeouts. Units of work get the longer
    /// `Config::unit_lock_timeout`, since they wait on a row lock held across
    /// an issuer call.
    pub fn connect(config: &Config, cipher: TokenCipher) -> Result<Self, BrokerError> {
        let statement_timeout = format!("{}s", config.db_statement_timeout_secs);
        let options = PgConnectOptions::from_str(&config.database_url)
            .map_err(|e| BrokerError::Internal(format!("Invalid DATABASE_URL: {e}")))?
            .options([
                ("statement_timeout", statement_timeout.as_str()),
                ("lock_timeout", statement_timeout.as_str()),
            ]);

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .connect_lazy_with(options);

        Ok(Self::with_pool(pool, cipher).with_unit_timeout(config.unit_lock_timeout()))
    }

    pub fn with_pool(pool: PgPool, cipher: TokenCipher) -> Self {
        Self {
            pool,
            cipher: Arc::new(cipher),
            schema: OnceCell::new(),
            unit_timeout: DEFAULT_UNIT_TIMEOUT,
        }
    }

    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = timeout;
        self
    }

    /// Create the table once per process; later calls are no-ops.
    pub async fn ensure_schema(&self) -> Result<(), BrokerError> {
        self.schema.get_or_try_init(|| self.migrate()).await?;
        Ok(())
    }

    async fn migrate(&self) -> Result<(), BrokerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS oauth_token (
                provider      TEXT PRIMARY KEY,
                access_token  TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at    TIMESTAMPTZ NOT NULL,
                token_type    TEXT,
                scope         TEXT,
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        tracing::info!("Credential schema ready");
        Ok(())
    }

}

/// Transaction-local overrides of the pool-wide timeouts, in milliseconds.
fn unit_timeout_statements(timeout: Duration) -> [String; 2] {
    let millis = timeout.as_millis();
    [
        format!("SET LOCAL lock_timeout = {millis}"),
        format!("SET LOCAL statement_timeout = {millis}"),
    ]
}

fn decode_row(cipher: &TokenCipher, row: &PgRow) -> Result<CredentialRecord, BrokerError> {
    let sealed_access: String = row.try_get("access_token")?;
    let sealed_refresh: String = row.try_get("refresh_token")?;
    let expires_at: DateTime<Utc> = row.try_get("expires_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(CredentialRecord {
        provider: row.try_get("provider")?,
        access_token: cipher.open(&sealed_access)?,
        refresh_token: cipher.open(&sealed_refresh)?,
        expires_at,
        token_type: row.try_get("token_type")?,
        scope: row.try_get("scope")?,
        updated_at,
    })
}

async fn upsert<'e, E: PgExecutor<'e>>(
    executor: E,
    cipher: &TokenCipher,
    provider: &str,
    write: &CredentialWrite,
) -> Result<(), BrokerError> {
    let sealed_access = cipher.seal(&write.access_token)?;
    let sealed_refresh = cipher.seal(&write.refresh_token)?;

    sqlx::query(UPSERT_RECORD)
        .bind(provider)
        .bind(&sealed_access)
        .bind(&sealed_refresh)
        .bind(write.expires_at)
        .bind(&write.token_type)
        .bind(&write.scope)
        .execute(executor)
        .await?;

    Ok(())
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn get(&self, provider: &str) -> Result<Option<CredentialRecord>, BrokerError> {
        self.ensure_schema().await?;

        let row = sqlx::query(SELECT_RECORD)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| decode_row(&self.cipher, &r)).transpose()
    }

    async fn put(&self, provider: &str, write: &CredentialWrite) -> Result<(), BrokerError> {
        self.ensure_schema().await?;
        upsert(&self.pool, &self.cipher, provider, write).await
    }

    async fn begin(&self, provider: &str) -> Result<Box<dyn CredentialUnit>, BrokerError> {
        self.ensure_schema().await?;
        let mut tx = self.pool.begin().await?;
        for statement in unit_timeout_statements(self.unit_timeout) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        Ok(Box::new(PgCredentialUnit {
            tx,
            provider: provider.to_string(),
            cipher: self.cipher.clone(),
        }))
    }
}

/// Transaction-backed unit. The re-read takes a row lock (`FOR UPDATE`), so a
/// second caller's unit blocks until this one commits or rolls back.
struct PgCredentialUnit {
    tx: Transaction<'static, Postgres>,
    provider: String,
    cipher: Arc<TokenCipher>,
}

#[async_trait]
impl CredentialUnit for PgCredentialUnit {
    async fn get(&mut self) -> Result<Option<CredentialRecord>, BrokerError> {
        let sql = format!("{SELECT_RECORD} FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(&self.provider)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.map(|r| decode_row(&self.cipher, &r)).transpose()
    }

    async fn put(&mut self, write: &CredentialWrite) -> Result<(), BrokerError> {
        upsert(&mut *self.tx, &self.cipher, &self.provider, write).await
    }

    async fn commit(self: Box<Self>) -> Result<(), BrokerError> {
        self.tx.commit().await?;
        Ok(())
    }
}
