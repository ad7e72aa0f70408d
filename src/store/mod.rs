//! Credential store — one OAuth credential row per provider.
//!
//! `CredentialStore` is the seam between the token lifecycle manager and
//! durable storage. Besides plain `get`/`put` it hands out a
//! `CredentialUnit`: an atomic unit of work scoped to one provider, inside
//! which a re-read and the following write cannot interleave with another
//! caller's unit for the same provider.

pub mod db;
pub mod memory;

pub use db::PgCredentialStore;
pub use memory::MemoryCredentialStore;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BrokerError;

/// Stored credential for one provider.
///
/// `expires_at` is already reduced by the skew margin at write time, so a
/// record is usable exactly while `expires_at > now`.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub provider: String,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl CredentialRecord {
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("provider", &self.provider)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Full replacement for a provider's row.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialWrite {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl fmt::Debug for CredentialWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialWrite")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Latest committed record for `provider`, if one was ever seeded.
    async fn get(&self, provider: &str) -> Result<Option<CredentialRecord>, BrokerError>;

    /// Insert-or-replace the row for `provider` in one statement.
    async fn put(&self, provider: &str, write: &CredentialWrite) -> Result<(), BrokerError>;

    /// Open an atomic unit of work for `provider`.
    async fn begin(&self, provider: &str) -> Result<Box<dyn CredentialUnit>, BrokerError>;
}

/// Atomic unit of work over a single provider's row.
///
/// Dropping a unit without calling `commit` discards everything written
/// through it.
#[async_trait]
pub trait CredentialUnit: Send {
    /// Read the row and hold it until the unit ends.
    async fn get(&mut self) -> Result<Option<CredentialRecord>, BrokerError>;

    async fn put(&mut self, write: &CredentialWrite) -> Result<(), BrokerError>;

    async fn commit(self: Box<Self>) -> Result<(), BrokerError>;
}
