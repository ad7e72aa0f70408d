use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use super::clock::{Clock, SystemClock};
use crate::error::BrokerError;
use crate::providers::{IssuedToken, ProviderRegistry};
use crate::store::{CredentialRecord, CredentialStore, CredentialWrite};

/// Safety margin subtracted from every provider-reported expiry.
pub const DEFAULT_SKEW_SECS: i64 = 60;

/// Lifetime assumed when the issuer omits `expires_in`.
pub const DEFAULT_EXPIRES_IN_SECS: i64 = 21_600;

/// Issuer-reported lifetimes above this are capped.
pub const MAX_EXPIRES_IN_SECS: i64 = 366 * 24 * 60 * 60;

/// An access token that is valid right now.
#[derive(Clone, Serialize)]
pub struct AccessToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    /// Whether this call had to go to the issuer.
    pub refreshed: bool,
}

impl AccessToken {
    fn cached(record: CredentialRecord) -> Self {
        Self {
            access_token: record.access_token,
            expires_at: record.expires_at,
            refreshed: false,
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .field("refreshed", &self.refreshed)
            .finish_non_exhaustive()
    }
}

/// Hands out valid access tokens, refreshing stale ones exactly once.
///
/// Stored `expires_at` values already carry the skew margin, so the read
/// side only compares against `now`. Every write path (refresh and seed)
/// subtracts the same `skew`.
pub struct TokenManager {
    pub(super) store: Arc<dyn CredentialStore>,
    pub(super) registry: ProviderRegistry,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) skew: Duration,
}

impl TokenManager {
    pub fn new(store: Arc<dyn CredentialStore>, registry: ProviderRegistry) -> Self {
        Self {
            store,
            registry,
            clock: Arc::new(SystemClock),
            skew: Duration::seconds(DEFAULT_SKEW_SECS),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Providers with a registered issuer.
    pub fn providers(&self) -> Vec<&str> {
        self.registry.list()
    }

    /// Return an access token for `provider` that is valid now.
    ///
    /// Fast path: a fresh stored token is returned with no write and no
    /// network call. Otherwise the store's unit of work is opened and the
    /// record re-read under it; if a concurrent caller already refreshed,
    /// that result is returned. Only a record that is still stale under the
    /// unit reaches the issuer, and the new token is committed before
    /// returning. Any issuer failure drops the unit, leaving storage as it was;
    /// the one write on a failed refresh is a rotated refresh token from a 2xx
    /// body that was otherwise unusable.
    #[instrument(skip(self))]
    pub async fn get_valid_access_token(&self, provider: &str) -> Result<AccessToken, BrokerError> {
        let record = self
            .store
            .get(provider)
            .await?
            .ok_or_else(|| BrokerError::CredentialNotSeeded(provider.to_string()))?;

        if record.is_fresh_at(self.clock.now()) {
            return Ok(AccessToken::cached(record));
        }

        debug!(expires_at = %record.expires_at, "Access token stale, refreshing");

        let mut unit = self.store.begin(provider).await?;
        let record = unit
            .get()
            .await?
            .ok_or_else(|| BrokerError::CredentialNotSeeded(provider.to_string()))?;

        if record.is_fresh_at(self.clock.now()) {
            debug!("Refresh already completed by a concurrent caller");
            return Ok(AccessToken::cached(record));
        }

        let issuer = self
            .registry
            .get(provider)
            .ok_or_else(|| BrokerError::UnknownProvider(provider.to_string()))?;

        let issued = match issuer.refresh(&record.refresh_token).await {
            Ok(issued) => issued,
            Err(e) => {
                warn!("Token refresh failed: {e}");
                return Err(e);
            }
        };

        let rotated = issued.refresh_token.is_some();
        let write = match refreshed_write(&record, issued, self.clock.now(), self.skew) {
            Ok(write) => write,
            Err(unusable) => {
                if let Some(refresh_token) = unusable.rotated {
                    unit.put(&rotation_only_write(&record, refresh_token)).await?;
                    unit.commit().await?;
                    warn!("Kept rotated refresh token from an unusable token response");
                }
                warn!(detail = %unusable.detail, "Token refresh failed");
                return Err(BrokerError::RefreshRejected {
                    provider: provider.to_string(),
                    status: None,
                    detail: unusable.detail,
                });
            }
        };
        unit.put(&write).await?;
        unit.commit().await?;

        info!(expires_at = %write.expires_at, rotated, "Refreshed access token");

        Ok(AccessToken {
            access_token: write.access_token,
            expires_at: write.expires_at,
            refreshed: true,
        })
    }
}

/// A 2xx refresh response that cannot become a stored access token.
struct UnusableGrant {
    detail: String,
    rotated: Option<String>,
}

/// Build the row that replaces `previous` after a successful refresh.
///
/// A rotated refresh token always wins; an omitted one keeps the stored
/// token. Passthrough metadata the issuer leaves out is carried over.
fn refreshed_write(
    previous: &CredentialRecord,
    issued: IssuedToken,
    responded_at: DateTime<Utc>,
    skew: Duration,
) -> Result<CredentialWrite, UnusableGrant> {
    let Some(access_token) = issued.access_token else {
        return Err(UnusableGrant {
            detail: "token response carried no access_token".into(),
            rotated: issued.refresh_token,
        });
    };

    let expires_at = match issued_expiry(issued.expires_in, responded_at, skew) {
        Ok(expires_at) => expires_at,
        Err(detail) => {
            return Err(UnusableGrant {
                detail,
                rotated: issued.refresh_token,
            })
        }
    };

    Ok(CredentialWrite {
        access_token,
        refresh_token: issued
            .refresh_token
            .unwrap_or_else(|| previous.refresh_token.clone()),
        expires_at,
        token_type: issued.token_type.or_else(|| previous.token_type.clone()),
        scope: issued.scope.or_else(|| previous.scope.clone()),
    })
}

/// `responded_at + lifetime - skew`, with the lifetime capped at
/// `MAX_EXPIRES_IN_SECS`. Non-positive or non-finite lifetimes are refused.
fn issued_expiry(
    expires_in: Option<f64>,
    responded_at: DateTime<Utc>,
    skew: Duration,
) -> Result<DateTime<Utc>, String> {
    let secs = expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS as f64);
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("issuer reported an unusable lifetime: {secs}"));
    }

    let capped = secs.min(MAX_EXPIRES_IN_SECS as f64);
    if capped < secs {
        warn!(expires_in = secs, "Issued token lifetime capped");
    }

    let lifetime = Duration::milliseconds((capped * 1000.0).round() as i64);
    if lifetime <= skew {
        warn!(expires_in = secs, "Issued token lifetime is within the skew margin");
    }

    responded_at
        .checked_add_signed(lifetime)
        .and_then(|at| at.checked_sub_signed(skew))
        .ok_or_else(|| format!("token expiry out of range for lifetime {secs}s"))
}

/// Keep the stale access token but store the rotated refresh token, so the
/// next call refreshes with the token the issuer now expects.
fn rotation_only_write(previous: &CredentialRecord, refresh_token: String) -> CredentialWrite {
    CredentialWrite {
        access_token: previous.access_token.clone(),
        refresh_token,
        expires_at: previous.expires_at,
        token_type: previous.token_type.clone(),
        scope: previous.scope.clone(),
    }
}
