use std::fmt;

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::info;

use super::manager::TokenManager;
use crate::error::BrokerError;
use crate::store::CredentialWrite;

/// Initial credential for a provider, supplied out of band.
///
/// The expiry is the provider's own value, not margin-adjusted: seeding
/// subtracts the skew margin exactly as the refresh path does. Give either
/// `expires_at` (timestamp, or a number of seconds from now) or `expires_in`.
#[derive(Deserialize)]
pub struct SeedRequest {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_at: Option<SeedExpiry>,
    #[serde(default)]
    pub expires_in: Option<f64>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl fmt::Debug for SeedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeedRequest")
            .field("expires_at", &self.expires_at)
            .field("expires_in", &self.expires_in)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SeedExpiry {
    /// Lifetime in seconds from now.
    Seconds(f64),
    /// RFC 3339, or a naive ISO-8601 timestamp taken as UTC.
    Timestamp(String),
}

impl SeedRequest {
    /// Provider-reported expiry as an absolute UTC timestamp.
    pub fn provider_expiry(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, BrokerError> {
        match (&self.expires_at, self.expires_in) {
            (Some(_), Some(_)) => Err(BrokerError::BadRequest(
                "give either expires_at or expires_in, not both".into(),
            )),
            (None, None) => Err(BrokerError::BadRequest(
                "expires_at or expires_in is required".into(),
            )),
            (None, Some(secs)) => after(now, secs),
            (Some(SeedExpiry::Seconds(secs)), None) => after(now, *secs),
            (Some(SeedExpiry::Timestamp(raw)), None) => parse_timestamp(raw),
        }
    }

    fn validate(&self) -> Result<(), BrokerError> {
        if self.access_token.trim().is_empty() {
            return Err(BrokerError::BadRequest("access_token must not be empty".into()));
        }
        if self.refresh_token.trim().is_empty() {
            return Err(BrokerError::BadRequest("refresh_token must not be empty".into()));
        }
        Ok(())
    }
}

fn after(now: DateTime<Utc>, secs: f64) -> Result<DateTime<Utc>, BrokerError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(BrokerError::BadRequest(format!(
            "token lifetime must be a positive number of seconds, got {secs}"
        )));
    }
    let out_of_range =
        || BrokerError::BadRequest(format!("token lifetime of {secs} seconds is out of range"));

    let millis = (secs * 1000.0).round();
    if millis >= i64::MAX as f64 {
        return Err(out_of_range());
    }
    let lifetime = Duration::try_milliseconds(millis as i64).ok_or_else(out_of_range)?;
    now.checked_add_signed(lifetime).ok_or_else(out_of_range)
}

/// Provider expiry minus the skew margin.
fn stored_expiry(
    provider_expiry: DateTime<Utc>,
    skew: Duration,
) -> Result<DateTime<Utc>, BrokerError> {
    provider_expiry
        .checked_sub_signed(skew)
        .ok_or_else(|| BrokerError::BadRequest(format!("expiry {provider_expiry} is out of range")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, BrokerError> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| BrokerError::BadRequest(format!("unrecognised expires_at timestamp: {raw}")))
}

impl TokenManager {
    /// Write an initial credential, bypassing the refresh protocol.
    ///
    /// Returns the stored (margin-adjusted) expiry.
    pub async fn seed(
        &self,
        provider: &str,
        request: SeedRequest,
    ) -> Result<DateTime<Utc>, BrokerError> {
        if self.registry.get(provider).is_none() {
            return Err(BrokerError::UnknownProvider(provider.to_string()));
        }
        request.validate()?;

        let expires_at = stored_expiry(request.provider_expiry(self.clock.now())?, self.skew)?;
        let write = CredentialWrite {
            access_token: request.access_token,
            refresh_token: request.refresh_token,
            expires_at,
            token_type: request.token_type,
            scope: request.scope,
        };

        self.store.put(provider, &write).await?;
        info!(provider, %expires_at, "Seeded credential");

        Ok(expires_at)
    }
}
