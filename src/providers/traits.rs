use std::fmt;

use async_trait::async_trait;
use serde::de::{self, Deserializer};
use serde::Deserialize;
use serde_json::Value;

use crate::error::BrokerError;

/// Successful refresh-grant response.
///
/// `refresh_token` is only present when the provider rotated it.
/// `access_token` is missing only when a 2xx body was too broken to use but
/// still carried a rotated refresh token worth keeping.
#[derive(Clone, Deserialize)]
pub struct IssuedToken {
    #[serde(default)]
    pub access_token: Option<String>,
    /// Lifetime in seconds. Issuers send integers, floats or numeric strings.
    #[serde(default, deserialize_with = "lenient_seconds")]
    pub expires_in: Option<f64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl IssuedToken {
    /// Response reduced to the rotated refresh token it carried.
    pub fn rotation_only(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: None,
            expires_in: None,
            refresh_token: Some(refresh_token.into()),
            token_type: None,
            scope: None,
        }
    }
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("has_access_token", &self.access_token.is_some())
            .field("expires_in", &self.expires_in)
            .field("rotated", &self.refresh_token.is_some())
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("expires_in is not representable: {n}"))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expires_in is not numeric: {s:?}"))),
        Some(other) => Err(de::Error::custom(format!(
            "expires_in must be a number, got {other}"
        ))),
    }
}

/// Mints new access tokens for one provider from a refresh token.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Provider name this issuer serves (e.g. "freee").
    fn provider(&self) -> &str;

    /// Run the refresh-token grant.
    ///
    /// Implementations must bound the call with a timeout and report it as
    /// `IssuerTimeout`; any other failure is `RefreshRejected`. A 2xx body
    /// that carries a rotated refresh token must never be turned into an
    /// error, since the previous refresh token is already spent.
    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, BrokerError>;
}
