use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use super::traits::{IssuedToken, TokenIssuer};
use crate::error::BrokerError;

/// Standard OAuth 2.0 refresh-token grant against a form-encoded token
/// endpoint (client credentials in the body).
///
/// Every request is bounded by the client-wide timeout; the issuer sits on
/// the token-issuance critical path and must never hang.
pub struct OAuth2Issuer {
    provider: String,
    token_url: String,
    client_id: String,
    client_secret: String,
    http: reqwest::Client,
}

impl OAuth2Issuer {
    pub fn new(
        provider: String,
        token_url: String,
        client_id: String,
        client_secret: String,
        timeout: Duration,
    ) -> Result<Self, BrokerError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            provider,
            token_url,
            client_id,
            client_secret,
            http,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> BrokerError {
        if e.is_timeout() {
            BrokerError::IssuerTimeout(self.provider.clone())
        } else {
            BrokerError::RefreshRejected {
                provider: self.provider.clone(),
                status: None,
                detail: format!("Refresh request failed: {e}"),
            }
        }
    }

    fn unparseable(&self, status: u16, detail: impl fmt::Display) -> BrokerError {
        BrokerError::RefreshRejected {
            provider: self.provider.clone(),
            status: Some(status),
            detail: format!("Unparseable token response: {detail}"),
        }
    }
}

#[async_trait]
impl TokenIssuer for OAuth2Issuer {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn refresh(&self, refresh_token: &str) -> Result<IssuedToken, BrokerError> {
        let resp = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| self.transport_error(e))?;

        if !status.is_success() {
            return Err(BrokerError::RefreshRejected {
                provider: self.provider.clone(),
                status: Some(status.as_u16()),
                detail: body,
            });
        }

        let status = status.as_u16();
        let value: Value = serde_json::from_str(&body).map_err(|e| self.unparseable(status, e))?;

        let issued = match IssuedToken::deserialize(&value) {
            Ok(issued) => issued,
            // The old refresh token is spent once the issuer answered 2xx.
            Err(e) => match value.get("refresh_token").and_then(Value::as_str) {
                Some(rotated) => {
                    warn!(provider = %self.provider, "Token response partly unreadable: {e}");
                    IssuedToken::rotation_only(rotated)
                }
                None => return Err(self.unparseable(status, e)),
            },
        };

        if issued.access_token.is_none() && issued.refresh_token.is_none() {
            return Err(self.unparseable(status, "no access_token in response"));
        }
        Ok(issued)
    }
}
