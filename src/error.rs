use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for the token broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    // ── Credential lifecycle ────────────────────────────────────────────
    #[error("No credential seeded for provider {0}")]
    CredentialNotSeeded(String),

    /// The issuer refused the refresh grant, or the exchange never produced
    /// a usable response. `status` is `None` when no HTTP status was received.
    #[error("Token refresh rejected by {provider}: {detail}")]
    RefreshRejected {
        provider: String,
        status: Option<u16>,
        detail: String,
    },

    #[error("Token refresh for {0} timed out")]
    IssuerTimeout(String),

    #[error("No token issuer configured for provider {0}")]
    UnknownProvider(String),

    // ── Storage ─────────────────────────────────────────────────────────
    #[error("Credential store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Credential store error: {0}")]
    Storage(String),

    // ── Request ─────────────────────────────────────────────────────────
    #[error("Forbidden")]
    Forbidden,

    #[error("Bad request: {0}")]
    BadRequest(String),

    // ── Internal ────────────────────────────────────────────────────────
    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BrokerError::CredentialNotSeeded(_) => "seed_required",
            BrokerError::RefreshRejected { .. } => "refresh_rejected",
            BrokerError::IssuerTimeout(_) => "issuer_timeout",
            BrokerError::UnknownProvider(_) => "unknown_provider",
            BrokerError::StorageUnavailable(_) => "storage_unavailable",
            BrokerError::Storage(_) => "storage_error",
            BrokerError::Forbidden => "forbidden",
            BrokerError::BadRequest(_) => "bad_request",
            BrokerError::Crypto(_) => "crypto_error",
            BrokerError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::CredentialNotSeeded(_) => StatusCode::NOT_FOUND,
            BrokerError::RefreshRejected { .. } => StatusCode::BAD_GATEWAY,
            BrokerError::IssuerTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            BrokerError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            BrokerError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Forbidden => StatusCode::FORBIDDEN,
            BrokerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        let unreachable = match &e {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => true,
            // 57014: statement_timeout hit, 55P03: lock_timeout hit
            sqlx::Error::Database(db) => {
                matches!(db.code().as_deref(), Some("57014") | Some("55P03"))
            }
            _ => false,
        };

        if unreachable {
            tracing::error!("Credential store unreachable: {e}");
            BrokerError::StorageUnavailable(e.to_string())
        } else {
            tracing::error!("Database error: {e}");
            BrokerError::Storage(e.to_string())
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        });

        (self.status(), axum::Json(body)).into_response()
    }
}
