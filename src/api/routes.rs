//! Route handlers. Privileged routes check `x-internal-secret` before doing
//! any work; errors render through `BrokerError`'s `IntoResponse`.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use crate::auth::require_internal;
use crate::error::BrokerError;
use crate::tokens::SeedRequest;
use crate::SharedState;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/oauth/{provider}/access_token", get(access_token))
        .route("/oauth/{provider}/seed", post(seed))
        .with_state(state)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

/// GET /oauth/{provider}/access_token — token for exactly one outbound call.
async fn access_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    require_internal(&headers, &state.config.internal_api_key)?;

    let token = state.tokens.get_valid_access_token(&provider).await?;

    Ok(Json(json!({
        "access_token": token.access_token,
        "expires_at": token.expires_at,
    })))
}

/// POST /oauth/{provider}/seed — store the first token pair for a provider.
async fn seed(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(provider): Path<String>,
    Json(body): Json<SeedRequest>,
) -> Result<Json<serde_json::Value>, BrokerError> {
    require_internal(&headers, &state.config.internal_api_key)?;

    let expires_at = state.tokens.seed(&provider, body).await?;

    Ok(Json(json!({ "ok": true, "expires_at": expires_at })))
}
