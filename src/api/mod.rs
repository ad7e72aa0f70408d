//! HTTP surface for the token broker.
//!
//! - /healthz                       — liveness, no database access
//! - /oauth/{provider}/access_token — valid access token (internal only)
//! - /oauth/{provider}/seed         — initial credential (internal only)

pub mod routes;

use crate::SharedState;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub fn router(state: SharedState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    routes::router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
