pub mod api;
pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod providers;
pub mod store;
pub mod tokens;

pub use config::Config;
pub use error::BrokerError;

use std::sync::Arc;

/// Shared application state passed to all API handlers.
pub struct AppState {
    pub config: Config,
    pub tokens: Arc<tokens::TokenManager>,
}

pub type SharedState = Arc<AppState>;
