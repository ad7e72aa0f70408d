use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use shift_token_broker::crypto::TokenCipher;
use shift_token_broker::providers::{self, ProviderRegistry};
use shift_token_broker::store::PgCredentialStore;
use shift_token_broker::tokens::{self, TokenManager};
use shift_token_broker::{api, AppState, Config, SharedState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shift_token_broker=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    info!("shift-token-broker v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}:{}", config.host, config.port);

    let cipher = TokenCipher::new(&config.token_encryption_key)?;
    let store = PgCredentialStore::connect(&config, cipher)?;
    // The database may come up after us; the schema is retried on first use.
    match store.ensure_schema().await {
        Ok(()) => info!("Credential store connected ✓"),
        Err(e) => warn!("Credential store not ready yet: {e}"),
    }

    let mut registry = ProviderRegistry::new();
    providers::register_defaults(&mut registry, &config)?;
    info!("Registered token issuer(s): {:?}", registry.list());

    let manager = Arc::new(
        TokenManager::new(Arc::new(store), registry).with_skew(config.skew()),
    );

    if let Some(interval) = config.refresh_interval() {
        let keeper = manager.clone();
        tokio::spawn(async move {
            tokens::refresh_daemon(keeper, interval).await;
        });
    }

    let state: SharedState = Arc::new(AppState {
        config: config.clone(),
        tokens: manager,
    });

    let app = api::router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server ready ✓");
    axum::serve(listener, app).await?;

    Ok(())
}
