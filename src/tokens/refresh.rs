//! Background token keeper.
//!
//! Periodically asks the manager for every registered provider's token so a
//! stale one is refreshed before a request needs it. It goes through the
//! same unit-of-work protocol as request traffic and never writes on its own.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::manager::TokenManager;
use crate::error::BrokerError;

/// Start the keeper loop. Runs until the task is dropped.
pub async fn refresh_daemon(manager: Arc<TokenManager>, interval: Duration) {
    info!("Token keeper started (interval: {}s)", interval.as_secs());

    loop {
        tokio::time::sleep(interval).await;
        let refreshed = refresh_cycle(&manager).await;
        if refreshed > 0 {
            info!("Token keeper refreshed {refreshed} credential(s)");
        }
    }
}

/// One pass over all providers. Returns how many tokens were refreshed.
pub async fn refresh_cycle(manager: &TokenManager) -> usize {
    let mut refreshed = 0;

    for provider in manager.providers() {
        match manager.get_valid_access_token(provider).await {
            Ok(token) if token.refreshed => refreshed += 1,
            Ok(_) => {}
            Err(BrokerError::CredentialNotSeeded(_)) => {
                debug!(provider, "Credential not seeded yet, skipping");
            }
            Err(e) => error!(provider, "Keeper refresh failed: {e}"),
        }
    }

    refreshed
}
