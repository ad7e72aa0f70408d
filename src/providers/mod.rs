mod oauth2;
mod registry;
mod traits;

pub use oauth2::OAuth2Issuer;
pub use registry::ProviderRegistry;
pub use traits::{IssuedToken, TokenIssuer};

use std::sync::Arc;

use crate::config::Config;
use crate::error::BrokerError;

/// Register the issuer described by the environment configuration.
pub fn register_defaults(
    registry: &mut ProviderRegistry,
    config: &Config,
) -> Result<(), BrokerError> {
    let issuer = OAuth2Issuer::new(
        config.provider.clone(),
        config.token_url.clone(),
        config.client_id.clone(),
        config.client_secret.clone(),
        config.issuer_timeout(),
    )?;
    registry.register(Arc::new(issuer));
    Ok(())
}
