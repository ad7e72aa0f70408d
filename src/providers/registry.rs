use std::collections::HashMap;
use std::sync::Arc;

use super::traits::TokenIssuer;

/// Token issuers keyed by provider name.
#[derive(Default)]
pub struct ProviderRegistry {
    issuers: HashMap<String, Arc<dyn TokenIssuer>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an issuer, replacing any previous one for the same provider.
    pub fn register(&mut self, issuer: Arc<dyn TokenIssuer>) {
        let provider = issuer.provider().to_string();
        self.issuers.insert(provider, issuer);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn TokenIssuer>> {
        self.issuers.get(provider).cloned()
    }

    /// Registered provider names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.issuers.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}
