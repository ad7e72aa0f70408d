//! In-process credential store for tests and local runs.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{CredentialRecord, CredentialStore, CredentialUnit, CredentialWrite};
use crate::error::BrokerError;

/// Map-backed store. Units hold a per-provider async lock for their whole
/// lifetime and only apply their staged write on commit.
#[derive(Default)]
pub struct MemoryCredentialStore {
    records: Arc<DashMap<String, CredentialRecord>>,
    unit_locks: DashMap<String, Arc<Mutex<()>>>,
    writes: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed writes since creation.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Simulate the backing medium going away.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

fn check_online(offline: &AtomicBool) -> Result<(), BrokerError> {
    if offline.load(Ordering::SeqCst) {
        return Err(BrokerError::StorageUnavailable(
            "memory store is offline".into(),
        ));
    }
    Ok(())
}

fn apply(
    records: &DashMap<String, CredentialRecord>,
    writes: &AtomicUsize,
    provider: &str,
    write: &CredentialWrite,
) {
    records.insert(
        provider.to_string(),
        CredentialRecord {
            provider: provider.to_string(),
            access_token: write.access_token.clone(),
            refresh_token: write.refresh_token.clone(),
            expires_at: write.expires_at,
            token_type: write.token_type.clone(),
            scope: write.scope.clone(),
            updated_at: Utc::now(),
        },
    );
    writes.fetch_add(1, Ordering::SeqCst);
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, provider: &str) -> Result<Option<CredentialRecord>, BrokerError> {
        check_online(&self.offline)?;
        Ok(self.records.get(provider).map(|r| r.value().clone()))
    }

    async fn put(&self, provider: &str, write: &CredentialWrite) -> Result<(), BrokerError> {
        check_online(&self.offline)?;
        apply(&self.records, &self.writes, provider, write);
        Ok(())
    }

    async fn begin(&self, provider: &str) -> Result<Box<dyn CredentialUnit>, BrokerError> {
        check_online(&self.offline)?;
        let lock = self
            .unit_locks
            .entry(provider.to_string())
            .or_default()
            .clone();
        let guard = lock.lock_owned().await;

        Ok(Box::new(MemoryCredentialUnit {
            provider: provider.to_string(),
            records: self.records.clone(),
            writes: self.writes.clone(),
            offline: self.offline.clone(),
            staged: None,
            _guard: guard,
        }))
    }
}

struct MemoryCredentialUnit {
    provider: String,
    records: Arc<DashMap<String, CredentialRecord>>,
    writes: Arc<AtomicUsize>,
    offline: Arc<AtomicBool>,
    staged: Option<CredentialWrite>,
    _guard: OwnedMutexGuard<()>,
}

#[async_trait]
impl CredentialUnit for MemoryCredentialUnit {
    async fn get(&mut self) -> Result<Option<CredentialRecord>, BrokerError> {
        check_online(&self.offline)?;
        Ok(self.records.get(&self.provider).map(|r| r.value().clone()))
    }

    async fn put(&mut self, write: &CredentialWrite) -> Result<(), BrokerError> {
        check_online(&self.offline)?;
        self.staged = Some(write.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), BrokerError> {
        check_online(&self.offline)?;
        if let Some(write) = &self.staged {
            apply(&self.records, &self.writes, &self.provider, write);
        }
        Ok(())
    }
}
