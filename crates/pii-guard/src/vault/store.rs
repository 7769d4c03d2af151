//! Persistence backing for escrowed vault entries.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use common::VaultEntry;

use super::VaultError;

/// Storage capability the vault writes through.
///
/// The owning store should additionally expire entries past `expires_at` on
/// its own (a TTL index); the vault's expiry check runs regardless.
#[async_trait]
pub trait VaultStore: Send + Sync {
    /// Persist a new entry.
    async fn insert(&self, entry: VaultEntry) -> Result<(), VaultError>;

    /// Fetch an entry by id. Expired entries may still be returned; the
    /// vault enforces expiry itself.
    async fn get(&self, id: Uuid) -> Result<Option<VaultEntry>, VaultError>;

    /// Physically remove every entry expired as of `now`, returning the
    /// number removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, VaultError>;
}

/// In-process store over a `HashMap`. Suitable for tests and single-node
/// deployments without a document database.
#[derive(Default)]
pub struct MemoryVaultStore {
    entries: RwLock<HashMap<Uuid, VaultEntry>>,
}

impl MemoryVaultStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VaultStore for MemoryVaultStore {
    async fn insert(&self, entry: VaultEntry) -> Result<(), VaultError> {
        self.entries.write().await.insert(entry.id, entry);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<VaultEntry>, VaultError> {
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, VaultError> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok(before - entries.len())
    }
}
