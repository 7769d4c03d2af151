//! Encrypted escrow of pre-redaction originals with a short TTL.
//!
//! The vault exists to support short-term troubleshooting of redaction
//! quality, not long-term storage. Entries are sealed with the same AEAD
//! primitive as field encryption, bound to their own id and key version
//! through the associated data, and become unreadable once `expires_at`
//! has passed even while the ciphertext is still present.
//!
//! No cross-version decryption: an entry sealed under a key version other
//! than the vault's current one is "not retrievable", not upgraded.

pub mod store;

pub use store::{MemoryVaultStore, VaultStore};

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{VaultEntry, VaultUnavailable};

use crate::cipher::{self, CipherError};
use crate::keystore::KeyStore;

/// Storage policy the vault operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VaultMode {
    /// Escrow disabled; every escrow call is a no-op returning no entry.
    #[default]
    NeverStoreOriginal,
    /// Originals are encrypted under the current key version and stored.
    StoreEncryptedWithKey,
}

/// Errors produced by the vault layer.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Soft outcome: the entry cannot be returned.
    #[error("vault entry unavailable: {0}")]
    Unavailable(VaultUnavailable),

    /// Sealing or opening the entry failed.
    #[error(transparent)]
    Cipher(#[from] CipherError),

    /// The backing store failed.
    #[error("vault store error: {0}")]
    Store(String),
}

/// Escrow service for pre-redaction originals.
pub struct PiiVault {
    mode: VaultMode,
    ttl: Duration,
    keys: Arc<dyn KeyStore>,
    store: Arc<dyn VaultStore>,
}

impl PiiVault {
    /// Vault with the given policy and TTL in days.
    pub fn new(
        mode: VaultMode,
        ttl_days: i64,
        keys: Arc<dyn KeyStore>,
        store: Arc<dyn VaultStore>,
    ) -> Self {
        info!(?mode, ttl_days, "pii vault initialised");
        Self {
            mode,
            ttl: Duration::days(ttl_days),
            keys,
            store,
        }
    }

    pub fn mode(&self) -> VaultMode {
        self.mode
    }

    /// Escrow `original_text`, returning the stored entry, or `None` when
    /// the vault mode disables storage.
    ///
    /// The entry id and key version are folded into the associated data, so
    /// a ciphertext cannot be re-attached to a different entry.
    pub async fn escrow(
        &self,
        original_text: &str,
        associated_data: Map<String, Value>,
    ) -> Result<Option<VaultEntry>, VaultError> {
        if self.mode == VaultMode::NeverStoreOriginal {
            return Ok(None);
        }

        let version = self.keys.get_current_version().await.map_err(CipherError::from)?;
        let key = self.keys.get_data_key(&version).await.map_err(CipherError::from)?;

        let id = Uuid::new_v4();
        let now = Utc::now();

        let mut aad_map = associated_data;
        aad_map.insert("vault_entry_id".into(), Value::String(id.to_string()));
        aad_map.insert("key_version".into(), Value::String(version.clone()));
        let aad_value = Value::Object(aad_map);
        let aad_bytes = cipher::canonical_aad(&aad_value)?;

        let (nonce, ciphertext) = cipher::seal(key.as_bytes(), original_text.as_bytes(), &aad_bytes)?;

        let entry = VaultEntry {
            id,
            ciphertext: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce),
            key_version: version,
            associated_data: aad_value,
            created_at: now,
            expires_at: now + self.ttl,
        };
        self.store.insert(entry.clone()).await?;

        debug!(entry_id = %entry.id, expires_at = %entry.expires_at, "original escrowed");
        Ok(Some(entry))
    }

    /// Decrypt an escrowed original by id.
    ///
    /// # Errors
    ///
    /// [`VaultError::Unavailable`] when the entry does not exist, has
    /// expired, or was sealed under a key version other than the vault's
    /// current one.
    pub async fn retrieve(&self, id: Uuid) -> Result<String, VaultError> {
        let entry = self
            .store
            .get(id)
            .await?
            .ok_or(VaultError::Unavailable(VaultUnavailable::NotFound))?;

        if entry.is_expired(Utc::now()) {
            return Err(VaultError::Unavailable(VaultUnavailable::Expired));
        }

        let current = self
            .keys
            .get_current_version()
            .await
            .map_err(CipherError::from)?;
        if entry.key_version != current {
            return Err(VaultError::Unavailable(VaultUnavailable::KeyVersionMismatch));
        }

        let key = self
            .keys
            .get_data_key(&entry.key_version)
            .await
            .map_err(CipherError::from)?;
        let ciphertext = STANDARD
            .decode(&entry.ciphertext)
            .map_err(|e| CipherError::InvalidFormat(format!("ciphertext: {e}")))?;
        let nonce = STANDARD
            .decode(&entry.nonce)
            .map_err(|e| CipherError::InvalidFormat(format!("nonce: {e}")))?;
        let aad_bytes = cipher::canonical_aad(&entry.associated_data)?;

        let plaintext = cipher::open(key.as_bytes(), &nonce, &ciphertext, &aad_bytes)?;
        String::from_utf8(plaintext)
            .map_err(|_| CipherError::InvalidFormat("plaintext is not utf-8".into()).into())
    }

    /// Physically remove expired entries from the backing store.
    pub async fn purge_expired(&self) -> Result<usize, VaultError> {
        let removed = self.store.purge_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "expired vault entries purged");
        }
        Ok(removed)
    }
}
