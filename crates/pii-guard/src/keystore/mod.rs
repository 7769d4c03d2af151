//! Versioned symmetric key management behind one capability trait.
//!
//! # Lifecycle
//!
//! Keys are indexed by version string (`v1`, `v2`, …). Exactly one version is
//! current at a time; rotation deprecates the current version and publishes a
//! new one. Keys are never deleted, only deprecated — decryption of old data
//! must remain possible for as long as the material exists.
//!
//! # Backings
//!
//! - [`LocalKeyStore`] — per-version key files on disk. Development only.
//! - [`KmsKeyStore`] — data keys generated and wrapped by AWS KMS.
//! - [`EnvelopeKeyStore`] — per-version envelope-encrypted DEK blobs in
//!   Secrets Manager, unwrapped via KMS.
//!
//! Callers treat all three as the same capability set and never branch on
//! the concrete type after startup.
//!
//! # Security invariants
//!
//! - Plaintext key material is never logged or included in `Debug` output.
//! - Key material for a version that has ever encrypted data is never
//!   silently regenerated; loss is surfaced as [`KeyStoreError::KeyMaterialLost`].

pub mod aws;
pub mod local;

pub use aws::{AwsClients, EnvelopeKeyStore, KmsKeyStore};
pub use local::LocalKeyStore;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, KeyStoreMode, KmsProvider};

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Errors produced by the key-store layer.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// The requested version is not known to this store.
    #[error("unknown key version: {0}")]
    UnknownVersion(String),

    /// The version is recorded but its key material is gone. Fatal: data
    /// encrypted under it can no longer be decrypted, and regenerating the
    /// key would only hide that.
    #[error("key material lost for version {0}")]
    KeyMaterialLost(String),

    /// Raw key material had the wrong length.
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    /// A wrapped key string could not be decoded.
    #[error("invalid wrapped key encoding")]
    InvalidWrapped,

    /// Key file or metadata I/O failed.
    #[error("key store io error: {0}")]
    Io(#[from] std::io::Error),

    /// The metadata record is missing or corrupted.
    #[error("key metadata error: {0}")]
    Metadata(String),

    /// A KMS or Secrets Manager call failed.
    #[error("kms error: {0}")]
    Kms(String),
}

/// Fixed-size key buffer holding exactly [`KEY_LEN`] bytes.
///
/// The memory is overwritten with zeroes on drop to minimise the window
/// during which plaintext key material lives in RAM.
#[derive(Clone)]
pub struct KeyBytes(Box<[u8; KEY_LEN]>);

impl KeyBytes {
    /// Copy `bytes` into a new buffer.
    ///
    /// # Errors
    ///
    /// Returns [`KeyStoreError::InvalidLength`] if `bytes` is not exactly
    /// [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyStoreError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyStoreError::InvalidLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Generate fresh key material from the OS CSPRNG.
    pub fn generate() -> Self {
        use aes_gcm_siv::aead::{rand_core::RngCore, OsRng};
        let mut buf = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(buf.as_mut());
        Self(buf)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        // Zero the key material on drop.
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material — not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// Capability set every key-store backing exposes.
///
/// `rotate_key` must be atomic with respect to `get_current_version`: no
/// caller may observe a version that is current but has no retrievable key.
#[async_trait]
pub trait KeyStore: Send + Sync {
    /// Return the data-encryption key for `version`.
    ///
    /// Local backings generate and persist the key on first access of the
    /// current version; managed backings fetch or derive it. A deprecated
    /// version whose material is gone fails with
    /// [`KeyStoreError::KeyMaterialLost`] or
    /// [`KeyStoreError::UnknownVersion`].
    async fn get_data_key(&self, version: &str) -> Result<KeyBytes, KeyStoreError>;

    /// Wrap (encrypt) a data key under the master key, returning an opaque
    /// printable string. Identity transform (base64) in the local backing,
    /// real envelope encryption under KMS.
    async fn wrap_data_key(&self, key: &KeyBytes, version: &str) -> Result<String, KeyStoreError>;

    /// Reverse of [`KeyStore::wrap_data_key`].
    async fn unwrap_data_key(&self, wrapped: &str, version: &str)
        -> Result<KeyBytes, KeyStoreError>;

    /// Deprecate the current version and establish a new current version,
    /// returning its id. The new version's key must be retrievable before
    /// the version is published.
    async fn rotate_key(&self) -> Result<String, KeyStoreError>;

    /// Return the id of the active version.
    async fn get_current_version(&self) -> Result<String, KeyStoreError>;
}

/// Derive the successor of a `v<N>` version id.
pub(crate) fn next_version(current: &str) -> Result<String, KeyStoreError> {
    let n: u64 = current
        .strip_prefix('v')
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| KeyStoreError::Metadata(format!("unparseable current version: {current}")))?;
    Ok(format!("v{}", n + 1))
}

/// Build the key store selected by configuration.
///
/// Resolved once at startup; callers hold the returned `Arc<dyn KeyStore>`
/// and never branch on the backing again.
///
/// # Errors
///
/// Returns an error if the selected backing cannot be initialised (missing
/// KMS key id, unreadable key directory).
pub async fn from_config(cfg: &Config) -> anyhow::Result<Arc<dyn KeyStore>> {
    match cfg.key_store_mode {
        KeyStoreMode::Local => {
            let store = LocalKeyStore::open(
                &cfg.key_store_path,
                &cfg.key_version,
                cfg.key_rotation_days,
            )?;
            Ok(Arc::new(store))
        }
        KeyStoreMode::Kms => {
            let clients = AwsClients::init().await?;
            match cfg.kms_provider {
                KmsProvider::Aws => Ok(Arc::new(KmsKeyStore::new(
                    clients,
                    cfg.kms_key_id.clone(),
                    cfg.key_version.clone(),
                ))),
                KmsProvider::Envelope => Ok(Arc::new(EnvelopeKeyStore::new(
                    clients,
                    cfg.kms_key_id.clone(),
                    cfg.kms_secret_prefix.clone(),
                    cfg.key_version.clone(),
                ))),
            }
        }
    }
}
