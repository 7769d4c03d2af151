//! File-backed key store for development and tests.
//!
//! Layout: one `key_<version>.bin` file per version plus a
//! `key_metadata.json` record `{current_version, keys, rotation_days,
//! last_rotation}`. Files are created with owner-only permissions on Unix.
//!
//! Reads of the current version are lock-free via an [`ArcSwap`] metadata
//! snapshot; key generation and rotation serialise on a single mutex so the
//! compare-and-create of a not-yet-existent version is one atomic region.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{next_version, KeyBytes, KeyStore, KeyStoreError, KEY_LEN};

/// Status of a key version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// The version may be used for new encryptions.
    Active,
    /// The version decrypts existing data only.
    Deprecated,
}

/// Per-version bookkeeping record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    /// When the key material was generated.
    pub created_at: DateTime<Utc>,
    /// Algorithm the key is intended for.
    pub algorithm: String,
    /// Active or deprecated.
    pub status: KeyStatus,
    /// Set when the version was rotated out. Never cleared.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deprecated_at: Option<DateTime<Utc>>,
}

/// On-disk metadata record for the whole store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyStoreMetadata {
    /// The active version id.
    pub current_version: String,
    /// Bookkeeping per version, including deprecated ones.
    pub keys: BTreeMap<String, KeyRecord>,
    /// Recommended rotation interval.
    pub rotation_days: u32,
    /// When the store was first initialised.
    pub created_at: DateTime<Utc>,
    /// When the last rotation happened, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rotation: Option<DateTime<Utc>>,
}

/// Local file-backed key store. **Development and tests only.**
pub struct LocalKeyStore {
    key_dir: PathBuf,
    metadata_path: PathBuf,
    /// Lock-free snapshot of the metadata; replaced wholesale on mutation.
    snapshot: ArcSwap<KeyStoreMetadata>,
    /// Serialises key generation and rotation.
    write_lock: Mutex<()>,
}

impl LocalKeyStore {
    /// Open (or initialise) a key store rooted at `key_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the metadata
    /// record cannot be read or written.
    pub fn open(
        key_dir: impl AsRef<Path>,
        initial_version: &str,
        rotation_days: u32,
    ) -> Result<Self, KeyStoreError> {
        let key_dir = key_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&key_dir)?;
        restrict_permissions(&key_dir, 0o700);

        let metadata_path = key_dir.join("key_metadata.json");
        let metadata = if metadata_path.exists() {
            load_metadata(&metadata_path)?
        } else {
            let metadata = KeyStoreMetadata {
                current_version: initial_version.to_owned(),
                keys: BTreeMap::new(),
                rotation_days,
                created_at: Utc::now(),
                last_rotation: None,
            };
            save_metadata(&metadata_path, &metadata)?;
            metadata
        };

        warn!(dir = %key_dir.display(), "using local key store; not for production");

        Ok(Self {
            key_dir,
            metadata_path,
            snapshot: ArcSwap::new(Arc::new(metadata)),
            write_lock: Mutex::new(()),
        })
    }

    /// Returns `true` if the rotation interval has elapsed since the last
    /// rotation (or since store creation, if never rotated).
    pub fn rotation_due(&self) -> bool {
        let meta = self.snapshot.load();
        let anchor = meta.last_rotation.unwrap_or(meta.created_at);
        Utc::now() - anchor >= Duration::days(i64::from(meta.rotation_days))
    }

    fn key_path(&self, version: &str) -> PathBuf {
        self.key_dir.join(format!("key_{version}.bin"))
    }

    fn read_key_file(&self, version: &str) -> Result<KeyBytes, KeyStoreError> {
        let bytes = std::fs::read(self.key_path(version))?;
        if bytes.len() != KEY_LEN {
            return Err(KeyStoreError::InvalidLength(bytes.len()));
        }
        KeyBytes::from_slice(&bytes)
    }

    /// Generate key material for `version`, record it in the metadata, and
    /// persist both. Caller must hold `write_lock`.
    fn generate_locked(&self, version: &str) -> Result<KeyBytes, KeyStoreError> {
        let key = KeyBytes::generate();
        let path = self.key_path(version);
        std::fs::write(&path, key.as_bytes())?;
        restrict_permissions(&path, 0o600);

        let mut meta = KeyStoreMetadata::clone(&self.snapshot.load());
        meta.keys.insert(
            version.to_owned(),
            KeyRecord {
                created_at: Utc::now(),
                algorithm: common::ALGORITHM.to_owned(),
                status: KeyStatus::Active,
                deprecated_at: None,
            },
        );
        save_metadata(&self.metadata_path, &meta)?;
        self.snapshot.store(Arc::new(meta));

        info!(version, "generated new data key");
        Ok(key)
    }
}

#[async_trait]
impl KeyStore for LocalKeyStore {
    async fn get_data_key(&self, version: &str) -> Result<KeyBytes, KeyStoreError> {
        if self.key_path(version).exists() {
            return self.read_key_file(version);
        }

        // The version is recorded but its file is gone: data encrypted under
        // it is unrecoverable. Regenerating would hide the loss, so fail.
        if self.snapshot.load().keys.contains_key(version) {
            return Err(KeyStoreError::KeyMaterialLost(version.to_owned()));
        }

        // Only the current version may be created on first access.
        if version != self.snapshot.load().current_version {
            return Err(KeyStoreError::UnknownVersion(version.to_owned()));
        }

        let _guard = self.write_lock.lock().await;
        // Another task may have generated the key while we waited.
        if self.key_path(version).exists() {
            return self.read_key_file(version);
        }
        self.generate_locked(version)
    }

    async fn wrap_data_key(&self, key: &KeyBytes, _version: &str) -> Result<String, KeyStoreError> {
        // No master key locally; base64 stands in for real wrapping.
        Ok(STANDARD.encode(key.as_bytes()))
    }

    async fn unwrap_data_key(
        &self,
        wrapped: &str,
        _version: &str,
    ) -> Result<KeyBytes, KeyStoreError> {
        let bytes = STANDARD
            .decode(wrapped)
            .map_err(|_| KeyStoreError::InvalidWrapped)?;
        KeyBytes::from_slice(&bytes)
    }

    async fn rotate_key(&self) -> Result<String, KeyStoreError> {
        let _guard = self.write_lock.lock().await;

        let mut meta = KeyStoreMetadata::clone(&self.snapshot.load());
        let old_version = meta.current_version.clone();
        let new_version = next_version(&old_version)?;

        // Generate the new key material *before* publishing the version, so
        // no caller can observe a current version with no retrievable key.
        let key = KeyBytes::generate();
        let path = self.key_path(&new_version);
        std::fs::write(&path, key.as_bytes())?;
        restrict_permissions(&path, 0o600);

        let now = Utc::now();
        if let Some(record) = meta.keys.get_mut(&old_version) {
            record.status = KeyStatus::Deprecated;
            record.deprecated_at = Some(now);
        }
        meta.keys.insert(
            new_version.clone(),
            KeyRecord {
                created_at: now,
                algorithm: common::ALGORITHM.to_owned(),
                status: KeyStatus::Active,
                deprecated_at: None,
            },
        );
        meta.current_version = new_version.clone();
        meta.last_rotation = Some(now);

        save_metadata(&self.metadata_path, &meta)?;
        // Publication point: the swap makes the new version current.
        self.snapshot.store(Arc::new(meta));

        info!(from = %old_version, to = %new_version, "key rotated");
        Ok(new_version)
    }

    async fn get_current_version(&self) -> Result<String, KeyStoreError> {
        Ok(self.snapshot.load().current_version.clone())
    }
}

fn load_metadata(path: &Path) -> Result<KeyStoreMetadata, KeyStoreError> {
    let bytes = std::fs::read(path)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| KeyStoreError::Metadata(format!("corrupt metadata record: {e}")))
}

fn save_metadata(path: &Path, metadata: &KeyStoreMetadata) -> Result<(), KeyStoreError> {
    let bytes = serde_json::to_vec_pretty(metadata)
        .map_err(|e| KeyStoreError::Metadata(format!("serialise metadata: {e}")))?;
    std::fs::write(path, bytes)?;
    restrict_permissions(path, 0o600);
    Ok(())
}

/// Restrict a path to the owning principal. Best-effort on non-Unix.
fn restrict_permissions(path: &Path, mode: u32) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
            warn!(path = %path.display(), error = %e, "failed to restrict permissions");
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(dir: &tempfile::TempDir) -> LocalKeyStore {
        LocalKeyStore::open(dir.path(), "v1", 90).unwrap()
    }

    #[tokio::test]
    async fn first_access_generates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);

        let key = store.get_data_key("v1").await.unwrap();
        assert_eq!(key.as_bytes().len(), KEY_LEN);

        // A second read returns the same material.
        let again = store.get_data_key("v1").await.unwrap();
        assert_eq!(key.as_bytes(), again.as_bytes());
        assert!(dir.path().join("key_v1.bin").exists());
    }

    #[tokio::test]
    async fn unknown_version_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        assert!(matches!(
            store.get_data_key("v9").await,
            Err(KeyStoreError::UnknownVersion(_))
        ));
    }

    #[tokio::test]
    async fn lost_key_material_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        store.get_data_key("v1").await.unwrap();

        std::fs::remove_file(dir.path().join("key_v1.bin")).unwrap();

        assert!(matches!(
            store.get_data_key("v1").await,
            Err(KeyStoreError::KeyMaterialLost(_))
        ));
    }

    #[tokio::test]
    async fn rotation_deprecates_old_and_publishes_new() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let v1_key = store.get_data_key("v1").await.unwrap();

        let new_version = store.rotate_key().await.unwrap();
        assert_eq!(new_version, "v2");
        assert_eq!(store.get_current_version().await.unwrap(), "v2");

        // The new key is retrievable immediately after publication.
        let v2_key = store.get_data_key("v2").await.unwrap();
        assert_ne!(v1_key.as_bytes(), v2_key.as_bytes());

        // The old key still decrypts; metadata marks it deprecated.
        let v1_again = store.get_data_key("v1").await.unwrap();
        assert_eq!(v1_key.as_bytes(), v1_again.as_bytes());
        let meta = load_metadata(&dir.path().join("key_metadata.json")).unwrap();
        assert_eq!(meta.keys["v1"].status, KeyStatus::Deprecated);
        assert!(meta.keys["v1"].deprecated_at.is_some());
        assert_eq!(meta.keys["v2"].status, KeyStatus::Active);
    }

    #[tokio::test]
    async fn metadata_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(&dir);
            store.get_data_key("v1").await.unwrap();
            store.rotate_key().await.unwrap();
        }
        let reopened = LocalKeyStore::open(dir.path(), "v1", 90).unwrap();
        assert_eq!(reopened.get_current_version().await.unwrap(), "v2");
        // v1 material is still on disk and readable after reopen.
        reopened.get_data_key("v1").await.unwrap();
    }

    #[tokio::test]
    async fn wrap_unwrap_is_identity_locally() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir);
        let key = store.get_data_key("v1").await.unwrap();
        let wrapped = store.wrap_data_key(&key, "v1").await.unwrap();
        let unwrapped = store.unwrap_data_key(&wrapped, "v1").await.unwrap();
        assert_eq!(key.as_bytes(), unwrapped.as_bytes());
    }

    #[tokio::test]
    async fn rotation_due_respects_interval() {
        let due_dir = tempfile::tempdir().unwrap();
        let store = LocalKeyStore::open(due_dir.path(), "v1", 0).unwrap();
        assert!(store.rotation_due());

        let slow_dir = tempfile::tempdir().unwrap();
        let slow = LocalKeyStore::open(slow_dir.path(), "v1", 3650).unwrap();
        assert!(!slow.rotation_due());
    }
}
