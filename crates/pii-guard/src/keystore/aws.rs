//! Managed key-store backings built on the AWS SDK.
//!
//! Two shapes, both behind the same [`KeyStore`] trait:
//!
//! - [`KmsKeyStore`] — data keys minted by `kms:GenerateDataKey`; wrap and
//!   unwrap delegate to `kms:Encrypt` / `kms:Decrypt`. Plaintext keys are
//!   cached in memory only.
//! - [`EnvelopeKeyStore`] — per-version envelope-encrypted DEK blobs stored
//!   in Secrets Manager and unwrapped via KMS at fetch time. Versions are
//!   provisioned out-of-band; rotation publishes a version only after its
//!   secret is confirmed fetchable.
//!
//! KMS and Secrets Manager calls are fallible network I/O; they are not
//! retried here — a silently doubled KMS call could duplicate downstream
//! bookkeeping, so retries stay at the caller's discretion.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kms::primitives::Blob;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;

use super::{next_version, KeyBytes, KeyStore, KeyStoreError};

/// Bundle of AWS SDK clients sharing one resolved [`aws_config::SdkConfig`]
/// so that credentials are resolved once and reused.
#[derive(Clone)]
pub struct AwsClients {
    /// KMS client used for data-key generation and wrap/unwrap.
    pub kms: aws_sdk_kms::Client,
    /// Secrets Manager client used to fetch envelope-encrypted DEK blobs.
    pub secretsmanager: aws_sdk_secretsmanager::Client,
}

impl AwsClients {
    /// Initialise both AWS SDK clients from the standard credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the SDK config cannot be loaded.
    pub async fn init() -> anyhow::Result<Self> {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Ok(Self {
            kms: aws_sdk_kms::Client::new(&config),
            secretsmanager: aws_sdk_secretsmanager::Client::new(&config),
        })
    }
}

/// Key store that delegates key generation and wrapping to AWS KMS.
pub struct KmsKeyStore {
    clients: AwsClients,
    kms_key_id: String,
    current: ArcSwap<String>,
    /// Plaintext keys by version, memory only. Generation of a
    /// not-yet-existent version is a single atomic region under the write
    /// half of this lock.
    cache: RwLock<HashMap<String, KeyBytes>>,
}

impl KmsKeyStore {
    /// Create a store bound to `kms_key_id`, with `initial_version` current.
    pub fn new(clients: AwsClients, kms_key_id: String, initial_version: String) -> Self {
        info!(key_id = %kms_key_id, "kms key store initialised");
        Self {
            clients,
            kms_key_id,
            current: ArcSwap::new(Arc::new(initial_version)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    async fn kms_encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, KeyStoreError> {
        let resp = self
            .clients
            .kms
            .encrypt()
            .key_id(&self.kms_key_id)
            .plaintext(Blob::new(plaintext))
            .send()
            .await
            .map_err(|e| KeyStoreError::Kms(format!("kms encrypt failed: {e}")))?;
        let blob = resp
            .ciphertext_blob()
            .ok_or_else(|| KeyStoreError::Kms("kms encrypt returned no ciphertext".into()))?;
        Ok(blob.as_ref().to_vec())
    }

    async fn kms_decrypt(&self, ciphertext: &[u8]) -> Result<KeyBytes, KeyStoreError> {
        let resp = self
            .clients
            .kms
            .decrypt()
            .key_id(&self.kms_key_id)
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| KeyStoreError::Kms(format!("kms decrypt failed: {e}")))?;
        let plaintext = resp
            .plaintext()
            .ok_or_else(|| KeyStoreError::Kms("kms decrypt returned no plaintext".into()))?;
        KeyBytes::from_slice(plaintext.as_ref())
    }
}

#[async_trait]
impl KeyStore for KmsKeyStore {
    async fn get_data_key(&self, version: &str) -> Result<KeyBytes, KeyStoreError> {
        if let Some(key) = self.cache.read().await.get(version) {
            return Ok(key.clone());
        }

        // Only the current version may be minted; a deprecated version whose
        // material is no longer cached cannot be reconstructed here.
        if version != self.current.load().as_str() {
            return Err(KeyStoreError::UnknownVersion(version.to_owned()));
        }

        let mut cache = self.cache.write().await;
        // Another task may have minted the key while we waited.
        if let Some(key) = cache.get(version) {
            return Ok(key.clone());
        }

        let resp = self
            .clients
            .kms
            .generate_data_key()
            .key_id(&self.kms_key_id)
            .key_spec(aws_sdk_kms::types::DataKeySpec::Aes256)
            .send()
            .await
            .map_err(|e| KeyStoreError::Kms(format!("kms generate_data_key failed: {e}")))?;
        let plaintext = resp
            .plaintext()
            .ok_or_else(|| KeyStoreError::Kms("generate_data_key returned no plaintext".into()))?;
        let key = KeyBytes::from_slice(plaintext.as_ref())?;
        cache.insert(version.to_owned(), key.clone());

        info!(version, "data key generated via kms");
        Ok(key)
    }

    async fn wrap_data_key(&self, key: &KeyBytes, _version: &str) -> Result<String, KeyStoreError> {
        let blob = self.kms_encrypt(key.as_bytes()).await?;
        Ok(STANDARD.encode(blob))
    }

    async fn unwrap_data_key(
        &self,
        wrapped: &str,
        _version: &str,
    ) -> Result<KeyBytes, KeyStoreError> {
        let blob = STANDARD
            .decode(wrapped)
            .map_err(|_| KeyStoreError::InvalidWrapped)?;
        self.kms_decrypt(&blob).await
    }

    async fn rotate_key(&self) -> Result<String, KeyStoreError> {
        // KMS rotates the master key material itself; we only mint a new
        // version id for our own bookkeeping.
        let new_version = format!("v{}", Utc::now().timestamp());
        self.current.store(Arc::new(new_version.clone()));
        info!(version = %new_version, "kms key store rotated");
        Ok(new_version)
    }

    async fn get_current_version(&self) -> Result<String, KeyStoreError> {
        Ok(self.current.load().as_str().to_owned())
    }
}

/// Key store backed by per-version envelope-encrypted DEK blobs in Secrets
/// Manager, unwrapped via KMS.
///
/// The secret for version `V` lives at `<secret_prefix>/<V>` and holds the
/// KMS-encrypted DEK as binary.
pub struct EnvelopeKeyStore {
    clients: AwsClients,
    kms_key_id: String,
    secret_prefix: String,
    current: ArcSwap<String>,
    cache: RwLock<HashMap<String, KeyBytes>>,
}

impl EnvelopeKeyStore {
    /// Create a store reading secrets under `secret_prefix`.
    pub fn new(
        clients: AwsClients,
        kms_key_id: String,
        secret_prefix: String,
        initial_version: String,
    ) -> Self {
        info!(prefix = %secret_prefix, "envelope key store initialised");
        Self {
            clients,
            kms_key_id,
            secret_prefix,
            current: ArcSwap::new(Arc::new(initial_version)),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn secret_id(&self, version: &str) -> String {
        format!("{}/{}", self.secret_prefix, version)
    }

    /// Fetch the envelope-encrypted DEK for `version` and unwrap it via KMS.
    async fn fetch_and_unwrap(&self, version: &str) -> Result<KeyBytes, KeyStoreError> {
        let secret = self
            .clients
            .secretsmanager
            .get_secret_value()
            .secret_id(self.secret_id(version))
            .send()
            .await
            .map_err(|_| KeyStoreError::UnknownVersion(version.to_owned()))?;

        // The DEK ciphertext is expected to be stored as binary.
        let ciphertext = secret
            .secret_binary()
            .ok_or_else(|| KeyStoreError::Kms("DEK secret must be stored as binary".into()))?
            .as_ref()
            .to_vec();

        let resp = self
            .clients
            .kms
            .decrypt()
            .key_id(&self.kms_key_id)
            .ciphertext_blob(Blob::new(ciphertext))
            .send()
            .await
            .map_err(|e| KeyStoreError::Kms(format!("failed to decrypt DEK via kms: {e}")))?;
        let plaintext = resp
            .plaintext()
            .ok_or_else(|| KeyStoreError::Kms("kms decrypt returned no plaintext".into()))?;
        KeyBytes::from_slice(plaintext.as_ref())
    }
}

#[async_trait]
impl KeyStore for EnvelopeKeyStore {
    async fn get_data_key(&self, version: &str) -> Result<KeyBytes, KeyStoreError> {
        if let Some(key) = self.cache.read().await.get(version) {
            return Ok(key.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(key) = cache.get(version) {
            return Ok(key.clone());
        }
        let key = self.fetch_and_unwrap(version).await?;
        cache.insert(version.to_owned(), key.clone());
        info!(version, "DEK fetched and unwrapped");
        Ok(key)
    }

    async fn wrap_data_key(&self, key: &KeyBytes, _version: &str) -> Result<String, KeyStoreError> {
        let resp = self
            .clients
            .kms
            .encrypt()
            .key_id(&self.kms_key_id)
            .plaintext(Blob::new(key.as_bytes()))
            .send()
            .await
            .map_err(|e| KeyStoreError::Kms(format!("kms encrypt failed: {e}")))?;
        let blob = resp
            .ciphertext_blob()
            .ok_or_else(|| KeyStoreError::Kms("kms encrypt returned no ciphertext".into()))?;
        Ok(STANDARD.encode(blob.as_ref()))
    }

    async fn unwrap_data_key(
        &self,
        wrapped: &str,
        _version: &str,
    ) -> Result<KeyBytes, KeyStoreError> {
        let blob = STANDARD
            .decode(wrapped)
            .map_err(|_| KeyStoreError::InvalidWrapped)?;
        let resp = self
            .clients
            .kms
            .decrypt()
            .key_id(&self.kms_key_id)
            .ciphertext_blob(Blob::new(blob))
            .send()
            .await
            .map_err(|e| KeyStoreError::Kms(format!("kms decrypt failed: {e}")))?;
        let plaintext = resp
            .plaintext()
            .ok_or_else(|| KeyStoreError::Kms("kms decrypt returned no plaintext".into()))?;
        KeyBytes::from_slice(plaintext.as_ref())
    }

    async fn rotate_key(&self) -> Result<String, KeyStoreError> {
        // Version names step predictably so the next secret can be
        // provisioned ahead of the rotation.
        let new_version = next_version(self.current.load().as_str())?;

        // Publish the version only once its secret is confirmed fetchable;
        // otherwise callers could observe a current version with no key.
        let key = self.fetch_and_unwrap(&new_version).await?;
        self.cache
            .write()
            .await
            .insert(new_version.clone(), key);
        self.current.store(Arc::new(new_version.clone()));

        info!(version = %new_version, "envelope key store rotated");
        Ok(new_version)
    }

    async fn get_current_version(&self) -> Result<String, KeyStoreError> {
        Ok(self.current.load().as_str().to_owned())
    }
}
