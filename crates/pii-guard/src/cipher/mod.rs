//! Authenticated field-level encryption bound to cleartext associated data.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant,
//! so even a repeated nonce cannot break authentication. A fresh 96-bit nonce
//! is still drawn from the OS CSPRNG on every call — nonces are never derived
//! from content.
//!
//! # Associated data
//!
//! Every [`EncryptedValue`] authenticates a cleartext context object that
//! always contains at least `timestamp` and `key_version`, plus any
//! caller-supplied entries (collection name, session id, field name). The
//! context is serialised canonically — JSON with sorted object keys — and
//! must re-serialise byte-identically at decrypt time or authentication
//! fails.

pub mod document;

pub use document::{
    encryption_metadata, is_field_encrypted, verify_encryption_integrity,
    ENCRYPTED_FIELD_PREFIX, ENCRYPTION_METADATA_KEY,
};

use std::sync::Arc;

use aes_gcm_siv::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::{Map, Value};
use thiserror::Error;

use common::{EncryptedValue, ALGORITHM};

use crate::keystore::{KeyStore, KeyStoreError};

/// Byte length of an AES-GCM-SIV nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// Ciphertext, nonce, or associated data failed authentication.
    #[error("authentication failure")]
    AuthenticationFailure,

    /// An explicit key-version expectation was violated.
    #[error("key version mismatch: expected {expected}, got {actual}")]
    KeyVersionMismatch {
        /// The version the caller required.
        expected: String,
        /// The version carried by the value.
        actual: String,
    },

    /// The encrypted value does not match the expected wire shape.
    #[error("invalid encrypted value format: {0}")]
    InvalidFormat(String),

    /// The key store could not supply the required key.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// Plaintext (de)serialisation failed.
    #[error("serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),
}

/// Seal `plaintext` under `key` with `aad` bound into the tag.
///
/// Returns the fresh nonce and the ciphertext (tag included). Shared by
/// field encryption and the PII vault.
pub(crate) fn seal(
    key: &[u8],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<([u8; NONCE_LEN], Vec<u8>), CipherError> {
    let cipher = build_cipher(key)?;

    use aes_gcm_siv::aead::rand_core::RngCore;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CipherError::AuthenticationFailure)?;

    Ok((nonce_bytes, ciphertext))
}

/// Reverse of [`seal`]. Fails with [`CipherError::AuthenticationFailure`] if
/// the ciphertext, nonce, or `aad` was altered.
pub(crate) fn open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CipherError> {
    if nonce.len() != NONCE_LEN {
        return Err(CipherError::InvalidFormat(format!(
            "nonce must be {NONCE_LEN} bytes, got {}",
            nonce.len()
        )));
    }
    let cipher = build_cipher(key)?;
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| CipherError::AuthenticationFailure)
}

fn build_cipher(key: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    Aes256GcmSiv::new_from_slice(key)
        .map_err(|_| CipherError::InvalidFormat("invalid key length".into()))
}

/// Canonical AAD bytes: JSON with sorted object keys.
///
/// `serde_json`'s default map is ordered, so serialising the stored
/// `associated_data` value reproduces the exact bytes that were
/// authenticated at encrypt time.
pub(crate) fn canonical_aad(aad: &Value) -> Result<Vec<u8>, CipherError> {
    Ok(serde_json::to_vec(aad)?)
}

/// Field-level encryption service over a versioned [`KeyStore`].
#[derive(Clone)]
pub struct FieldCipher {
    keys: Arc<dyn KeyStore>,
}

impl FieldCipher {
    /// Create a cipher drawing keys from `keys`.
    pub fn new(keys: Arc<dyn KeyStore>) -> Self {
        Self { keys }
    }

    /// Borrow the underlying key store.
    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.keys
    }

    /// Encrypt a single value under `key_version` (default: current).
    ///
    /// The plaintext is serialised as JSON before encryption, so any
    /// `serde_json::Value` round-trips exactly. `associated_data` entries
    /// are merged with the mandatory `timestamp` and `key_version` context.
    ///
    /// # Errors
    ///
    /// Fails if the key store cannot supply the version's key.
    pub async fn encrypt_field(
        &self,
        plaintext: &Value,
        key_version: Option<&str>,
        associated_data: Map<String, Value>,
    ) -> Result<EncryptedValue, CipherError> {
        let version = match key_version {
            Some(v) => v.to_owned(),
            None => self.keys.get_current_version().await?,
        };
        let key = self.keys.get_data_key(&version).await?;

        let now = Utc::now();
        let mut aad_map = associated_data;
        aad_map.insert("timestamp".into(), Value::String(now.to_rfc3339()));
        aad_map.insert("key_version".into(), Value::String(version.clone()));
        let aad_value = Value::Object(aad_map);
        let aad_bytes = canonical_aad(&aad_value)?;

        let plaintext_bytes = serde_json::to_vec(plaintext)?;
        let (nonce, ciphertext) = seal(key.as_bytes(), &plaintext_bytes, &aad_bytes)?;

        Ok(EncryptedValue {
            ciphertext: STANDARD.encode(ciphertext),
            nonce: STANDARD.encode(nonce),
            key_version: version,
            algorithm: ALGORITHM.to_owned(),
            associated_data: aad_value,
            encrypted_at: now,
        })
    }

    /// Decrypt a value produced by [`FieldCipher::encrypt_field`].
    ///
    /// # Errors
    ///
    /// - [`CipherError::KeyVersionMismatch`] if `expected_key_version` is
    ///   given and differs from the value's version.
    /// - [`CipherError::AuthenticationFailure`] if the ciphertext, nonce, or
    ///   associated data was altered. Never retried: a forged ciphertext
    ///   cannot decrypt on a second attempt.
    pub async fn decrypt_field(
        &self,
        value: &EncryptedValue,
        expected_key_version: Option<&str>,
    ) -> Result<Value, CipherError> {
        if let Some(expected) = expected_key_version {
            if expected != value.key_version {
                return Err(CipherError::KeyVersionMismatch {
                    expected: expected.to_owned(),
                    actual: value.key_version.clone(),
                });
            }
        }

        let ciphertext = STANDARD
            .decode(&value.ciphertext)
            .map_err(|e| CipherError::InvalidFormat(format!("ciphertext: {e}")))?;
        let nonce = STANDARD
            .decode(&value.nonce)
            .map_err(|e| CipherError::InvalidFormat(format!("nonce: {e}")))?;

        let key = self.keys.get_data_key(&value.key_version).await?;
        let aad_bytes = canonical_aad(&value.associated_data)?;

        let plaintext_bytes = open(key.as_bytes(), &nonce, &ciphertext, &aad_bytes)?;
        Ok(serde_json::from_slice(&plaintext_bytes)?)
    }
}
