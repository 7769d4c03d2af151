//! Configuration loading and validation.
//!
//! All values are read from environment variables at startup. Loading fails
//! with a clear error message if a required variable is missing or invalid
//! for the selected mode.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::redact::RedactionMode;
use crate::vault::VaultMode;

/// Which key-store backing to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStoreMode {
    /// Per-version key files on disk. Development only.
    #[default]
    Local,
    /// A managed KMS backing, selected by [`KmsProvider`].
    Kms,
}

/// Which managed backing serves keys in [`KeyStoreMode::Kms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KmsProvider {
    /// Data keys minted and wrapped directly by AWS KMS.
    #[default]
    Aws,
    /// Envelope-encrypted DEK blobs in Secrets Manager, unwrapped via KMS.
    Envelope,
}

/// Validated privacy-core configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Key-store backing.
    #[serde(default)]
    pub key_store_mode: KeyStoreMode,

    /// Managed provider when `key_store_mode` is `kms`.
    #[serde(default)]
    pub kms_provider: KmsProvider,

    /// KMS key id. **Required** in `kms` mode.
    #[serde(default)]
    pub kms_key_id: String,

    /// Secrets Manager prefix for per-version DEK secrets; the secret for
    /// version `V` lives at `<prefix>/<V>`. Used by the `envelope` provider.
    #[serde(default = "default_kms_secret_prefix")]
    pub kms_secret_prefix: String,

    /// Directory holding local key files and metadata.
    #[serde(default = "default_key_store_path")]
    pub key_store_path: PathBuf,

    /// Initial key version when the store has no metadata yet.
    #[serde(default = "default_key_version")]
    pub key_version: String,

    /// Recommended rotation interval in days.
    #[serde(default = "default_key_rotation_days")]
    pub key_rotation_days: u32,

    /// Vault storage policy for pre-redaction originals.
    #[serde(default)]
    pub pii_storage_mode: VaultMode,

    /// Vault entry lifetime in days. Deliberately short.
    #[serde(default = "default_vault_ttl_days")]
    pub vault_ttl_days: i64,

    /// How detected PII is rewritten.
    #[serde(default)]
    pub redaction_mode: RedactionMode,

    /// Enable the HIPAA safe-harbor entity set (dates, URLs, MRNs).
    #[serde(default)]
    pub hipaa_safe_harbor: bool,

    /// Reject writes whose redacted output still matches a high-precision
    /// PII pattern.
    #[serde(default)]
    pub strict_redaction: bool,

    /// JSONL audit file path. In-memory store when unset.
    #[serde(default)]
    pub audit_log_path: Option<PathBuf>,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_kms_secret_prefix() -> String {
    "pii-guard/dek".into()
}
fn default_key_store_path() -> PathBuf {
    "./keys".into()
}
fn default_key_version() -> String {
    "v1".into()
}
fn default_key_rotation_days() -> u32 {
    90
}
fn default_vault_ttl_days() -> i64 {
    7
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable cannot be parsed or the combination is
    /// invalid for the selected mode.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build configuration from environment")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise configuration")?;

        c.validate()?;
        Ok(c)
    }

    /// Validate all fields, returning a descriptive error on the first
    /// failure.
    pub fn validate(&self) -> Result<()> {
        if self.key_store_mode == KeyStoreMode::Kms && self.kms_key_id.trim().is_empty() {
            anyhow::bail!("KMS_KEY_ID is required when KEY_STORE_MODE is kms");
        }
        if self.key_store_mode == KeyStoreMode::Kms
            && self.kms_provider == KmsProvider::Envelope
            && self.kms_secret_prefix.trim().is_empty()
        {
            anyhow::bail!("KMS_SECRET_PREFIX must not be empty for the envelope provider");
        }
        if self.key_version.trim().is_empty() {
            anyhow::bail!("KEY_VERSION must not be empty");
        }
        if self.key_rotation_days == 0 {
            anyhow::bail!("KEY_ROTATION_DAYS must be > 0");
        }
        if self.vault_ttl_days <= 0 {
            anyhow::bail!("VAULT_TTL_DAYS must be > 0");
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            key_store_mode: KeyStoreMode::default(),
            kms_provider: KmsProvider::default(),
            kms_key_id: String::new(),
            kms_secret_prefix: default_kms_secret_prefix(),
            key_store_path: default_key_store_path(),
            key_version: default_key_version(),
            key_rotation_days: default_key_rotation_days(),
            pii_storage_mode: VaultMode::default(),
            vault_ttl_days: default_vault_ttl_days(),
            redaction_mode: RedactionMode::default(),
            hipaa_safe_harbor: false,
            strict_redaction: false,
            audit_log_path: None,
            log_level: default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.key_store_mode, KeyStoreMode::Local);
        assert_eq!(cfg.pii_storage_mode, VaultMode::NeverStoreOriginal);
        assert_eq!(cfg.redaction_mode, RedactionMode::Mask);
        assert_eq!(cfg.key_rotation_days, 90);
        assert_eq!(cfg.vault_ttl_days, 7);
        assert!(!cfg.strict_redaction);
    }

    #[test]
    fn kms_mode_requires_key_id() {
        let cfg = Config {
            key_store_mode: KeyStoreMode::Kms,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            key_store_mode: KeyStoreMode::Kms,
            kms_key_id: "alias/pii-guard".into(),
            ..Config::default()
        };
        cfg.validate().unwrap();
    }

    #[test]
    fn rotation_and_ttl_must_be_positive() {
        let cfg = Config {
            key_rotation_days: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            vault_ttl_days: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mode_names_deserialise_snake_case() {
        let mode: KeyStoreMode = serde_json::from_str("\"kms\"").unwrap();
        assert_eq!(mode, KeyStoreMode::Kms);
        let provider: KmsProvider = serde_json::from_str("\"envelope\"").unwrap();
        assert_eq!(provider, KmsProvider::Envelope);
        let vault: VaultMode = serde_json::from_str("\"store_encrypted_with_key\"").unwrap();
        assert_eq!(vault, VaultMode::StoreEncryptedWithKey);
    }
}
