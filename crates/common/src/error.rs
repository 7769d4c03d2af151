//! Top-level error taxonomy shared across crates.
//!
//! Each variant corresponds to a distinct caller-visible failure class.
//! Cryptographic and chain-integrity failures are never retried by the core;
//! store I/O failures may be retried at the calling layer's discretion.

use thiserror::Error;

/// Why a vault entry could not be returned.
///
/// These are "unavailable" outcomes, deliberately distinguished from hard
/// errors: the entry may never have existed, may have aged out, or may be
/// bound to a key version the vault no longer serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultUnavailable {
    /// No entry with the requested id.
    NotFound,
    /// The entry's `expires_at` has passed; decryption is refused.
    Expired,
    /// The entry was sealed under a key version the vault does not serve.
    KeyVersionMismatch,
}

impl std::fmt::Display for VaultUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VaultUnavailable::NotFound => f.write_str("not found"),
            VaultUnavailable::Expired => f.write_str("expired"),
            VaultUnavailable::KeyVersionMismatch => f.write_str("key version mismatch"),
        }
    }
}

/// Top-level privacy-core error type.
#[derive(Debug, Error)]
pub enum PrivacyError {
    /// Ciphertext, nonce, or associated data failed authentication at
    /// decrypt time. Never partially succeeds; never retried.
    #[error("authentication failure: ciphertext, nonce, or associated data was altered")]
    AuthenticationFailure,

    /// An explicit key-version expectation was violated, or a version has no
    /// retrievable key material.
    #[error("key version mismatch: expected {expected}, got {actual}")]
    KeyVersionMismatch {
        /// The version the caller required.
        expected: String,
        /// The version actually found.
        actual: String,
    },

    /// The audit hash chain does not verify. Reported with the first
    /// offending entry's id.
    #[error("audit chain integrity violation at entry {entry_id}")]
    ChainIntegrityViolation {
        /// Id of the entry where the chain first breaks.
        entry_id: uuid::Uuid,
    },

    /// The audit store rejected a write. Fatal for the surrounding
    /// operation: proceeding without an audit trail is not an option.
    #[error("audit write failure: {0}")]
    AuditWriteFailure(String),

    /// An RBAC check failed. Carries the specific missing permission so the
    /// caller gets a precise, non-leaking reason.
    #[error("permission denied: missing permission '{permission}'")]
    PermissionDenied {
        /// Name of the permission the caller lacked.
        permission: String,
    },

    /// Strict-redaction policy rejected a write whose redacted output still
    /// matched a high-precision PII pattern.
    #[error("redaction validation failed and strict policy is enabled")]
    RedactionRejected,

    /// A decrypt or delete was attempted without an adequate justification.
    /// Caller programming error, not a silent no-op.
    #[error("justification required: {0}")]
    JustificationRequired(String),

    /// A vault entry is unavailable (soft outcome, not a hard error).
    #[error("vault entry unavailable: {0}")]
    VaultUnavailable(VaultUnavailable),

    /// A key-store backing failed (missing material, metadata corruption,
    /// KMS error).
    #[error("key store failure: {0}")]
    KeyStore(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_missing_permission() {
        let e = PrivacyError::PermissionDenied {
            permission: "decrypt_fields".into(),
        };
        assert!(e.to_string().contains("decrypt_fields"));
    }

    #[test]
    fn display_names_versions() {
        let e = PrivacyError::KeyVersionMismatch {
            expected: "v1".into(),
            actual: "v2".into(),
        };
        let s = e.to_string();
        assert!(s.contains("v1") && s.contains("v2"));
    }

    #[test]
    fn vault_unavailable_display() {
        assert_eq!(VaultUnavailable::Expired.to_string(), "expired");
    }
}
