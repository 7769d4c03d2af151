//! Persisted record shapes exchanged between the core and its callers.
//!
//! These types are serialised as JSON into whatever store the caller owns
//! (document database, append-only file, memory). The core never mutates a
//! written [`AuditLogEntry`] or [`VaultEntry`]; re-encryption produces a new
//! [`EncryptedValue`] rather than updating one in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// AEAD algorithm tag carried in every [`EncryptedValue`].
///
/// AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant; a repeated nonce
/// degrades to deterministic encryption instead of breaking authentication.
pub const ALGORITHM: &str = "AES-256-GCM-SIV";

/// A single encrypted field value.
///
/// Wire shape: `{ciphertext: base64, nonce: base64, key_version, algorithm,
/// associated_data, encrypted_at}`. The associated data is authenticated but
/// stored in cleartext; it must re-serialise byte-identically at decrypt
/// time or authentication fails.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// Base64-encoded ciphertext plus authentication tag.
    pub ciphertext: String,
    /// Base64-encoded 96-bit nonce, unique per encryption.
    pub nonce: String,
    /// Key version the value was sealed under; required for decryption.
    pub key_version: String,
    /// Algorithm tag, always [`ALGORITHM`] for values produced here.
    pub algorithm: String,
    /// Cleartext context bound into the authentication tag. Always contains
    /// at least `timestamp` and `key_version`.
    pub associated_data: serde_json::Value,
    /// When the value was sealed.
    pub encrypted_at: DateTime<Utc>,
}

/// Action recorded by an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Read of sensitive data.
    Read,
    /// Write or modification of data.
    Write,
    /// Decryption of encrypted fields. Requires justification.
    Decrypt,
    /// Deletion of data. Requires justification.
    Delete,
    /// Role assignment change.
    RoleChange,
    /// Automated retention sweep.
    RetentionRun,
    /// A query of the audit log itself.
    AuditQuery,
    /// Escrow of pre-redaction text into the vault.
    VaultEscrow,
    /// Retrieval of escrowed text from the vault.
    VaultRetrieve,
    /// Encryption key rotation.
    KeyRotation,
}

impl AuditAction {
    /// Stable string form used in the chain hash input.
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Read => "read",
            AuditAction::Write => "write",
            AuditAction::Decrypt => "decrypt",
            AuditAction::Delete => "delete",
            AuditAction::RoleChange => "role_change",
            AuditAction::RetentionRun => "retention_run",
            AuditAction::AuditQuery => "audit_query",
            AuditAction::VaultEscrow => "vault_escrow",
            AuditAction::VaultRetrieve => "vault_retrieve",
            AuditAction::KeyRotation => "key_rotation",
        }
    }

    /// Actions that must carry a non-empty justification.
    pub fn requires_justification(self) -> bool {
        matches!(self, AuditAction::Decrypt | AuditAction::Delete)
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable, hash-chained audit entry.
///
/// `entry_hash` is computed over `(timestamp, actor_id, action, target_id,
/// prev_hash)`; `prev_hash` of entry *n* equals `entry_hash` of entry *n−1*
/// (or `None` for the first entry), forming a single linear chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// User or service that performed the action.
    pub actor_id: String,
    /// Role names of the actor at the time of the action.
    pub actor_roles: Vec<String>,
    /// Action performed.
    pub action: AuditAction,
    /// Collection the action targeted, if any.
    pub target_collection: Option<String>,
    /// Id of the specific record targeted, if any.
    pub target_id: Option<String>,
    /// Logical field names accessed or modified.
    pub fields_accessed: Vec<String>,
    /// Reason for the access. Mandatory for decrypt and delete.
    pub justification: Option<String>,
    /// Whether the surrounding operation succeeded.
    pub success: bool,
    /// Caller IP address, when known.
    pub ip: Option<String>,
    /// Caller user agent, when known.
    pub user_agent: Option<String>,
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Additional free-form context.
    pub metadata: serde_json::Value,
    /// SHA-256 over this entry's chained fields.
    pub entry_hash: String,
    /// Hash of the previous entry, `None` only for the first entry.
    pub prev_hash: Option<String>,
}

/// One escrowed pre-redaction original, sealed with the same AEAD primitive
/// as field encryption.
///
/// Unreadable once `expires_at` has passed, even while the raw ciphertext is
/// still present; callers are free to physically purge expired entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Base64-encoded ciphertext plus authentication tag.
    pub ciphertext: String,
    /// Base64-encoded 96-bit nonce.
    pub nonce: String,
    /// Key version the entry was sealed under.
    pub key_version: String,
    /// Cleartext context bound into the authentication tag.
    pub associated_data: serde_json::Value,
    /// When the entry was escrowed.
    pub created_at: DateTime<Utc>,
    /// Hard expiry; retrieval is refused strictly after this instant.
    pub expires_at: DateTime<Utc>,
}

impl VaultEntry {
    /// Returns `true` if the entry has passed its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
