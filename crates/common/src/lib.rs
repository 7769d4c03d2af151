//! Common record shapes and errors shared across `pii-guard` crates.

pub mod error;
pub mod record;

pub use error::{PrivacyError, VaultUnavailable};
pub use record::{AuditAction, AuditLogEntry, EncryptedValue, VaultEntry, ALGORITHM};
