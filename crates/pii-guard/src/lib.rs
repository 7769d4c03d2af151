//! `pii-guard` — privacy/security core for consent-gated speech transcripts.
//!
//! The crate owns the hard parts of handling user-derived free text:
//!
//! - [`keystore`] — versioned symmetric keys behind one capability trait,
//!   with local-file and managed-KMS backings.
//! - [`cipher`] — authenticated field- and document-level encryption bound
//!   to cleartext associated data.
//! - [`redact`] — regex + entity-recognition PII detection with typed,
//!   numbered placeholders and residual-PII validation.
//! - [`vault`] — short-TTL encrypted escrow of pre-redaction originals.
//! - [`audit`] — append-only, hash-chained record of every sensitive
//!   operation, with chain-integrity verification.
//! - [`rbac`] — closed role hierarchy, permission table, and role-scoped
//!   response filtering.
//!
//! [`core::PrivacyCore`] is the composition root: it wires the pieces
//! together and enforces the RBAC → data-op → audit control flow. Every
//! component is an explicitly constructed instance handed to its callers;
//! there are no hidden globals.

pub mod audit;
pub mod cipher;
pub mod config;
pub mod core;
pub mod keystore;
pub mod rbac;
pub mod redact;
pub mod telemetry;
pub mod vault;

pub use crate::config::Config;
pub use crate::core::{Actor, PrivacyCore};
pub use common::{PrivacyError, VaultUnavailable};
