//! Hash-chained, append-only audit logging.
//!
//! Every entry's hash covers its own identifying fields plus the previous
//! entry's hash, forming one linear chain. The chain head (`last_hash`) is
//! shared, mutable, and order-sensitive, so all writers serialise on a
//! single mutex; without that the chain would silently fork and integrity
//! verification would report false tampering.
//!
//! A write failure here is fatal for the caller's surrounding operation.
//! Silently dropping an audit record defeats the subsystem's purpose.

pub mod store;

pub use store::{AuditQuery, AuditStore, FileAuditStore, MemoryAuditStore};

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use common::{AuditAction, AuditLogEntry};

/// Minimum length of a justification for decrypt and delete actions.
pub const MIN_JUSTIFICATION_LEN: usize = 10;

/// Errors produced by the audit layer.
#[derive(Debug, Error)]
pub enum AuditError {
    /// A decrypt or delete action was recorded without an adequate
    /// justification. Caller programming error, not a silent no-op.
    #[error("action '{action}' requires a justification of at least {MIN_JUSTIFICATION_LEN} characters")]
    JustificationRequired {
        /// The action that was missing its justification.
        action: AuditAction,
    },

    /// The backing store rejected an operation.
    #[error("audit store error: {0}")]
    Store(String),

    /// The chain does not verify; carries the first offending entry's id.
    #[error("chain integrity violation at entry {entry_id}")]
    ChainViolation {
        /// Id of the entry where the chain first breaks.
        entry_id: Uuid,
    },
}

/// One auditable event, before hashing and persistence.
///
/// Built with struct-update syntax from [`AuditEvent::new`]; only the fields
/// a call site cares about need naming.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub actor_id: String,
    pub actor_roles: Vec<String>,
    pub target_collection: Option<String>,
    pub target_id: Option<String>,
    pub fields_accessed: Vec<String>,
    pub justification: Option<String>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Value,
}

impl AuditEvent {
    /// Event for `actor_id` holding `actor_roles`, all other fields empty.
    pub fn new(actor_id: impl Into<String>, actor_roles: Vec<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            actor_roles,
            metadata: Value::Null,
            ..Self::default()
        }
    }
}

/// Aggregate counts over the stored audit entries.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditStats {
    pub total_entries: usize,
    pub failures: usize,
    pub by_action: BTreeMap<String, usize>,
    pub by_actor: BTreeMap<String, usize>,
}

/// The append-only, hash-chained audit log.
pub struct AuditLog {
    store: Arc<dyn AuditStore>,
    /// Chain head. All writers serialise here.
    last_hash: Mutex<Option<String>>,
}

/// Chain hash input: identifying fields of the new entry plus the previous
/// hash. Timestamps are hashed in fixed-precision RFC 3339 form so the hash
/// is stable across serialisation round trips.
fn chain_hash(
    timestamp: &chrono::DateTime<Utc>,
    actor_id: &str,
    action: AuditAction,
    target_id: Option<&str>,
    prev_hash: Option<&str>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    hasher.update(actor_id.as_bytes());
    hasher.update(action.as_str().as_bytes());
    hasher.update(target_id.unwrap_or("").as_bytes());
    hasher.update(prev_hash.unwrap_or("").as_bytes());
    format!("{:x}", hasher.finalize())
}

impl AuditLog {
    /// Open the log over `store`, reseeding the chain head from the most
    /// recent stored entry.
    pub async fn open(store: Arc<dyn AuditStore>) -> Result<Self, AuditError> {
        let last_hash = store.last().await?.map(|e| e.entry_hash);
        if last_hash.is_some() {
            info!("audit chain resumed from existing store");
        }
        Ok(Self {
            store,
            last_hash: Mutex::new(last_hash),
        })
    }

    /// Record one event, returning the new entry's id.
    ///
    /// # Errors
    ///
    /// - [`AuditError::JustificationRequired`] when `action` is decrypt or
    ///   delete and the justification is missing or shorter than
    ///   [`MIN_JUSTIFICATION_LEN`].
    /// - [`AuditError::Store`] when the append fails; the chain head is left
    ///   unchanged so a retry continues the same chain.
    pub async fn record(
        &self,
        action: AuditAction,
        success: bool,
        event: AuditEvent,
    ) -> Result<Uuid, AuditError> {
        if action.requires_justification() {
            let adequate = event
                .justification
                .as_deref()
                .map_or(false, |j| j.trim().len() >= MIN_JUSTIFICATION_LEN);
            if !adequate {
                warn!(%action, actor = %event.actor_id, "audit record rejected: missing justification");
                return Err(AuditError::JustificationRequired { action });
            }
        }

        let mut last_hash = self.last_hash.lock().await;

        let id = Uuid::new_v4();
        let timestamp = Utc::now();
        let entry_hash = chain_hash(
            &timestamp,
            &event.actor_id,
            action,
            event.target_id.as_deref(),
            last_hash.as_deref(),
        );

        let entry = AuditLogEntry {
            id,
            actor_id: event.actor_id,
            actor_roles: event.actor_roles,
            action,
            target_collection: event.target_collection,
            target_id: event.target_id,
            fields_accessed: event.fields_accessed,
            justification: event.justification,
            success,
            ip: event.ip,
            user_agent: event.user_agent,
            timestamp,
            metadata: event.metadata,
            entry_hash: entry_hash.clone(),
            prev_hash: last_hash.clone(),
        };

        if let Err(e) = self.store.append(entry).await {
            error!(error = %e, "audit append failed");
            return Err(e);
        }
        *last_hash = Some(entry_hash);

        Ok(id)
    }

    pub async fn record_read(&self, success: bool, event: AuditEvent) -> Result<Uuid, AuditError> {
        self.record(AuditAction::Read, success, event).await
    }

    pub async fn record_write(&self, success: bool, event: AuditEvent) -> Result<Uuid, AuditError> {
        self.record(AuditAction::Write, success, event).await
    }

    pub async fn record_decrypt(
        &self,
        success: bool,
        event: AuditEvent,
    ) -> Result<Uuid, AuditError> {
        self.record(AuditAction::Decrypt, success, event).await
    }

    pub async fn record_delete(
        &self,
        success: bool,
        event: AuditEvent,
    ) -> Result<Uuid, AuditError> {
        self.record(AuditAction::Delete, success, event).await
    }

    pub async fn record_role_change(
        &self,
        success: bool,
        event: AuditEvent,
    ) -> Result<Uuid, AuditError> {
        self.record(AuditAction::RoleChange, success, event).await
    }

    pub async fn record_retention_run(
        &self,
        success: bool,
        event: AuditEvent,
    ) -> Result<Uuid, AuditError> {
        self.record(AuditAction::RetentionRun, success, event).await
    }

    /// Filtered, paginated read of the log. Querying the audit log is
    /// itself an auditable action, so a query entry is recorded first.
    pub async fn query(
        &self,
        query: &AuditQuery,
        querying_actor: AuditEvent,
    ) -> Result<Vec<AuditLogEntry>, AuditError> {
        self.record(AuditAction::AuditQuery, true, querying_actor)
            .await?;
        self.store.query(query).await
    }

    /// Walk up to `limit` entries in chronological order, recomputing each
    /// hash and checking the back-link. Stops at the first break.
    ///
    /// # Errors
    ///
    /// [`AuditError::ChainViolation`] with the first offending entry's id.
    pub async fn verify_chain_integrity(&self, limit: usize) -> Result<usize, AuditError> {
        let entries = self.store.scan_chronological(limit).await?;

        let mut prev: Option<&AuditLogEntry> = None;
        for entry in &entries {
            let expected_prev = prev.map(|p| p.entry_hash.as_str());
            if entry.prev_hash.as_deref() != expected_prev {
                error!(entry_id = %entry.id, "audit chain back-link mismatch");
                return Err(AuditError::ChainViolation { entry_id: entry.id });
            }
            let recomputed = chain_hash(
                &entry.timestamp,
                &entry.actor_id,
                entry.action,
                entry.target_id.as_deref(),
                entry.prev_hash.as_deref(),
            );
            if recomputed != entry.entry_hash {
                error!(entry_id = %entry.id, "audit entry hash mismatch");
                return Err(AuditError::ChainViolation { entry_id: entry.id });
            }
            prev = Some(entry);
        }

        Ok(entries.len())
    }

    /// Aggregate counts over up to `limit` stored entries.
    pub async fn stats(&self, limit: usize) -> Result<AuditStats, AuditError> {
        let entries = self.store.scan_chronological(limit).await?;
        let mut stats = AuditStats {
            total_entries: entries.len(),
            ..AuditStats::default()
        };
        for entry in &entries {
            if !entry.success {
                stats.failures += 1;
            }
            *stats
                .by_action
                .entry(entry.action.as_str().to_owned())
                .or_insert(0) += 1;
            *stats.by_actor.entry(entry.actor_id.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }
}
