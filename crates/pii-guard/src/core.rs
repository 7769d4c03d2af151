//! Composition root tying key management, encryption, redaction, escrow,
//! auditing, and access control together.
//!
//! Every operation here follows the same shape: authorize the actor,
//! perform the data operation, and record an audit entry whether the
//! operation was permitted or denied. An audit write failure aborts the
//! surrounding operation.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use common::{AuditAction, PrivacyError, VaultEntry};

use crate::audit::{
    AuditError, AuditEvent, AuditLog, AuditQuery, AuditStore, FileAuditStore, MemoryAuditStore,
};
use crate::cipher::{CipherError, FieldCipher};
use crate::config::Config;
use crate::keystore::{self, KeyStoreError};
use crate::rbac::{self, Permission, RbacError, Role};
use crate::redact::{PiiRedactor, RedactionMetadata};
use crate::vault::{MemoryVaultStore, PiiVault, VaultError};

impl From<CipherError> for PrivacyError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::AuthenticationFailure => PrivacyError::AuthenticationFailure,
            CipherError::KeyVersionMismatch { expected, actual } => {
                PrivacyError::KeyVersionMismatch { expected, actual }
            }
            CipherError::KeyStore(inner) => PrivacyError::KeyStore(inner.to_string()),
            CipherError::InvalidFormat(msg) => PrivacyError::Internal(msg),
            CipherError::Serialisation(inner) => PrivacyError::Internal(inner.to_string()),
        }
    }
}

impl From<AuditError> for PrivacyError {
    fn from(e: AuditError) -> Self {
        match e {
            AuditError::JustificationRequired { .. } => {
                PrivacyError::JustificationRequired(e.to_string())
            }
            AuditError::Store(msg) => PrivacyError::AuditWriteFailure(msg),
            AuditError::ChainViolation { entry_id } => {
                PrivacyError::ChainIntegrityViolation { entry_id }
            }
        }
    }
}

impl From<VaultError> for PrivacyError {
    fn from(e: VaultError) -> Self {
        match e {
            VaultError::Unavailable(u) => PrivacyError::VaultUnavailable(u),
            VaultError::Cipher(inner) => inner.into(),
            VaultError::Store(msg) => PrivacyError::Internal(msg),
        }
    }
}

impl From<RbacError> for PrivacyError {
    fn from(e: RbacError) -> Self {
        match e {
            RbacError::PermissionDenied { permission } => {
                PrivacyError::PermissionDenied { permission }
            }
        }
    }
}

impl From<KeyStoreError> for PrivacyError {
    fn from(e: KeyStoreError) -> Self {
        PrivacyError::KeyStore(e.to_string())
    }
}

/// A resolved caller identity.
#[derive(Debug, Clone)]
pub struct Actor {
    pub id: String,
    pub roles: Vec<Role>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn new(id: impl Into<String>, roles: Vec<Role>) -> Self {
        Self {
            id: id.into(),
            roles,
            ip: None,
            user_agent: None,
        }
    }

    fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.as_str().to_owned()).collect()
    }

    fn event(&self) -> AuditEvent {
        AuditEvent {
            ip: self.ip.clone(),
            user_agent: self.user_agent.clone(),
            ..AuditEvent::new(self.id.clone(), self.role_names())
        }
    }
}

/// Outcome of a transcript ingest.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    /// Redacted transcript, safe to store and display.
    pub redacted_text: String,
    /// What was detected and replaced.
    pub redaction: RedactionMetadata,
    /// Id of the escrowed original, when the vault stores one.
    pub vault_entry_id: Option<Uuid>,
}

/// The privacy core.
pub struct PrivacyCore {
    cipher: FieldCipher,
    redactor: PiiRedactor,
    vault: PiiVault,
    audit: AuditLog,
    strict_redaction: bool,
}

impl PrivacyCore {
    /// Assemble a core from already-built components.
    pub fn new(
        cipher: FieldCipher,
        redactor: PiiRedactor,
        vault: PiiVault,
        audit: AuditLog,
        strict_redaction: bool,
    ) -> Self {
        Self {
            cipher,
            redactor,
            vault,
            audit,
            strict_redaction,
        }
    }

    /// Build the core from configuration: key store per `key_store_mode`,
    /// file-backed audit log when `audit_log_path` is set, in-memory vault
    /// store.
    pub async fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let keys = keystore::from_config(cfg).await?;
        let cipher = FieldCipher::new(keys.clone());
        let redactor = PiiRedactor::new(cfg.redaction_mode, cfg.hipaa_safe_harbor);
        let vault = PiiVault::new(
            cfg.pii_storage_mode,
            cfg.vault_ttl_days,
            keys,
            Arc::new(MemoryVaultStore::new()),
        );
        let store: Arc<dyn AuditStore> = match &cfg.audit_log_path {
            Some(path) => Arc::new(FileAuditStore::new(path)),
            None => Arc::new(MemoryAuditStore::new()),
        };
        let audit = AuditLog::open(store).await?;

        info!("privacy core initialised");
        Ok(Self::new(cipher, redactor, vault, audit, cfg.strict_redaction))
    }

    pub fn cipher(&self) -> &FieldCipher {
        &self.cipher
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    /// Redact a transcript, escrow the original per vault policy, and record
    /// the write.
    ///
    /// # Errors
    ///
    /// [`PrivacyError::RedactionRejected`] when strict redaction is enabled
    /// and the redacted output still matches a high-precision pattern; the
    /// rejected write is itself audited.
    pub async fn ingest_transcript(
        &self,
        actor: &Actor,
        collection: &str,
        record_id: &str,
        transcript: &str,
    ) -> Result<IngestResult, PrivacyError> {
        let (redacted_text, redaction) = self.redactor.redact(transcript);

        let mut event = actor.event();
        event.target_collection = Some(collection.to_owned());
        event.target_id = Some(record_id.to_owned());
        event.metadata = serde_json::json!({
            "total_redactions": redaction.total_redactions,
            "validated": redaction.validated,
        });

        if self.strict_redaction && !redaction.validated {
            warn!(record_id, "write rejected: residual pii after redaction");
            self.audit.record(AuditAction::Write, false, event).await?;
            return Err(PrivacyError::RedactionRejected);
        }

        let mut aad = Map::new();
        aad.insert("collection".into(), Value::String(collection.to_owned()));
        aad.insert("record_id".into(), Value::String(record_id.to_owned()));
        let vault_entry_id = self
            .vault
            .escrow(transcript, aad)
            .await?
            .map(|entry| entry.id);

        self.audit.record(AuditAction::Write, true, event).await?;

        Ok(IngestResult {
            redacted_text,
            redaction,
            vault_entry_id,
        })
    }

    /// Encrypt the named fields of a record document and record the write.
    pub async fn protect_document(
        &self,
        actor: &Actor,
        collection: &str,
        record_id: &str,
        document: &Value,
        field_names: &[&str],
    ) -> Result<Value, PrivacyError> {
        let mut aad = Map::new();
        aad.insert("collection".into(), Value::String(collection.to_owned()));
        aad.insert("record_id".into(), Value::String(record_id.to_owned()));

        let sealed = self
            .cipher
            .encrypt_document_fields(document, field_names, aad)
            .await;

        let mut event = actor.event();
        event.target_collection = Some(collection.to_owned());
        event.target_id = Some(record_id.to_owned());
        event.fields_accessed = field_names.iter().map(|f| (*f).to_owned()).collect();
        self.audit
            .record(AuditAction::Write, sealed.is_ok(), event)
            .await?;

        Ok(sealed?)
    }

    /// Decrypt fields of a protected document. Requires the
    /// `decrypt_fields` permission and a justification; denied attempts are
    /// audited too.
    pub async fn decrypt_fields(
        &self,
        actor: &Actor,
        collection: &str,
        record_id: &str,
        document: &Value,
        field_names: Option<&[&str]>,
        justification: &str,
    ) -> Result<Value, PrivacyError> {
        let permitted = rbac::check_permission(&actor.roles, Permission::DecryptFields);

        let mut event = actor.event();
        event.target_collection = Some(collection.to_owned());
        event.target_id = Some(record_id.to_owned());
        event.justification = Some(justification.to_owned());
        if let Some(fields) = field_names {
            event.fields_accessed = fields.iter().map(|f| (*f).to_owned()).collect();
        }

        if !permitted {
            self.audit
                .record(AuditAction::Decrypt, false, event)
                .await?;
            return Err(RbacError::PermissionDenied {
                permission: Permission::DecryptFields.as_str().to_owned(),
            }
            .into());
        }

        let opened = self
            .cipher
            .decrypt_document_fields(document, field_names)
            .await;
        self.audit
            .record(AuditAction::Decrypt, opened.is_ok(), event)
            .await?;

        Ok(opened?)
    }

    /// Return a copy of `document` filtered to what the actor's roles may
    /// see, and record the read.
    pub async fn view_record(
        &self,
        actor: &Actor,
        collection: &str,
        record_id: &str,
        document: &Map<String, Value>,
    ) -> Result<Map<String, Value>, PrivacyError> {
        let filtered = rbac::filter_response(document, &actor.roles);

        let mut event = actor.event();
        event.target_collection = Some(collection.to_owned());
        event.target_id = Some(record_id.to_owned());
        self.audit.record(AuditAction::Read, true, event).await?;

        Ok(filtered)
    }

    /// Retrieve an escrowed original from the vault. Requires the
    /// `decrypt_fields` permission; every attempt is audited.
    pub async fn retrieve_original(
        &self,
        actor: &Actor,
        entry_id: Uuid,
        justification: &str,
    ) -> Result<String, PrivacyError> {
        let permitted = rbac::check_permission(&actor.roles, Permission::DecryptFields);

        let mut event = actor.event();
        event.target_id = Some(entry_id.to_string());
        event.justification = Some(justification.to_owned());

        if !permitted {
            self.audit
                .record(AuditAction::VaultRetrieve, false, event)
                .await?;
            return Err(RbacError::PermissionDenied {
                permission: Permission::DecryptFields.as_str().to_owned(),
            }
            .into());
        }

        let original = self.vault.retrieve(entry_id).await;
        self.audit
            .record(AuditAction::VaultRetrieve, original.is_ok(), event)
            .await?;

        Ok(original?)
    }

    /// Rotate the encryption key. Requires the `manage_encryption`
    /// permission. Returns the new current version.
    pub async fn rotate_keys(&self, actor: &Actor) -> Result<String, PrivacyError> {
        rbac::require_permission(&actor.roles, Permission::ManageEncryption)?;

        let new_version = self.cipher.key_store().rotate_key().await?;

        let mut event = actor.event();
        event.metadata = serde_json::json!({"new_version": new_version});
        self.audit
            .record(AuditAction::KeyRotation, true, event)
            .await?;

        info!(version = %new_version, "encryption key rotated");
        Ok(new_version)
    }

    /// Purge expired vault entries. Requires the `background_jobs`
    /// permission; meant for the system retention sweep.
    pub async fn run_retention_sweep(&self, actor: &Actor) -> Result<usize, PrivacyError> {
        rbac::require_permission(&actor.roles, Permission::BackgroundJobs)?;

        let removed = self.vault.purge_expired().await?;

        let mut event = actor.event();
        event.metadata = serde_json::json!({"vault_entries_removed": removed});
        self.audit
            .record(AuditAction::RetentionRun, true, event)
            .await?;

        Ok(removed)
    }

    /// Filtered read of the audit log. Requires the `view_audit_logs`
    /// permission; the query itself is audited.
    pub async fn query_audit_log(
        &self,
        actor: &Actor,
        query: &AuditQuery,
    ) -> Result<Vec<common::AuditLogEntry>, PrivacyError> {
        rbac::require_permission(&actor.roles, Permission::ViewAuditLogs)?;
        Ok(self.audit.query(query, actor.event()).await?)
    }

    /// Verify the audit chain over up to `limit` entries, returning the
    /// number checked. Requires the `view_audit_logs` permission.
    pub async fn verify_audit_chain(
        &self,
        actor: &Actor,
        limit: usize,
    ) -> Result<usize, PrivacyError> {
        rbac::require_permission(&actor.roles, Permission::ViewAuditLogs)?;
        Ok(self.audit.verify_chain_integrity(limit).await?)
    }

    /// Escrow arbitrary pre-redaction text directly, recording the escrow.
    /// Used by callers that redact outside [`PrivacyCore::ingest_transcript`].
    pub async fn escrow_original(
        &self,
        actor: &Actor,
        original: &str,
        associated_data: Map<String, Value>,
    ) -> Result<Option<VaultEntry>, PrivacyError> {
        let entry = self.vault.escrow(original, associated_data).await?;

        let mut event = actor.event();
        event.target_id = entry.as_ref().map(|e| e.id.to_string());
        self.audit
            .record(AuditAction::VaultEscrow, true, event)
            .await?;

        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::LocalKeyStore;
    use crate::redact::RedactionMode;
    use crate::vault::VaultMode;
    use serde_json::json;

    async fn core_with(
        dir: &tempfile::TempDir,
        vault_mode: VaultMode,
        strict: bool,
    ) -> PrivacyCore {
        let keys = Arc::new(LocalKeyStore::open(dir.path(), "v1", 90).unwrap());
        let cipher = FieldCipher::new(keys.clone());
        let redactor = PiiRedactor::new(RedactionMode::Mask, false);
        let vault = PiiVault::new(vault_mode, 7, keys, Arc::new(MemoryVaultStore::new()));
        let audit = AuditLog::open(Arc::new(MemoryAuditStore::new()))
            .await
            .unwrap();
        PrivacyCore::new(cipher, redactor, vault, audit, strict)
    }

    fn admin() -> Actor {
        Actor::new("admin-1", vec![Role::Admin])
    }

    fn analyst() -> Actor {
        Actor::new("analyst-1", vec![Role::Analyst])
    }

    #[tokio::test]
    async fn ingest_redacts_and_escrows() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::StoreEncryptedWithKey, false).await;

        let result = core
            .ingest_transcript(
                &analyst(),
                "transcripts",
                "r1",
                "email me at a@b.com or call 555-123-4567",
            )
            .await
            .unwrap();

        assert_eq!(
            result.redacted_text,
            "email me at [EMAIL_1] or call [PHONE_1]"
        );
        assert_eq!(result.redaction.total_redactions, 2);
        let entry_id = result.vault_entry_id.expect("original escrowed");

        // The admin can recover the original through the vault.
        let original = core
            .retrieve_original(&admin(), entry_id, "verifying redaction quality")
            .await
            .unwrap();
        assert_eq!(original, "email me at a@b.com or call 555-123-4567");
    }

    #[tokio::test]
    async fn ingest_without_escrow_when_vault_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;
        let result = core
            .ingest_transcript(&analyst(), "transcripts", "r1", "call 555-123-4567")
            .await
            .unwrap();
        assert!(result.vault_entry_id.is_none());
    }

    #[tokio::test]
    async fn protect_then_decrypt_document() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;

        let document = json!({"transcript": "call 555-000-1111", "score": 91});
        let sealed = core
            .protect_document(&admin(), "transcripts", "r1", &document, &["transcript"])
            .await
            .unwrap();
        assert!(sealed.get("transcript").is_none());

        let opened = core
            .decrypt_fields(
                &admin(),
                "transcripts",
                "r1",
                &sealed,
                None,
                "support ticket #4411 investigation",
            )
            .await
            .unwrap();
        assert_eq!(opened["transcript"], "call 555-000-1111");
        assert_eq!(opened["score"], 91);
    }

    #[tokio::test]
    async fn decrypt_denied_for_analyst_and_audited() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;

        let document = json!({"transcript": "secret", "score": 1});
        let sealed = core
            .protect_document(&admin(), "transcripts", "r1", &document, &["transcript"])
            .await
            .unwrap();

        let denied = core
            .decrypt_fields(
                &analyst(),
                "transcripts",
                "r1",
                &sealed,
                None,
                "curious about the transcript",
            )
            .await;
        assert!(matches!(
            denied,
            Err(PrivacyError::PermissionDenied { permission }) if permission == "decrypt_fields"
        ));

        // Denial shows up in the audit trail as a failed decrypt.
        let entries = core
            .query_audit_log(
                &admin(),
                &AuditQuery {
                    action: Some(AuditAction::Decrypt),
                    success: Some(false),
                    ..AuditQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].actor_id, "analyst-1");
    }

    #[tokio::test]
    async fn decrypt_without_justification_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;

        let document = json!({"transcript": "secret"});
        let sealed = core
            .protect_document(&admin(), "transcripts", "r1", &document, &["transcript"])
            .await
            .unwrap();

        assert!(matches!(
            core.decrypt_fields(&admin(), "transcripts", "r1", &sealed, None, "")
                .await,
            Err(PrivacyError::JustificationRequired(_))
        ));
    }

    #[tokio::test]
    async fn strict_mode_accepts_validated_redaction() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, true).await;

        let ok = core
            .ingest_transcript(&analyst(), "transcripts", "r1", "call 555-123-4567")
            .await
            .unwrap();
        assert!(ok.redaction.validated);

        let writes = core
            .query_audit_log(
                &admin(),
                &AuditQuery {
                    action: Some(AuditAction::Write),
                    ..AuditQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(writes.len(), 1);
        assert!(writes[0].success);
    }

    #[tokio::test]
    async fn view_record_filters_by_role() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;

        let document = json!({"id": "r1", "redacted_text": "x", "score": 9});
        let document = document.as_object().unwrap();

        let reader_view = core
            .view_record(&Actor::new("reader-1", vec![Role::Reader]), "t", "r1", document)
            .await
            .unwrap();
        assert_eq!(reader_view["redacted_text"], rbac::REDACTED_MARKER);

        let admin_view = core.view_record(&admin(), "t", "r1", document).await.unwrap();
        assert_eq!(admin_view["redacted_text"], "x");
    }

    #[tokio::test]
    async fn rotation_requires_manage_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;

        assert!(matches!(
            core.rotate_keys(&analyst()).await,
            Err(PrivacyError::PermissionDenied { .. })
        ));

        let new_version = core.rotate_keys(&admin()).await.unwrap();
        assert_eq!(new_version, "v2");
    }

    #[tokio::test]
    async fn retention_sweep_is_system_only() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::StoreEncryptedWithKey, false).await;

        assert!(matches!(
            core.run_retention_sweep(&admin()).await,
            Err(PrivacyError::PermissionDenied { .. })
        ));

        let system = Actor::new("sweeper", vec![Role::System]);
        assert_eq!(core.run_retention_sweep(&system).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn audit_chain_verifies_after_mixed_operations() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::StoreEncryptedWithKey, false).await;

        core.ingest_transcript(&analyst(), "t", "r1", "call 555-123-4567")
            .await
            .unwrap();
        let doc = json!({"transcript": "hello"});
        core.protect_document(&admin(), "t", "r1", &doc, &["transcript"])
            .await
            .unwrap();
        core.rotate_keys(&admin()).await.unwrap();

        let checked = core.verify_audit_chain(&admin(), 100).await.unwrap();
        assert!(checked >= 3);
    }

    #[tokio::test]
    async fn audit_query_requires_permission() {
        let dir = tempfile::tempdir().unwrap();
        let core = core_with(&dir, VaultMode::NeverStoreOriginal, false).await;
        assert!(matches!(
            core.query_audit_log(&analyst(), &AuditQuery::default()).await,
            Err(PrivacyError::PermissionDenied { .. })
        ));
    }
}
