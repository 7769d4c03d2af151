//! End-to-end flow over the public API: ingest a transcript, protect the
//! record, filter views by role, decrypt with justification, and verify the
//! audit chain across the whole sequence.

use serde_json::json;

use pii_guard::audit::AuditQuery;
use pii_guard::config::Config;
use pii_guard::core::{Actor, PrivacyCore};
use pii_guard::rbac::{Role, REDACTED_MARKER};
use pii_guard::vault::VaultMode;
use pii_guard::PrivacyError;

fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        key_store_path: dir.path().join("keys"),
        audit_log_path: Some(dir.path().join("audit.jsonl")),
        pii_storage_mode: VaultMode::StoreEncryptedWithKey,
        ..Config::default()
    }
}

#[tokio::test]
async fn transcript_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let core = PrivacyCore::from_config(&test_config(&dir)).await.unwrap();

    let analyst = Actor::new("analyst-7", vec![Role::Analyst]);
    let admin = Actor::new("admin-1", vec![Role::Admin]);
    let reader = Actor::new("reader-3", vec![Role::Reader]);

    // Ingest: redaction plus escrow of the original.
    let ingest = core
        .ingest_transcript(&analyst, "transcripts", "rec-1", "call 555-000-1111")
        .await
        .unwrap();
    assert_eq!(ingest.redacted_text, "call [PHONE_1]");
    assert_eq!(ingest.redaction.counts["phone"], 1);
    let escrow_id = ingest.vault_entry_id.expect("vault stores originals");

    // Protect the record document.
    let record = json!({
        "id": "rec-1",
        "transcript": "call 555-000-1111",
        "redacted_text": ingest.redacted_text,
        "score": 91,
    });
    let sealed = core
        .protect_document(&admin, "transcripts", "rec-1", &record, &["transcript"])
        .await
        .unwrap();
    assert!(sealed.get("transcript").is_none());
    assert!(sealed.get("_encrypted_transcript").is_some());
    assert_eq!(sealed["score"], 91);

    // Role-filtered views keep the shape but hide disallowed fields.
    let reader_view = core
        .view_record(&reader, "transcripts", "rec-1", sealed.as_object().unwrap())
        .await
        .unwrap();
    assert_eq!(reader_view["redacted_text"], REDACTED_MARKER);
    assert_eq!(reader_view["score"], 91);
    assert_eq!(
        reader_view["_encryption_metadata"],
        sealed["_encryption_metadata"]
    );

    // Analysts cannot decrypt, and the denial is audited.
    let denied = core
        .decrypt_fields(
            &analyst,
            "transcripts",
            "rec-1",
            &sealed,
            None,
            "reviewing call quality metrics",
        )
        .await;
    assert!(matches!(denied, Err(PrivacyError::PermissionDenied { .. })));

    // Admins can, with a justification.
    let opened = core
        .decrypt_fields(
            &admin,
            "transcripts",
            "rec-1",
            &sealed,
            None,
            "support ticket #991: dispute over quoted price",
        )
        .await
        .unwrap();
    assert_eq!(opened["transcript"], "call 555-000-1111");
    assert!(opened.get("_encryption_metadata").is_none());

    // The escrowed original is recoverable too.
    let original = core
        .retrieve_original(&admin, escrow_id, "verifying redaction quality")
        .await
        .unwrap();
    assert_eq!(original, "call 555-000-1111");

    // Every step above, permitted or denied, is on the chain.
    let checked = core.verify_audit_chain(&admin, 100).await.unwrap();
    assert!(checked >= 6);

    let denials = core
        .query_audit_log(
            &admin,
            &AuditQuery {
                success: Some(false),
                ..AuditQuery::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(denials.len(), 1);
    assert_eq!(denials[0].actor_id, "analyst-7");
}

#[tokio::test]
async fn rotation_preserves_old_ciphertexts() {
    let dir = tempfile::tempdir().unwrap();
    let core = PrivacyCore::from_config(&test_config(&dir)).await.unwrap();
    let admin = Actor::new("admin-1", vec![Role::Admin]);

    let record = json!({"transcript": "pre-rotation text"});
    let sealed = core
        .protect_document(&admin, "transcripts", "rec-1", &record, &["transcript"])
        .await
        .unwrap();

    let new_version = core.rotate_keys(&admin).await.unwrap();
    assert_eq!(new_version, "v2");

    // Old ciphertexts still decrypt under their deprecated key.
    let opened = core
        .decrypt_fields(
            &admin,
            "transcripts",
            "rec-1",
            &sealed,
            None,
            "post-rotation verification sweep",
        )
        .await
        .unwrap();
    assert_eq!(opened["transcript"], "pre-rotation text");
}
