//! Document-level field encryption over `serde_json::Value` objects.
//!
//! Each encrypted logical field `F` is removed from the document and
//! replaced by a reserved key `_encrypted_F` holding the [`EncryptedValue`]
//! wire shape; an `_encryption_metadata` block records exactly which fields
//! are encrypted and under which key version. Metadata and encrypted-field
//! presence stay consistent at all times: decrypting a subset of fields
//! rewrites the metadata for the remainder instead of dropping it.

use serde_json::{json, Map, Value};

use common::{EncryptedValue, ALGORITHM};

use super::{CipherError, FieldCipher};

/// Reserved prefix for encrypted field keys.
pub const ENCRYPTED_FIELD_PREFIX: &str = "_encrypted_";

/// Reserved key of the per-document encryption metadata block.
pub const ENCRYPTION_METADATA_KEY: &str = "_encryption_metadata";

impl FieldCipher {
    /// Encrypt the named fields of `document`, replacing each plaintext
    /// field with its `_encrypted_<F>` counterpart and writing the
    /// `_encryption_metadata` block.
    ///
    /// A field that is absent or `null` is skipped, not encrypted as empty.
    /// Each field's associated data carries `field_name` plus the
    /// caller-supplied context, so a ciphertext cannot be moved between
    /// fields without failing authentication.
    ///
    /// # Errors
    ///
    /// Fails if `document` is not a JSON object or if any single field
    /// fails to encrypt (all-or-nothing per field; the input document is
    /// never half-mutated because we operate on a copy).
    pub async fn encrypt_document_fields(
        &self,
        document: &Value,
        field_names: &[&str],
        associated_data: Map<String, Value>,
    ) -> Result<Value, CipherError> {
        let obj = document
            .as_object()
            .ok_or_else(|| CipherError::InvalidFormat("document must be a JSON object".into()))?;

        let mut out = obj.clone();
        let mut field_metadata = Map::new();
        let mut encrypted_fields = Vec::new();

        for field in field_names {
            let value = match obj.get(*field) {
                None | Some(Value::Null) => continue,
                Some(v) => v,
            };

            let mut field_aad = associated_data.clone();
            field_aad.insert("field_name".into(), Value::String((*field).to_owned()));

            let sealed = self.encrypt_field(value, None, field_aad).await?;
            let sealed_value = serde_json::to_value(&sealed)?;

            field_metadata.insert(
                (*field).to_owned(),
                json!({
                    "key_version": sealed.key_version,
                    "encrypted_at": sealed.encrypted_at,
                }),
            );
            encrypted_fields.push(Value::String((*field).to_owned()));

            out.remove(*field);
            out.insert(format!("{ENCRYPTED_FIELD_PREFIX}{field}"), sealed_value);
        }

        let current_version = self.key_store().get_current_version().await?;
        out.insert(
            ENCRYPTION_METADATA_KEY.to_owned(),
            json!({
                "encrypted": true,
                "encrypted_fields": encrypted_fields,
                "field_metadata": field_metadata,
                "key_version": current_version,
            }),
        );

        Ok(Value::Object(out))
    }

    /// Decrypt a caller-selected subset of the document's encrypted fields
    /// (default: all), restoring original field names and removing the
    /// encrypted variants.
    ///
    /// Metadata for fields that remain encrypted is preserved; the metadata
    /// block is removed entirely once no encrypted field is left.
    ///
    /// # Errors
    ///
    /// Propagates any authentication or key-store failure from the
    /// underlying field decryption.
    pub async fn decrypt_document_fields(
        &self,
        document: &Value,
        field_names: Option<&[&str]>,
    ) -> Result<Value, CipherError> {
        let obj = document
            .as_object()
            .ok_or_else(|| CipherError::InvalidFormat("document must be a JSON object".into()))?;

        // A document without the metadata block is not encrypted.
        let Some(metadata) = obj.get(ENCRYPTION_METADATA_KEY) else {
            return Ok(document.clone());
        };
        let encrypted_fields: Vec<String> = metadata
            .get("encrypted_fields")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let selected: Vec<String> = match field_names {
            Some(names) => names
                .iter()
                .map(|n| (*n).to_owned())
                .filter(|n| encrypted_fields.contains(n))
                .collect(),
            None => encrypted_fields.clone(),
        };

        let mut out = obj.clone();
        let mut decrypted = Vec::new();

        for field in &selected {
            let encrypted_key = format!("{ENCRYPTED_FIELD_PREFIX}{field}");
            let Some(raw) = obj.get(&encrypted_key) else {
                continue;
            };
            let sealed: EncryptedValue = serde_json::from_value(raw.clone())?;
            let plaintext = self.decrypt_field(&sealed, None).await?;

            out.remove(&encrypted_key);
            out.insert(field.clone(), plaintext);
            decrypted.push(field.clone());
        }

        // Keep metadata consistent with what is still encrypted.
        let remaining: Vec<String> = encrypted_fields
            .iter()
            .filter(|f| !decrypted.contains(f))
            .cloned()
            .collect();
        if remaining.is_empty() {
            out.remove(ENCRYPTION_METADATA_KEY);
        } else if let Some(Value::Object(meta)) = out.get_mut(ENCRYPTION_METADATA_KEY) {
            meta.insert(
                "encrypted_fields".into(),
                Value::Array(remaining.iter().cloned().map(Value::String).collect()),
            );
            if let Some(Value::Object(field_meta)) = meta.get_mut("field_metadata") {
                field_meta.retain(|k, _| remaining.contains(k));
            }
        }

        Ok(Value::Object(out))
    }
}

/// Structural integrity check of a raw encrypted-value object without
/// decrypting: required keys present and the algorithm tag matches.
///
/// Cheap validation to run before an expensive KMS round trip; it proves
/// shape, not authenticity.
pub fn verify_encryption_integrity(raw: &Value) -> bool {
    let Some(obj) = raw.as_object() else {
        return false;
    };
    let required = ["ciphertext", "nonce", "key_version", "algorithm"];
    if !required.iter().all(|k| obj.contains_key(*k)) {
        return false;
    }
    obj.get("algorithm").and_then(Value::as_str) == Some(ALGORITHM)
}

/// Extract the encryption metadata block, if the document carries one.
pub fn encryption_metadata(document: &Value) -> Option<&Value> {
    document.get(ENCRYPTION_METADATA_KEY)
}

/// Returns `true` if the named logical field is recorded as encrypted.
pub fn is_field_encrypted(document: &Value, field: &str) -> bool {
    encryption_metadata(document)
        .and_then(|m| m.get("encrypted_fields"))
        .and_then(Value::as_array)
        .map(|a| a.iter().any(|f| f.as_str() == Some(field)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::LocalKeyStore;
    use std::sync::Arc;

    fn test_cipher(dir: &tempfile::TempDir) -> FieldCipher {
        let store = LocalKeyStore::open(dir.path(), "v1", 90).unwrap();
        FieldCipher::new(Arc::new(store))
    }

    fn session_aad() -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("session".into(), json!("s1"));
        m
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_document() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = test_cipher(&dir);

        let doc = json!({"transcript": "call 555-000-1111", "score": 91});
        let sealed = cipher
            .encrypt_document_fields(&doc, &["transcript"], session_aad())
            .await
            .unwrap();

        assert!(sealed.get("transcript").is_none());
        assert!(sealed.get("_encrypted_transcript").is_some());
        assert_eq!(sealed["score"], 91);
        assert_eq!(
            sealed[ENCRYPTION_METADATA_KEY]["encrypted_fields"],
            json!(["transcript"])
        );
        assert!(is_field_encrypted(&sealed, "transcript"));
        assert!(!is_field_encrypted(&sealed, "score"));

        let opened = cipher
            .decrypt_document_fields(&sealed, None)
            .await
            .unwrap();
        assert_eq!(opened["transcript"], "call 555-000-1111");
        assert!(opened.get("_encrypted_transcript").is_none());
        assert!(opened.get(ENCRYPTION_METADATA_KEY).is_none());
    }

    #[tokio::test]
    async fn null_and_absent_fields_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = test_cipher(&dir);

        let doc = json!({"transcript": null, "score": 91});
        let sealed = cipher
            .encrypt_document_fields(&doc, &["transcript", "missing"], Map::new())
            .await
            .unwrap();

        assert!(sealed.get("_encrypted_transcript").is_none());
        assert_eq!(sealed["transcript"], Value::Null);
        assert_eq!(
            sealed[ENCRYPTION_METADATA_KEY]["encrypted_fields"],
            json!([])
        );
    }

    #[tokio::test]
    async fn subset_decryption_preserves_remaining_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = test_cipher(&dir);

        let doc = json!({"transcript": "hello", "analysis": {"tone": "calm"}});
        let sealed = cipher
            .encrypt_document_fields(&doc, &["transcript", "analysis"], Map::new())
            .await
            .unwrap();

        let partial = cipher
            .decrypt_document_fields(&sealed, Some(&["transcript"]))
            .await
            .unwrap();
        assert_eq!(partial["transcript"], "hello");
        assert!(partial.get("_encrypted_analysis").is_some());
        assert_eq!(
            partial[ENCRYPTION_METADATA_KEY]["encrypted_fields"],
            json!(["analysis"])
        );
        assert!(
            partial[ENCRYPTION_METADATA_KEY]["field_metadata"]
                .get("transcript")
                .is_none()
        );

        let full = cipher
            .decrypt_document_fields(&partial, None)
            .await
            .unwrap();
        assert_eq!(full["analysis"], json!({"tone": "calm"}));
        assert!(full.get(ENCRYPTION_METADATA_KEY).is_none());
    }

    #[tokio::test]
    async fn unencrypted_document_passes_through() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = test_cipher(&dir);
        let doc = json!({"score": 42});
        let out = cipher.decrypt_document_fields(&doc, None).await.unwrap();
        assert_eq!(out, doc);
    }

    #[tokio::test]
    async fn structural_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let cipher = test_cipher(&dir);
        let sealed = cipher
            .encrypt_field(&json!("x"), None, Map::new())
            .await
            .unwrap();
        let raw = serde_json::to_value(&sealed).unwrap();
        assert!(verify_encryption_integrity(&raw));

        let mut missing = raw.clone();
        missing.as_object_mut().unwrap().remove("nonce");
        assert!(!verify_encryption_integrity(&missing));

        let mut wrong_algo = raw;
        wrong_algo["algorithm"] = json!("AES-128-CBC");
        assert!(!verify_encryption_integrity(&wrong_algo));
    }
}
