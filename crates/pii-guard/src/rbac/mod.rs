//! Role hierarchy, permission table, and response-field filtering.
//!
//! Roles form a strict hierarchy: `System > Admin > Analyst > Reader`.
//! Both the permission table and the per-role allowed-field sets are static
//! `match` tables. Filtering replaces disallowed values with an explicit
//! marker instead of omitting the key, so the response shape never leaks
//! which fields exist.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

/// Marker substituted for fields the caller's role may not see.
pub const REDACTED_MARKER: &str = "[REDACTED - Insufficient permissions]";

/// Errors produced by RBAC checks.
#[derive(Debug, Error)]
pub enum RbacError {
    /// The caller's roles grant none of the required permission.
    #[error("permission denied: missing permission '{permission}'")]
    PermissionDenied {
        /// Name of the missing permission.
        permission: String,
    },
}

/// Closed set of roles, ordered by rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Reader,
    Analyst,
    Admin,
    System,
}

impl Role {
    /// Parse a role name; unknown names are rejected rather than defaulted.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "reader" => Some(Self::Reader),
            "analyst" => Some(Self::Analyst),
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reader => "reader",
            Self::Analyst => "analyst",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }

    /// The role plus every role it subsumes.
    pub fn effective_roles(self) -> &'static [Role] {
        match self {
            Self::System => &[Self::System, Self::Admin, Self::Analyst, Self::Reader],
            Self::Admin => &[Self::Admin, Self::Analyst, Self::Reader],
            Self::Analyst => &[Self::Analyst, Self::Reader],
            Self::Reader => &[Self::Reader],
        }
    }

    /// True iff this role can act as `required`.
    pub fn has_permission(self, required: Role) -> bool {
        self.effective_roles().contains(&required)
    }

    /// Static permission table.
    pub fn grants(self, permission: Permission) -> bool {
        use Permission::*;
        match self {
            Self::Reader => matches!(
                permission,
                ViewMetadata | ViewAnonymizedResults | RequestAccess
            ),
            Self::Analyst => matches!(
                permission,
                ViewMetadata
                    | ViewAnonymizedResults
                    | ViewAnalysis
                    | ViewRedactedText
                    | RequestAccess
            ),
            // Admins approve access instead of requesting it.
            Self::Admin => matches!(
                permission,
                ViewMetadata
                    | ViewAnonymizedResults
                    | ViewAnalysis
                    | ViewRedactedText
                    | DecryptFields
                    | ManageRoles
                    | ViewAuditLogs
                    | ApproveAccess
                    | ManageEncryption
            ),
            Self::System => matches!(
                permission,
                ViewMetadata
                    | ViewAnonymizedResults
                    | ViewAnalysis
                    | ViewRedactedText
                    | DecryptFields
                    | ManageRoles
                    | ViewAuditLogs
                    | ManageEncryption
                    | BackgroundJobs
                    | SystemOperations
            ),
        }
    }

    /// Fields this role may see in a response.
    fn allowed_fields(self) -> FieldSet {
        match self {
            Self::Reader => FieldSet::Named(&[
                "id",
                "user_id",
                "consent_id",
                "timestamp",
                "created_at",
                "anonymized_answer",
                "score",
                "feedback",
                "status",
            ]),
            Self::Analyst => FieldSet::Named(&[
                "id",
                "user_id",
                "consent_id",
                "timestamp",
                "created_at",
                "anonymized_answer",
                "redacted_text",
                "tokens",
                "analysis",
                "score",
                "feedback",
                "facial_analysis",
                "status",
            ]),
            Self::Admin | Self::System => FieldSet::All,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named operations the permission table covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    ViewMetadata,
    ViewAnonymizedResults,
    ViewAnalysis,
    ViewRedactedText,
    DecryptFields,
    ManageRoles,
    ViewAuditLogs,
    RequestAccess,
    ApproveAccess,
    ManageEncryption,
    BackgroundJobs,
    SystemOperations,
}

impl Permission {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ViewMetadata => "view_metadata",
            Self::ViewAnonymizedResults => "view_anonymized_results",
            Self::ViewAnalysis => "view_analysis",
            Self::ViewRedactedText => "view_redacted_text",
            Self::DecryptFields => "decrypt_fields",
            Self::ManageRoles => "manage_roles",
            Self::ViewAuditLogs => "view_audit_logs",
            Self::RequestAccess => "request_access",
            Self::ApproveAccess => "approve_access",
            Self::ManageEncryption => "manage_encryption",
            Self::BackgroundJobs => "background_jobs",
            Self::SystemOperations => "system_operations",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed-field set of a role: either everything or a fixed list.
#[derive(Debug, Clone, Copy)]
enum FieldSet {
    All,
    Named(&'static [&'static str]),
}

/// True if any of `roles` grants `permission`.
pub fn check_permission(roles: &[Role], permission: Permission) -> bool {
    roles.iter().any(|r| r.grants(permission))
}

/// [`check_permission`] as a hard requirement.
///
/// # Errors
///
/// [`RbacError::PermissionDenied`] carrying the permission name.
pub fn require_permission(roles: &[Role], permission: Permission) -> Result<(), RbacError> {
    if check_permission(roles, permission) {
        return Ok(());
    }
    warn!(%permission, ?roles, "permission check failed");
    Err(RbacError::PermissionDenied {
        permission: permission.as_str().to_owned(),
    })
}

/// Highest-ranked role among `roles`; `Reader` when empty.
pub fn highest_role(roles: &[Role]) -> Role {
    roles.iter().copied().max().unwrap_or(Role::Reader)
}

/// Replace fields the caller's highest role may not see with
/// [`REDACTED_MARKER`].
///
/// Keys are kept so the response shape does not reveal which fields exist.
/// Underscore-prefixed keys (encryption and redaction metadata) always pass.
/// A wildcard allowed-field set means no filtering at all.
pub fn filter_response(data: &Map<String, Value>, roles: &[Role]) -> Map<String, Value> {
    let allowed = match highest_role(roles).allowed_fields() {
        FieldSet::All => return data.clone(),
        FieldSet::Named(fields) => fields,
    };

    data.iter()
        .map(|(key, value)| {
            if key.starts_with('_') || allowed.contains(&key.as_str()) {
                (key.clone(), value.clone())
            } else {
                (key.clone(), Value::String(REDACTED_MARKER.to_owned()))
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hierarchy_is_strict() {
        assert!(Role::System.has_permission(Role::Reader));
        assert!(Role::Admin.has_permission(Role::Analyst));
        assert!(Role::Analyst.has_permission(Role::Reader));
        assert!(!Role::Reader.has_permission(Role::Analyst));
        assert!(!Role::Admin.has_permission(Role::System));
    }

    #[test]
    fn effective_roles_include_self() {
        for role in [Role::Reader, Role::Analyst, Role::Admin, Role::System] {
            assert!(role.effective_roles().contains(&role));
        }
        assert_eq!(Role::Reader.effective_roles(), &[Role::Reader]);
    }

    #[test]
    fn permission_table_matches_rank() {
        assert!(!check_permission(&[Role::Analyst], Permission::DecryptFields));
        assert!(check_permission(&[Role::Admin], Permission::DecryptFields));
        assert!(check_permission(&[Role::System], Permission::BackgroundJobs));
        assert!(!check_permission(&[Role::Admin], Permission::BackgroundJobs));
        // Admins approve access, they do not request it.
        assert!(!check_permission(&[Role::Admin], Permission::RequestAccess));
        assert!(check_permission(&[Role::Reader], Permission::RequestAccess));
    }

    #[test]
    fn any_role_granting_suffices() {
        assert!(check_permission(
            &[Role::Reader, Role::Admin],
            Permission::ViewAuditLogs
        ));
        assert!(!check_permission(&[], Permission::ViewMetadata));
    }

    #[test]
    fn require_permission_names_the_missing_permission() {
        let err = require_permission(&[Role::Reader], Permission::DecryptFields).unwrap_err();
        assert!(err.to_string().contains("decrypt_fields"));
    }

    #[test]
    fn highest_role_defaults_to_reader() {
        assert_eq!(highest_role(&[]), Role::Reader);
        assert_eq!(highest_role(&[Role::Analyst, Role::Admin]), Role::Admin);
    }

    #[test]
    fn filter_marks_disallowed_fields() {
        let data = json!({
            "id": "r1",
            "score": 88,
            "redacted_text": "[NAME_1] called",
            "_encryption_metadata": {"encrypted": true},
        });
        let data = data.as_object().unwrap();

        let filtered = filter_response(data, &[Role::Reader]);
        assert_eq!(filtered["id"], "r1");
        assert_eq!(filtered["score"], 88);
        assert_eq!(filtered["redacted_text"], REDACTED_MARKER);
        // Shape is preserved, nothing is dropped.
        assert_eq!(filtered.len(), data.len());
        // Metadata keys always pass.
        assert_eq!(filtered["_encryption_metadata"], data["_encryption_metadata"]);
    }

    #[test]
    fn analyst_sees_redacted_text_but_not_unknown_fields() {
        let data = json!({"redacted_text": "x", "raw_transcript": "y"});
        let filtered = filter_response(data.as_object().unwrap(), &[Role::Analyst]);
        assert_eq!(filtered["redacted_text"], "x");
        assert_eq!(filtered["raw_transcript"], REDACTED_MARKER);
    }

    #[test]
    fn wildcard_roles_skip_filtering() {
        let data = json!({"anything": 1, "raw_transcript": "y"});
        let data = data.as_object().unwrap();
        assert_eq!(filter_response(data, &[Role::Admin]), *data);
        assert_eq!(filter_response(data, &[Role::System]), *data);
    }

    #[test]
    fn role_parsing_is_closed() {
        assert_eq!(Role::parse("analyst"), Some(Role::Analyst));
        assert_eq!(Role::parse("superuser"), None);
    }

    #[test]
    fn role_serde_forms_are_stable() {
        assert_eq!(serde_json::to_string(&Role::Admin).unwrap(), "\"admin\"");
        let r: Role = serde_json::from_str("\"system\"").unwrap();
        assert_eq!(r, Role::System);
    }
}
