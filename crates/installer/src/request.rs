//! Install and rollback requests.

use crate::error::{InstallError, InstallResult};
use packyard_core::PackManifest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of principal behind a request; stored as `applied_by_type`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    User,
    Service,
    #[default]
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
            Self::System => "system",
        }
    }
}

/// Who asked for the install or rollback.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<String>,
    pub kind: ActorKind,
}

impl Actor {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: ActorKind::User,
        }
    }

    pub fn service(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: ActorKind::Service,
        }
    }

    pub fn system() -> Self {
        Self::default()
    }

    fn validate(&self) -> InstallResult<()> {
        let named = self.id.as_deref().is_some_and(|id| !id.trim().is_empty());
        if self.kind != ActorKind::System && !named {
            return Err(InstallError::InvalidRequest(format!(
                "{} actor requires an id",
                self.kind.as_str()
            )));
        }
        Ok(())
    }
}

/// Request to install one pack release.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub pack_code: String,
    pub release_id: String,
    pub artifact_url: String,
    /// Caller's view of the manifest; any `code`/`release_id` it carries must
    /// match the verified manifest.
    pub manifest_hint: Option<Value>,
    pub actor: Actor,
}

impl InstallRequest {
    pub fn new(
        pack_code: impl Into<String>,
        release_id: impl Into<String>,
        artifact_url: impl Into<String>,
    ) -> Self {
        Self {
            pack_code: pack_code.into(),
            release_id: release_id.into(),
            artifact_url: artifact_url.into(),
            manifest_hint: None,
            actor: Actor::system(),
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_manifest_hint(mut self, hint: Value) -> Self {
        self.manifest_hint = Some(hint);
        self
    }

    /// Reject blank fields before any work happens.
    pub fn validate(&self) -> InstallResult<()> {
        for (field, value) in [
            ("pack_code", &self.pack_code),
            ("release_id", &self.release_id),
            ("artifact_url", &self.artifact_url),
        ] {
            if value.trim().is_empty() {
                return Err(InstallError::InvalidRequest(format!("{field} is required")));
            }
        }
        if let Some(hint) = &self.manifest_hint {
            if !hint.is_object() {
                return Err(InstallError::InvalidRequest(
                    "manifest_hint must be an object".to_string(),
                ));
            }
        }
        self.actor.validate()
    }

    /// Check the verified manifest is the release that was asked for.
    pub fn check_identity(&self, manifest: &PackManifest) -> InstallResult<()> {
        if manifest.code != self.pack_code || manifest.release_id != self.release_id {
            return Err(InstallError::InvalidRequest(format!(
                "requested {}@{} but the artifact contains {}@{}",
                self.pack_code, self.release_id, manifest.code, manifest.release_id
            )));
        }
        if let Some(hint) = &self.manifest_hint {
            for (field, expected) in [
                ("code", manifest.code.as_str()),
                ("release_id", manifest.release_id.as_str()),
            ] {
                match hint.get(field) {
                    None | Some(Value::Null) => {}
                    Some(Value::String(s)) if s == expected => {}
                    Some(other) => {
                        return Err(InstallError::InvalidRequest(format!(
                            "manifest_hint.{field} is {other} but the artifact has {expected:?}"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Which release a rollback undoes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RollbackTarget {
    /// A release record id.
    Record(Uuid),
    /// The applied install record for `(pack_code, release_id)`.
    Release { pack_code: String, release_id: String },
}

/// Request to roll back an applied release.
#[derive(Debug, Clone)]
pub struct RollbackRequest {
    pub target: RollbackTarget,
    pub actor: Actor,
}

impl RollbackRequest {
    pub fn by_record(release_record_id: Uuid) -> Self {
        Self {
            target: RollbackTarget::Record(release_record_id),
            actor: Actor::system(),
        }
    }

    pub fn by_release(pack_code: impl Into<String>, release_id: impl Into<String>) -> Self {
        Self {
            target: RollbackTarget::Release {
                pack_code: pack_code.into(),
                release_id: release_id.into(),
            },
            actor: Actor::system(),
        }
    }

    pub fn with_actor(mut self, actor: Actor) -> Self {
        self.actor = actor;
        self
    }

    pub fn validate(&self) -> InstallResult<()> {
        if let RollbackTarget::Release {
            pack_code,
            release_id,
        } = &self.target
        {
            if pack_code.trim().is_empty() || release_id.trim().is_empty() {
                return Err(InstallError::InvalidRequest(
                    "pack_code and release_id are required".to_string(),
                ));
            }
        }
        self.actor.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blank_fields_rejected() {
        let req = InstallRequest::new("crm", " ", "mem://x");
        assert!(matches!(req.validate(), Err(InstallError::InvalidRequest(_))));

        let req = InstallRequest::new("crm", "20240601.001", "mem://x").with_actor(Actor {
            id: None,
            kind: ActorKind::User,
        });
        assert!(req.validate().is_err());

        let ok =
            InstallRequest::new("crm", "20240601.001", "mem://x").with_actor(Actor::user("u1"));
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_manifest_hint_must_agree() {
        let manifest = PackManifest::from_yaml_str(
            r#"
code: crm
release_id: "20240601.001"
signing: { public_key_id: k1 }
install: { apply_order: [views] }
"#,
        )
        .unwrap();

        let req = InstallRequest::new("crm", "20240601.001", "mem://x")
            .with_manifest_hint(json!({"code": "crm", "title": "CRM"}));
        assert!(req.check_identity(&manifest).is_ok());

        let req = InstallRequest::new("crm", "20240601.001", "mem://x")
            .with_manifest_hint(json!({"release_id": "20240601.002"}));
        assert!(matches!(
            req.check_identity(&manifest),
            Err(InstallError::InvalidRequest(_))
        ));

        let req = InstallRequest::new("billing", "20240601.001", "mem://x");
        assert!(req.check_identity(&manifest).is_err());
    }
}
