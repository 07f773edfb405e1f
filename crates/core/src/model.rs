//! Threat model entities — the resource tree everything hangs off.
//!
//! A `ThreatModel` owns diagrams and typed subresources (threats, assets,
//! documents, notes, repositories, metadata). Authorization is attached to
//! the threat model only; subresources inherit it through their parent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identity::Role;

/// The kinds of objects addressable by authorization, events, and addons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    ThreatModel,
    Diagram,
    Threat,
    Asset,
    Document,
    Note,
    Repository,
    Metadata,
    User,
    WebhookSubscription,
    Addon,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::ThreatModel => "threat_model",
            ObjectKind::Diagram => "diagram",
            ObjectKind::Threat => "threat",
            ObjectKind::Asset => "asset",
            ObjectKind::Document => "document",
            ObjectKind::Note => "note",
            ObjectKind::Repository => "repository",
            ObjectKind::Metadata => "metadata",
            ObjectKind::User => "user",
            ObjectKind::WebhookSubscription => "webhook_subscription",
            ObjectKind::Addon => "addon",
        }
    }

    pub fn parse(s: &str) -> Option<ObjectKind> {
        match s {
            "threat_model" => Some(ObjectKind::ThreatModel),
            "diagram" => Some(ObjectKind::Diagram),
            "threat" => Some(ObjectKind::Threat),
            "asset" => Some(ObjectKind::Asset),
            "document" => Some(ObjectKind::Document),
            "note" => Some(ObjectKind::Note),
            "repository" => Some(ObjectKind::Repository),
            "metadata" => Some(ObjectKind::Metadata),
            "user" => Some(ObjectKind::User),
            "webhook_subscription" => Some(ObjectKind::WebhookSubscription),
            "addon" => Some(ObjectKind::Addon),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to a single addressable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ObjectKind,
    pub id: Uuid,
}

impl ResourceRef {
    pub fn new(kind: ObjectKind, id: Uuid) -> Self {
        Self { kind, id }
    }
}

/// One authorization grant on a threat model.
///
/// `subject` is either a user email or a group name; group grants carry the
/// provider they are scoped to (`"*"` for system groups).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub subject: String,
    #[serde(default)]
    pub subject_kind: SubjectKind,
    /// Provider scope for group subjects. Ignored for user subjects.
    #[serde(default = "default_grant_provider")]
    pub provider: String,
    pub role: Role,
}

fn default_grant_provider() -> String {
    crate::identity::WILDCARD_PROVIDER.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    #[default]
    User,
    Group,
}

impl Grant {
    pub fn user(email: impl Into<String>, role: Role) -> Self {
        Self {
            subject: email.into(),
            subject_kind: SubjectKind::User,
            provider: default_grant_provider(),
            role,
        }
    }

    pub fn group(provider: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            subject: name.into(),
            subject_kind: SubjectKind::Group,
            provider: provider.into(),
            role,
        }
    }
}

/// A threat model: the root of the resource tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatModel {
    pub id: Uuid,
    pub owner_uuid: Uuid,
    /// Email of the owner, used for the implicit owner grant.
    pub owner_email: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Ordered grant list. Exactly one grant with role=owner exists and
    /// matches the owner field.
    #[serde(default)]
    pub authorization: Vec<Grant>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ThreatModel {
    pub fn new(owner_uuid: Uuid, owner_email: impl Into<String>, name: impl Into<String>) -> Self {
        let owner_email = owner_email.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_uuid,
            owner_email: owner_email.clone(),
            name: name.into(),
            description: String::new(),
            authorization: vec![Grant::user(owner_email, Role::Owner)],
            created_at: now,
            modified_at: now,
        }
    }

    /// Check the exactly-one-owner invariant against the owner field.
    pub fn owner_invariant_holds(&self) -> bool {
        let owners: Vec<&Grant> = self
            .authorization
            .iter()
            .filter(|g| g.role == Role::Owner)
            .collect();
        owners.len() == 1 && owners[0].subject == self.owner_email
    }
}

/// A typed subresource of a threat model. The payload carries the
/// kind-specific domain fields; lifecycle is bound to the parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subresource {
    pub id: Uuid,
    pub threat_model_id: Uuid,
    pub kind: ObjectKind,
    pub payload: SubresourcePayload,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Domain fields per subresource kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubresourcePayload {
    Threat {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        severity: Severity,
        #[serde(default)]
        mitigated: bool,
        #[serde(default)]
        diagram_id: Option<Uuid>,
        #[serde(default)]
        cell_id: Option<Uuid>,
    },
    Asset {
        name: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        classification: Option<String>,
    },
    Document {
        name: String,
        url: String,
        #[serde(default)]
        description: String,
    },
    Note {
        content: String,
    },
    Repository {
        url: String,
        #[serde(default)]
        description: String,
    },
    Metadata {
        key: String,
        value: Value,
    },
}

impl SubresourcePayload {
    pub fn object_kind(&self) -> ObjectKind {
        match self {
            SubresourcePayload::Threat { .. } => ObjectKind::Threat,
            SubresourcePayload::Asset { .. } => ObjectKind::Asset,
            SubresourcePayload::Document { .. } => ObjectKind::Document,
            SubresourcePayload::Note { .. } => ObjectKind::Note,
            SubresourcePayload::Repository { .. } => ObjectKind::Repository,
            SubresourcePayload::Metadata { .. } => ObjectKind::Metadata,
        }
    }
}

impl Subresource {
    pub fn new(threat_model_id: Uuid, payload: SubresourcePayload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            threat_model_id,
            kind: payload.object_kind(),
            payload,
            created_at: now,
            modified_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_threat_model_satisfies_owner_invariant() {
        let tm = ThreatModel::new(Uuid::new_v4(), "owner@example.test", "Payments");
        assert!(tm.owner_invariant_holds());
        assert_eq!(tm.authorization.len(), 1);
        assert_eq!(tm.authorization[0].role, Role::Owner);
    }

    #[test]
    fn second_owner_grant_breaks_invariant() {
        let mut tm = ThreatModel::new(Uuid::new_v4(), "owner@example.test", "Payments");
        tm.authorization
            .push(Grant::user("other@example.test", Role::Owner));
        assert!(!tm.owner_invariant_holds());
    }

    #[test]
    fn subresource_kind_follows_payload() {
        let sub = Subresource::new(
            Uuid::new_v4(),
            SubresourcePayload::Threat {
                name: "SQL injection".into(),
                description: String::new(),
                severity: Severity::High,
                mitigated: false,
                diagram_id: None,
                cell_id: None,
            },
        );
        assert_eq!(sub.kind, ObjectKind::Threat);
    }

    #[test]
    fn object_kind_parse_roundtrip() {
        for k in [
            ObjectKind::ThreatModel,
            ObjectKind::Diagram,
            ObjectKind::Threat,
            ObjectKind::Asset,
            ObjectKind::Document,
            ObjectKind::Note,
            ObjectKind::Repository,
            ObjectKind::Metadata,
        ] {
            assert_eq!(ObjectKind::parse(k.as_str()), Some(k));
        }
    }

    #[test]
    fn grant_serde_defaults_provider_to_wildcard() {
        let g: Grant = serde_json::from_str(r#"{"subject":"a@b.c","role":"reader"}"#).unwrap();
        assert_eq!(g.provider, "*");
        assert_eq!(g.subject_kind, SubjectKind::User);
    }
}
