//! Domain change records — the change-data-capture feed from store commits.
//!
//! Every committed mutation produces one `ChangeRecord` published to the
//! domain topic of the event bus after the transaction commits. Downstream
//! consumers (webhook fan-out, addon triggers) must tolerate duplicates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::model::{ObjectKind, ResourceRef};

/// Topic carrying all domain change records.
pub const DOMAIN_TOPIC: &str = "domain-events";

/// What happened to the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Created,
    Updated,
    Deleted,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::Created => "created",
            ChangeAction::Updated => "updated",
            ChangeAction::Deleted => "deleted",
        }
    }
}

/// Compose the dotted event kind string, e.g. `threat_model.updated`.
pub fn event_kind(kind: ObjectKind, action: ChangeAction) -> String {
    format!("{}.{}", kind.as_str(), action.as_str())
}

/// A single committed domain mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Unique per logical mutation; duplicates on the bus share this id.
    pub event_id: Uuid,
    /// Dotted kind, e.g. `diagram.updated`.
    pub event_kind: String,
    pub resource: ResourceRef,
    /// The containing threat model, when the resource has one.
    pub threat_model_id: Option<Uuid>,
    /// Who performed the mutation.
    pub actor_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub committed_at: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn new(
        kind: ObjectKind,
        action: ChangeAction,
        resource_id: Uuid,
        threat_model_id: Option<Uuid>,
        actor_uuid: Uuid,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_kind: event_kind(kind, action),
            resource: ResourceRef::new(kind, resource_id),
            threat_model_id,
            actor_uuid,
            before: None,
            after: None,
            committed_at: Utc::now(),
        }
    }

    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    pub fn with_after(mut self, after: Value) -> Self {
        self.after = Some(after);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_format() {
        assert_eq!(
            event_kind(ObjectKind::ThreatModel, ChangeAction::Updated),
            "threat_model.updated"
        );
        assert_eq!(
            event_kind(ObjectKind::Diagram, ChangeAction::Created),
            "diagram.created"
        );
    }

    #[test]
    fn change_record_carries_resource_ref() {
        let id = Uuid::new_v4();
        let tm = Uuid::new_v4();
        let rec = ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Deleted,
            id,
            Some(tm),
            Uuid::new_v4(),
        );
        assert_eq!(rec.resource.id, id);
        assert_eq!(rec.resource.kind, ObjectKind::Diagram);
        assert_eq!(rec.threat_model_id, Some(tm));
        assert_eq!(rec.event_kind, "diagram.deleted");
    }

    #[test]
    fn before_after_omitted_when_absent() {
        let rec = ChangeRecord::new(
            ObjectKind::Threat,
            ChangeAction::Created,
            Uuid::new_v4(),
            None,
            Uuid::new_v4(),
        );
        let json = serde_json::to_value(&rec).unwrap();
        assert!(json.get("before").is_none());
        assert!(json.get("after").is_none());
    }
}
