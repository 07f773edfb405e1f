//! Addon registration and invocation entities.
//!
//! Addons are admin-registered webhook extensions. Any authenticated user
//! with reader-or-better on the target's threat model may invoke an
//! applicable addon; progress flows back through signed status callbacks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::ObjectKind;

/// Maximum invocation payload size in bytes.
pub const MAX_INVOCATION_PAYLOAD: usize = 1024;

/// An admin-registered addon referencing an active webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonRegistration {
    pub id: Uuid,
    pub name: String,
    pub webhook_id: Uuid,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon: Option<String>,
    /// Object kinds this addon can be invoked on.
    pub objects: Vec<ObjectKind>,
    /// Restrict to one threat model when set.
    pub threat_model_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl AddonRegistration {
    pub fn applies_to(&self, kind: ObjectKind, threat_model_id: Uuid) -> bool {
        if let Some(scope) = self.threat_model_id
            && scope != threat_model_id
        {
            return false;
        }
        self.objects.contains(&kind)
    }
}

/// Invocation lifecycle. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl InvocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationStatus::Pending => "pending",
            InvocationStatus::InProgress => "in_progress",
            InvocationStatus::Completed => "completed",
            InvocationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(InvocationStatus::Pending),
            "in_progress" => Some(InvocationStatus::InProgress),
            "completed" => Some(InvocationStatus::Completed),
            "failed" => Some(InvocationStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InvocationStatus::Completed | InvocationStatus::Failed)
    }
}

/// One user-initiated addon invocation. Stored with finite retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonInvocation {
    pub id: Uuid,
    pub addon_id: Uuid,
    pub invoker_user_uuid: Uuid,
    pub target_object_kind: ObjectKind,
    pub target_object_id: Uuid,
    /// Caller-supplied payload, at most [`MAX_INVOCATION_PAYLOAD`] bytes.
    #[serde(default)]
    pub payload: String,
    pub status: InvocationStatus,
    /// 0..=100.
    pub status_percent: u8,
    #[serde(default)]
    pub status_message: String,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
}

impl AddonInvocation {
    pub fn new(
        addon_id: Uuid,
        invoker: Uuid,
        target_object_kind: ObjectKind,
        target_object_id: Uuid,
        payload: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            addon_id,
            invoker_user_uuid: invoker,
            target_object_kind,
            target_object_id,
            payload,
            status: InvocationStatus::Pending,
            status_percent: 0,
            status_message: String::new(),
            created_at: now,
            status_updated_at: now,
        }
    }
}
