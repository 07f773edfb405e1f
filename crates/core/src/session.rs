//! Collaboration session types shared by the engine and the gateway.
//!
//! A session is a live editing context bound to one diagram. At most one
//! active session exists per diagram; the engine owns all session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::diagram::{Cell, Geometry, Point};
use crate::identity::Role;

/// One connected participant. A user appears at most once per session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub user_uuid: Uuid,
    pub email: String,
    pub display_name: String,
    pub connection_id: Uuid,
    /// Role snapshotted at join and enforced for the session's lifetime.
    pub role_at_session_start: Role,
    pub joined_at: DateTime<Utc>,
    pub is_host: bool,
    pub is_presenter: bool,
}

/// A session descriptor as surfaced over REST.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub id: Uuid,
    pub threat_model_id: Uuid,
    pub diagram_id: Uuid,
    pub host_user_uuid: Uuid,
    pub presenter_user_uuid: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub diagram_version: u64,
    pub participants: Vec<Participant>,
    /// Path a client should upgrade a WebSocket on.
    pub websocket_url: String,
}

/// A client-submitted batch of sub-operations against one diagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagramOperation {
    /// Client-supplied id used for idempotency and rejection correlation.
    pub operation_id: Uuid,
    /// The diagram version the client believed was current.
    pub base_version: u64,
    /// Applied atomically, in order.
    pub ops: Vec<CellOp>,
}

/// One sub-operation. `expected_change_counter` carries the client's view of
/// the per-cell counter for conflict detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CellOp {
    AddCell {
        cell: Cell,
    },
    UpdateCell {
        id: Uuid,
        expected_change_counter: u64,
        patch: CellPatch,
    },
    RemoveCell {
        id: Uuid,
        expected_change_counter: u64,
    },
}

impl CellOp {
    /// The cell id this sub-operation targets.
    pub fn target_id(&self) -> Uuid {
        match self {
            CellOp::AddCell { cell } => cell.id,
            CellOp::UpdateCell { id, .. } => *id,
            CellOp::RemoveCell { id, .. } => *id,
        }
    }
}

/// A partial cell update. Absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geometry: Option<Geometry>,
    /// Empty string clears the style.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waypoints: Option<Vec<Point>>,
}

/// Why an operation was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Forbidden,
    StaleBaseVersion,
    InvalidReference,
    Conflict,
}

impl RejectReason {
    /// Whether a client must resynchronize before retrying.
    pub fn requires_resync(&self) -> bool {
        matches!(
            self,
            RejectReason::StaleBaseVersion | RejectReason::Conflict
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagram::Cell;

    #[test]
    fn cell_op_target_id() {
        let id = Uuid::new_v4();
        let add = CellOp::AddCell {
            cell: Cell::node(id, "process", Geometry::default()),
        };
        assert_eq!(add.target_id(), id);

        let upd = CellOp::UpdateCell {
            id,
            expected_change_counter: 3,
            patch: CellPatch::default(),
        };
        assert_eq!(upd.target_id(), id);
    }

    #[test]
    fn reject_reasons_requiring_resync() {
        assert!(RejectReason::StaleBaseVersion.requires_resync());
        assert!(RejectReason::Conflict.requires_resync());
        assert!(!RejectReason::Forbidden.requires_resync());
        assert!(!RejectReason::InvalidReference.requires_resync());
    }

    #[test]
    fn operation_json_uses_snake_case_op_tags() {
        let op = DiagramOperation {
            operation_id: Uuid::new_v4(),
            base_version: 0,
            ops: vec![CellOp::RemoveCell {
                id: Uuid::new_v4(),
                expected_change_counter: 1,
            }],
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["ops"][0]["op"], "remove_cell");
    }

    #[test]
    fn empty_patch_leaves_all_fields_absent() {
        let p: CellPatch = serde_json::from_str("{}").unwrap();
        assert!(p.shape.is_none());
        assert!(p.geometry.is_none());
        assert!(p.style.is_none());
        assert!(p.data.is_none());
        assert!(p.waypoints.is_none());
    }
}
