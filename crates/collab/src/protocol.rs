//! WebSocket wire protocol for collaboration sessions.
//!
//! All frames are JSON text tagged by `message_type`. Unknown fields are
//! ignored on ingress; the server never emits unknown fields.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tmi_core::diagram::{Cell, Point};
use tmi_core::session::{DiagramOperation, Participant, RejectReason};

/// WebSocket close codes used by the engine.
pub mod close_code {
    /// Normal closure.
    pub const NORMAL: u16 = 1000;
    /// Backpressure drop: the connection's outbound queue overflowed.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Credential missing or invalid at upgrade time.
    pub const UNAUTHORIZED: u16 = 4401;
    /// Authenticated but no role on the diagram.
    pub const FORBIDDEN: u16 = 4403;
    /// Session terminated by conflict shutdown.
    pub const CONFLICT: u16 = 4409;
}

/// Client → server frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a diagram operation. Requires writer-or-better.
    Operation {
        #[serde(flatten)]
        operation: DiagramOperation,
    },
    /// Ask to become presenter.
    PresenterRequest,
    /// Give presenter back to the host.
    PresenterYield,
    /// Ephemeral pointer position. Not persisted, rate-limited.
    Cursor { position: Point },
    /// Liveness probe; the server replies with `pong`.
    Ping,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An accepted operation, echoed to every participant including the
    /// author. All participants observe these in the same order.
    OperationApplied {
        server_assigned_version: u64,
        author_uuid: Uuid,
        operation: DiagramOperation,
    },
    OperationRejected {
        operation_id: Uuid,
        reason: RejectReason,
        requires_resync: bool,
        affected_cells: Vec<Uuid>,
    },
    /// Authoritative cell state. Full when `affected_cells` is absent,
    /// else restricted to those ids.
    StateCorrection {
        diagram_version: u64,
        cells: Vec<Cell>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        affected_cells: Option<Vec<Uuid>>,
    },
    ParticipantJoined {
        participant: Participant,
    },
    ParticipantLeft {
        user_uuid: Uuid,
    },
    PresenterChanged {
        presenter_user_uuid: Uuid,
    },
    HostChanged {
        host_user_uuid: Uuid,
    },
    /// Fanned-out cursor update, excluding the sender.
    Cursor {
        user_uuid: Uuid,
        position: Point,
    },
    Pong,
    /// The session has seen no operations for the configured window.
    IdleWarning {
        grace_secs: u64,
    },
    /// The session is going away (last leave, admin, shutdown).
    SessionClosing {
        reason: String,
    },
}
