//! Session state and the operation acceptance algorithm.
//!
//! This module is pure: no I/O, no clocks beyond timestamps passed in by
//! the actor. The actor in `actor.rs` is the only mutator.

use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

use chrono::{DateTime, Utc};
use tmi_core::diagram::{Cell, CellBody, Diagram};
use tmi_core::identity::Role;
use tmi_core::session::{
    CellOp, CellPatch, DiagramOperation, Participant, RejectReason, SessionDescriptor,
};

use crate::protocol::ServerMessage;

/// A cell plus its engine-maintained change counter.
#[derive(Debug, Clone)]
struct CellEntry {
    cell: Cell,
    change_counter: u64,
}

/// Result of feeding one operation through the acceptance algorithm.
#[derive(Debug, Clone)]
pub enum ApplyResult {
    /// Previously processed `operation_id`: re-emit to the sender only.
    Duplicate(ServerMessage),
    /// Accepted: broadcast to all participants, author included.
    Applied(ServerMessage),
    /// Rejected: send to the author only.
    Rejected(ServerMessage),
}

/// What happened when a participant left.
#[derive(Debug)]
pub struct LeaveOutcome {
    pub left: Option<Participant>,
    /// Broadcasts triggered by the leave (left / host / presenter).
    pub events: Vec<ServerMessage>,
    /// True when the session must end (no writer-or-better remains).
    pub ended: bool,
}

/// All state owned by one session's serial processor.
pub struct SessionState {
    pub session_id: Uuid,
    pub threat_model_id: Uuid,
    pub diagram_id: Uuid,
    pub host: Uuid,
    pub presenter: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Current diagram version; monotone, incremented per accepted op.
    pub version: u64,
    /// Version last known persisted through the domain store.
    pub last_persisted_version: u64,
    /// Accepted operations since the last persistence.
    pub dirty_ops: u64,

    cells: HashMap<Uuid, CellEntry>,
    order: Vec<Uuid>,
    participants: Vec<Participant>,

    processed: HashMap<Uuid, ApplyResult>,
    processed_order: VecDeque<Uuid>,
    processed_cap: usize,
}

impl SessionState {
    /// Build session state from the persisted diagram.
    pub fn from_diagram(session_id: Uuid, diagram: &Diagram, processed_cap: usize) -> Self {
        let mut cells = HashMap::new();
        let mut order = Vec::with_capacity(diagram.cells.len());
        for cell in &diagram.cells {
            order.push(cell.id);
            cells.insert(
                cell.id,
                CellEntry {
                    cell: cell.clone(),
                    change_counter: 0,
                },
            );
        }
        let now = Utc::now();
        Self {
            session_id,
            threat_model_id: diagram.threat_model_id,
            diagram_id: diagram.id,
            host: Uuid::nil(),
            presenter: Uuid::nil(),
            created_at: now,
            last_activity_at: now,
            version: diagram.version,
            last_persisted_version: diagram.version,
            dirty_ops: 0,
            cells,
            order,
            participants: Vec::new(),
            processed: HashMap::new(),
            processed_order: VecDeque::new(),
            processed_cap: processed_cap.max(1),
        }
    }

    // --- Participants ---

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn participant_by_connection(&self, connection_id: Uuid) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.connection_id == connection_id)
    }

    pub fn has_user(&self, user_uuid: Uuid) -> bool {
        self.participants.iter().any(|p| p.user_uuid == user_uuid)
    }

    /// Add a participant. The first writer-or-better to join a fresh
    /// session becomes host and presenter; readers never hold either.
    pub fn add_participant(&mut self, mut participant: Participant) -> Participant {
        let hostless = self.host.is_nil() || !self.has_user(self.host);
        if hostless && participant.role_at_session_start.can_write() {
            participant.is_host = true;
            participant.is_presenter = true;
            self.host = participant.user_uuid;
            self.presenter = participant.user_uuid;
        }
        self.participants.push(participant.clone());
        self.last_activity_at = Utc::now();
        participant
    }

    /// Remove by connection id, applying host/presenter transfer rules.
    pub fn remove_participant(&mut self, connection_id: Uuid) -> LeaveOutcome {
        let Some(idx) = self
            .participants
            .iter()
            .position(|p| p.connection_id == connection_id)
        else {
            return LeaveOutcome {
                left: None,
                events: Vec::new(),
                ended: false,
            };
        };
        let leaver = self.participants.remove(idx);
        let mut events = vec![ServerMessage::ParticipantLeft {
            user_uuid: leaver.user_uuid,
        }];

        if self.participants.is_empty() {
            return LeaveOutcome {
                left: Some(leaver),
                events,
                ended: true,
            };
        }

        if leaver.is_host {
            // Longest-connected writer-or-better takes over
            match self
                .participants
                .iter_mut()
                .filter(|p| p.role_at_session_start.can_write())
                .min_by_key(|p| p.joined_at)
            {
                Some(next) => {
                    next.is_host = true;
                    let next_uuid = next.user_uuid;
                    self.host = next_uuid;
                    events.push(ServerMessage::HostChanged {
                        host_user_uuid: next_uuid,
                    });
                    if leaver.is_presenter {
                        self.set_presenter(next_uuid, &mut events);
                    }
                }
                None => {
                    // Only readers remain: the session ends
                    return LeaveOutcome {
                        left: Some(leaver),
                        events,
                        ended: true,
                    };
                }
            }
        } else if leaver.is_presenter {
            let host = self.host;
            self.set_presenter(host, &mut events);
        }

        LeaveOutcome {
            left: Some(leaver),
            events,
            ended: false,
        }
    }

    fn set_presenter(&mut self, user_uuid: Uuid, events: &mut Vec<ServerMessage>) {
        for p in self.participants.iter_mut() {
            p.is_presenter = p.user_uuid == user_uuid;
        }
        if self.presenter != user_uuid {
            self.presenter = user_uuid;
            events.push(ServerMessage::PresenterChanged {
                presenter_user_uuid: user_uuid,
            });
        }
    }

    /// Presenter request: writer-or-better participants may take presenter.
    pub fn request_presenter(&mut self, user_uuid: Uuid) -> Vec<ServerMessage> {
        let mut events = Vec::new();
        let eligible = self
            .participants
            .iter()
            .any(|p| p.user_uuid == user_uuid && p.role_at_session_start.can_write());
        if eligible {
            self.set_presenter(user_uuid, &mut events);
        }
        events
    }

    /// Presenter yield: presenter hands control back to the host.
    pub fn yield_presenter(&mut self, user_uuid: Uuid) -> Vec<ServerMessage> {
        let mut events = Vec::new();
        if self.presenter == user_uuid {
            let host = self.host;
            self.set_presenter(host, &mut events);
        }
        events
    }

    // --- Cells ---

    /// Cells in stable order, for persistence and corrections.
    pub fn cells_snapshot(&self) -> Vec<Cell> {
        self.order
            .iter()
            .filter_map(|id| self.cells.get(id).map(|e| e.cell.clone()))
            .collect()
    }

    /// Subset snapshot restricted to `ids` (missing ids are skipped: the
    /// client drops its local copy of a cell absent from the correction).
    pub fn cells_subset(&self, ids: &[Uuid]) -> Vec<Cell> {
        ids.iter()
            .filter_map(|id| self.cells.get(id).map(|e| e.cell.clone()))
            .collect()
    }

    pub fn correction_full(&self) -> ServerMessage {
        ServerMessage::StateCorrection {
            diagram_version: self.version,
            cells: self.cells_snapshot(),
            affected_cells: None,
        }
    }

    pub fn correction_for(&self, ids: &[Uuid]) -> ServerMessage {
        ServerMessage::StateCorrection {
            diagram_version: self.version,
            cells: self.cells_subset(ids),
            affected_cells: Some(ids.to_vec()),
        }
    }

    /// Reset state to a freshly re-read diagram (external-edit recovery).
    pub fn reset_from_diagram(&mut self, diagram: &Diagram) {
        self.cells.clear();
        self.order.clear();
        for cell in &diagram.cells {
            self.order.push(cell.id);
            self.cells.insert(
                cell.id,
                CellEntry {
                    cell: cell.clone(),
                    change_counter: 0,
                },
            );
        }
        self.version = diagram.version;
        self.last_persisted_version = diagram.version;
        self.dirty_ops = 0;
    }

    pub fn mark_persisted(&mut self) {
        self.last_persisted_version = self.version;
        self.dirty_ops = 0;
    }

    // --- Acceptance algorithm ---

    /// Feed one operation through acceptance. `author_role` is the role
    /// snapshotted at join.
    pub fn apply_operation(
        &mut self,
        author_uuid: Uuid,
        author_role: Role,
        operation: DiagramOperation,
        stale_tolerance: u64,
    ) -> ApplyResult {
        // 1. Idempotency
        if let Some(prior) = self.processed.get(&operation.operation_id) {
            return ApplyResult::Duplicate(match prior {
                ApplyResult::Applied(m)
                | ApplyResult::Rejected(m)
                | ApplyResult::Duplicate(m) => m.clone(),
            });
        }

        let result = self.evaluate(author_uuid, author_role, &operation, stale_tolerance);
        self.remember(operation.operation_id, result.clone());
        self.last_activity_at = Utc::now();
        result
    }

    fn evaluate(
        &mut self,
        author_uuid: Uuid,
        author_role: Role,
        operation: &DiagramOperation,
        stale_tolerance: u64,
    ) -> ApplyResult {
        // 2. Authorization
        if !author_role.can_write() {
            return ApplyResult::Rejected(ServerMessage::OperationRejected {
                operation_id: operation.operation_id,
                reason: RejectReason::Forbidden,
                requires_resync: false,
                affected_cells: Vec::new(),
            });
        }

        let targets: Vec<Uuid> = operation.ops.iter().map(CellOp::target_id).collect();

        // 3. Staleness. Add-only operations reference no existing cell
        // state, so the window does not apply to them; concurrent adds are
        // accepted in arrival order even under a strict window.
        let touches_existing = operation
            .ops
            .iter()
            .any(|op| !matches!(op, CellOp::AddCell { .. }));
        if touches_existing && operation.base_version < self.version.saturating_sub(stale_tolerance)
        {
            return ApplyResult::Rejected(ServerMessage::OperationRejected {
                operation_id: operation.operation_id,
                reason: RejectReason::StaleBaseVersion,
                requires_resync: true,
                affected_cells: targets,
            });
        }

        // 4. Structural validation over a simulated cell-id universe
        if let Err(bad) = self.validate_structure(operation) {
            return ApplyResult::Rejected(ServerMessage::OperationRejected {
                operation_id: operation.operation_id,
                reason: RejectReason::InvalidReference,
                requires_resync: false,
                affected_cells: bad,
            });
        }

        // 5. Conflict detection, atomic over the whole operation
        let mismatched = self.detect_conflicts(operation);
        if !mismatched.is_empty() {
            return ApplyResult::Rejected(ServerMessage::OperationRejected {
                operation_id: operation.operation_id,
                reason: RejectReason::Conflict,
                requires_resync: true,
                affected_cells: mismatched,
            });
        }

        // 6. Apply in sub-op order
        for op in &operation.ops {
            match op {
                CellOp::AddCell { cell } => {
                    self.order.push(cell.id);
                    self.cells.insert(
                        cell.id,
                        CellEntry {
                            cell: cell.clone(),
                            change_counter: 1,
                        },
                    );
                }
                CellOp::UpdateCell { id, patch, .. } => {
                    if let Some(entry) = self.cells.get_mut(id) {
                        apply_patch(&mut entry.cell, patch);
                        entry.change_counter += 1;
                    }
                }
                CellOp::RemoveCell { id, .. } => {
                    self.cells.remove(id);
                    self.order.retain(|cid| cid != id);
                }
            }
        }
        self.version += 1;
        self.dirty_ops += 1;

        // 7. Broadcast payload: canonical echo with the assigned version
        ApplyResult::Applied(ServerMessage::OperationApplied {
            server_assigned_version: self.version,
            author_uuid,
            operation: operation.clone(),
        })
    }

    /// Validate ids against the current arena plus in-operation adds and
    /// removes, then check that no edge is left dangling afterwards.
    fn validate_structure(&self, operation: &DiagramOperation) -> Result<(), Vec<Uuid>> {
        let mut universe: HashSet<Uuid> = self.cells.keys().copied().collect();
        let mut bad: Vec<Uuid> = Vec::new();

        for op in &operation.ops {
            match op {
                CellOp::AddCell { cell } => {
                    if universe.contains(&cell.id) {
                        bad.push(cell.id);
                        continue;
                    }
                    universe.insert(cell.id);
                }
                CellOp::UpdateCell { id, .. } | CellOp::RemoveCell { id, .. } => {
                    if !universe.contains(id) {
                        bad.push(*id);
                        continue;
                    }
                    if matches!(op, CellOp::RemoveCell { .. }) {
                        universe.remove(id);
                    }
                }
            }
        }
        if !bad.is_empty() {
            return Err(bad);
        }

        // Edge endpoints must land in the post-operation universe
        for op in &operation.ops {
            let endpoints: Vec<Uuid> = match op {
                CellOp::AddCell { cell } => cell.endpoints(),
                CellOp::UpdateCell { patch, .. } => {
                    let mut eps = Vec::new();
                    if let Some(s) = patch.source {
                        eps.push(s);
                    }
                    if let Some(t) = patch.target {
                        eps.push(t);
                    }
                    if eps.is_empty() {
                        continue;
                    }
                    eps
                }
                CellOp::RemoveCell { .. } => continue,
            };
            for ep in endpoints {
                if !universe.contains(&ep) {
                    bad.push(ep);
                }
            }
        }

        // Removing a node must not orphan surviving edges
        for op in &operation.ops {
            if let CellOp::RemoveCell { id, .. } = op {
                for entry in self.cells.values() {
                    if entry.cell.id != *id
                        && universe.contains(&entry.cell.id)
                        && entry.cell.endpoints().contains(id)
                    {
                        bad.push(entry.cell.id);
                    }
                }
            }
        }

        if bad.is_empty() { Ok(()) } else { Err(bad) }
    }

    /// Compare supplied expected counters against current ones. Cells added
    /// within the same operation are exempt (their counter is new).
    fn detect_conflicts(&self, operation: &DiagramOperation) -> Vec<Uuid> {
        let added: HashSet<Uuid> = operation
            .ops
            .iter()
            .filter_map(|op| match op {
                CellOp::AddCell { cell } => Some(cell.id),
                _ => None,
            })
            .collect();

        let mut mismatched = Vec::new();
        for op in &operation.ops {
            let (id, expected) = match op {
                CellOp::UpdateCell {
                    id,
                    expected_change_counter,
                    ..
                }
                | CellOp::RemoveCell {
                    id,
                    expected_change_counter,
                } => (*id, *expected_change_counter),
                CellOp::AddCell { .. } => continue,
            };
            if added.contains(&id) {
                continue;
            }
            if let Some(entry) = self.cells.get(&id)
                && entry.change_counter != expected
            {
                mismatched.push(id);
            }
        }
        mismatched
    }

    fn remember(&mut self, operation_id: Uuid, result: ApplyResult) {
        self.processed.insert(operation_id, result);
        self.processed_order.push_back(operation_id);
        while self.processed_order.len() > self.processed_cap {
            if let Some(evicted) = self.processed_order.pop_front() {
                self.processed.remove(&evicted);
            }
        }
    }

    /// Point-in-time descriptor for REST surfacing.
    pub fn descriptor(&self, websocket_url: String) -> SessionDescriptor {
        SessionDescriptor {
            id: self.session_id,
            threat_model_id: self.threat_model_id,
            diagram_id: self.diagram_id,
            host_user_uuid: self.host,
            presenter_user_uuid: self.presenter,
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            diagram_version: self.version,
            participants: self.participants.clone(),
            websocket_url,
        }
    }
}

/// Apply a partial update to a cell, honoring its kind.
fn apply_patch(cell: &mut Cell, patch: &CellPatch) {
    match &mut cell.body {
        CellBody::Node {
            shape,
            geometry,
            style,
            data,
        } => {
            if let Some(s) = &patch.shape {
                *shape = s.clone();
            }
            if let Some(g) = patch.geometry {
                *geometry = g;
            }
            if let Some(s) = &patch.style {
                *style = if s.is_empty() { None } else { Some(s.clone()) };
            }
            if let Some(d) = &patch.data {
                *data = d.clone();
            }
        }
        CellBody::Edge {
            shape,
            source,
            target,
            waypoints,
            style,
            data,
        } => {
            if let Some(s) = &patch.shape {
                *shape = s.clone();
            }
            if let Some(src) = patch.source {
                *source = src;
            }
            if let Some(tgt) = patch.target {
                *target = tgt;
            }
            if let Some(w) = &patch.waypoints {
                *waypoints = w.clone();
            }
            if let Some(s) = &patch.style {
                *style = if s.is_empty() { None } else { Some(s.clone()) };
            }
            if let Some(d) = &patch.data {
                *data = d.clone();
            }
        }
    }
}
