//! Threat-model and diagram REST surface.
//!
//! The CRUD routes that feed the event stream: every mutation lands in the
//! domain store, which emits a change record to the bus after commit.
//! Threats stand in for the subresource family on the HTTP surface; the
//! other kinds share the same store path.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde::Deserialize;
use uuid::Uuid;

use tmi_core::diagram::{Diagram, DiagramKind};
use tmi_core::error::Error;
use tmi_core::identity::Role;
use tmi_core::model::{
    Grant, ObjectKind, ResourceRef, Severity, Subresource, SubresourcePayload, ThreatModel,
};

use crate::{ApiError, AuthedUser, SharedState};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/threat_models", post(create_threat_model))
        .route("/threat_models", get(list_threat_models))
        .route("/threat_models/{id}", get(get_threat_model))
        .route("/threat_models/{id}", put(update_threat_model))
        .route("/threat_models/{id}", delete(delete_threat_model))
        .route("/threat_models/{id}/diagrams", post(create_diagram))
        .route("/threat_models/{id}/diagrams", get(list_diagrams))
        .route("/threat_models/{id}/diagrams/{diagram_id}", get(get_diagram))
        .route("/threat_models/{id}/diagrams/{diagram_id}", put(update_diagram))
        .route(
            "/threat_models/{id}/diagrams/{diagram_id}",
            delete(delete_diagram),
        )
        .route("/threat_models/{id}/threats", post(create_threat))
        .route("/threat_models/{id}/threats", get(list_threats))
        .route("/threat_models/{id}/threats/{threat_id}", delete(delete_threat))
}

// ── Threat models ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateThreatModelRequest {
    name: String,
    #[serde(default)]
    description: String,
    /// Additional non-owner grants. The caller becomes the single owner.
    #[serde(default)]
    authorization: Vec<Grant>,
}

async fn create_threat_model(
    State(state): State<SharedState>,
    user: AuthedUser,
    Json(req): Json<CreateThreatModelRequest>,
) -> Result<(StatusCode, Json<ThreatModel>), ApiError> {
    if req.name.trim().is_empty() {
        return Err(Error::InvalidArgument("name must not be empty".into()).into());
    }
    if req.authorization.iter().any(|g| g.role == Role::Owner) {
        return Err(Error::InvalidArgument(
            "additional owner grants are not allowed; ownership is the caller's".into(),
        )
        .into());
    }

    let mut tm = ThreatModel::new(
        user.principal.internal_uuid,
        &user.principal.email,
        req.name,
    );
    tm.description = req.description;
    tm.authorization.extend(req.authorization);

    state
        .store
        .create_threat_model(&tm, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok((StatusCode::CREATED, Json(tm)))
}

async fn list_threat_models(
    State(state): State<SharedState>,
    user: AuthedUser,
) -> Result<Json<Vec<ThreatModel>>, ApiError> {
    let visible = state
        .authz
        .visible_threat_models(&user.principal)
        .await
        .map_err(Error::Auth)?;
    Ok(Json(visible.into_iter().map(|(tm, _)| tm).collect()))
}

async fn get_threat_model(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ThreatModel>, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::ThreatModel, id),
            Role::Reader,
        )
        .await
        .map_err(Error::Auth)?;
    let tm = state.store.threat_model(id).await.map_err(Error::Store)?;
    Ok(Json(tm))
}

#[derive(Deserialize)]
struct UpdateThreatModelRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    authorization: Option<Vec<Grant>>,
}

async fn update_threat_model(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateThreatModelRequest>,
) -> Result<Json<ThreatModel>, ApiError> {
    let resource = ResourceRef::new(ObjectKind::ThreatModel, id);
    let role = state
        .authz
        .require_role(&user.principal, resource, Role::Writer)
        .await
        .map_err(Error::Auth)?;

    let mut tm = state.store.threat_model(id).await.map_err(Error::Store)?;
    tm.name = req.name;
    tm.description = req.description;
    if let Some(authorization) = req.authorization {
        // Grant edits require ownership
        if role < Role::Owner {
            return Err(Error::Auth(tmi_core::error::AuthError::Forbidden(
                "changing grants requires owner".into(),
            ))
            .into());
        }
        tm.authorization = authorization;
    }

    state
        .store
        .update_threat_model(&tm, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    let tm = state.store.threat_model(id).await.map_err(Error::Store)?;
    Ok(Json(tm))
}

async fn delete_threat_model(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::ThreatModel, id),
            Role::Owner,
        )
        .await
        .map_err(Error::Auth)?;
    state
        .store
        .delete_threat_model(id, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Diagrams ──────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateDiagramRequest {
    name: String,
    #[serde(default)]
    kind: DiagramKind,
}

async fn create_diagram(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateDiagramRequest>,
) -> Result<(StatusCode, Json<Diagram>), ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::ThreatModel, id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;
    let diagram = Diagram::new(id, req.name, req.kind);
    state
        .store
        .create_diagram(&diagram, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok((StatusCode::CREATED, Json(diagram)))
}

async fn list_diagrams(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Diagram>>, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::ThreatModel, id),
            Role::Reader,
        )
        .await
        .map_err(Error::Auth)?;
    let diagrams = state.store.diagrams_for(id).await.map_err(Error::Store)?;
    Ok(Json(diagrams))
}

async fn get_diagram(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Diagram>, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Diagram, diagram_id),
            Role::Reader,
        )
        .await
        .map_err(Error::Auth)?;
    let diagram = state
        .store
        .diagram(diagram_id)
        .await
        .map_err(Error::Store)?;
    Ok(Json(diagram))
}

#[derive(Deserialize)]
struct UpdateDiagramRequest {
    name: String,
    #[serde(default)]
    kind: Option<DiagramKind>,
}

async fn update_diagram(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<UpdateDiagramRequest>,
) -> Result<Json<Diagram>, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Diagram, diagram_id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;
    let mut diagram = state
        .store
        .diagram(diagram_id)
        .await
        .map_err(Error::Store)?;
    diagram.name = req.name;
    if let Some(kind) = req.kind {
        diagram.kind = kind;
    }
    state
        .store
        .update_diagram_meta(&diagram, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok(Json(diagram))
}

async fn delete_diagram(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, diagram_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Diagram, diagram_id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;
    state
        .store
        .delete_diagram(diagram_id, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Threats ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateThreatRequest {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    severity: Severity,
    #[serde(default)]
    diagram_id: Option<Uuid>,
    #[serde(default)]
    cell_id: Option<Uuid>,
}

async fn create_threat(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<CreateThreatRequest>,
) -> Result<(StatusCode, Json<Subresource>), ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::ThreatModel, id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;
    let threat = Subresource::new(
        id,
        SubresourcePayload::Threat {
            name: req.name,
            description: req.description,
            severity: req.severity,
            mitigated: false,
            diagram_id: req.diagram_id,
            cell_id: req.cell_id,
        },
    );
    state
        .store
        .create_subresource(&threat, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok((StatusCode::CREATED, Json(threat)))
}

async fn list_threats(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Subresource>>, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::ThreatModel, id),
            Role::Reader,
        )
        .await
        .map_err(Error::Auth)?;
    let threats = state
        .store
        .subresources_for(id, Some(ObjectKind::Threat))
        .await
        .map_err(Error::Store)?;
    Ok(Json(threats))
}

async fn delete_threat(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path((_, threat_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_role(
            &user.principal,
            ResourceRef::new(ObjectKind::Threat, threat_id),
            Role::Writer,
        )
        .await
        .map_err(Error::Auth)?;
    state
        .store
        .delete_subresource(threat_id, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok(StatusCode::NO_CONTENT)
}
