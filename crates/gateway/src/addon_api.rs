//! Addon registry, invocation, and status-callback surface.
//!
//! The status callback route is public (no bearer token): the caller is an
//! external addon service that authenticates by signing the body with the
//! webhook secret.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
};
use serde::Deserialize;
use uuid::Uuid;

use tmi_core::addon::{AddonInvocation, AddonRegistration};
use tmi_core::error::{AddonError, Error};
use tmi_core::identity::Role;
use tmi_core::model::{ObjectKind, ResourceRef};
use tmi_addons::NewAddon;
use tmi_security::signature::SIGNATURE_HEADER;

use crate::{ApiError, AuthedUser, SharedState};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/addons", post(create_addon))
        .route("/addons", get(list_addons))
        .route("/addons/{id}", get(get_addon))
        .route("/addons/{id}", delete(delete_addon))
        .route("/addons/{id}/invoke", post(invoke_addon))
        .route("/invocations", get(list_invocations))
        .route("/invocations/{id}", get(get_invocation))
}

#[derive(Deserialize)]
struct CreateAddonRequest {
    name: String,
    webhook_id: Uuid,
    #[serde(default)]
    description: String,
    #[serde(default)]
    icon: Option<String>,
    objects: Vec<ObjectKind>,
    #[serde(default)]
    threat_model_id: Option<Uuid>,
}

async fn create_addon(
    State(state): State<SharedState>,
    user: AuthedUser,
    Json(req): Json<CreateAddonRequest>,
) -> Result<(StatusCode, Json<AddonRegistration>), ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    let addon = state
        .addons
        .register(NewAddon {
            name: req.name,
            webhook_id: req.webhook_id,
            description: req.description,
            icon: req.icon,
            objects: req.objects,
            threat_model_id: req.threat_model_id,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(addon)))
}

async fn list_addons(
    State(state): State<SharedState>,
    _user: AuthedUser,
) -> Result<Json<Vec<AddonRegistration>>, ApiError> {
    Ok(Json(state.addons.list().await?))
}

async fn get_addon(
    State(state): State<SharedState>,
    _user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<AddonRegistration>, ApiError> {
    Ok(Json(state.addons.get(id).await?))
}

async fn delete_addon(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state.addons.delete(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct InvokeRequest {
    target_object_kind: ObjectKind,
    target_object_id: Uuid,
    #[serde(default)]
    payload: String,
}

async fn invoke_addon(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
    Json(req): Json<InvokeRequest>,
) -> Result<(StatusCode, Json<AddonInvocation>), ApiError> {
    // Reader-or-better on the target's containing threat model
    let resource = ResourceRef::new(req.target_object_kind, req.target_object_id);
    state
        .authz
        .require_role(&user.principal, resource, Role::Reader)
        .await
        .map_err(Error::Auth)?;

    let threat_model_id = match req.target_object_kind {
        ObjectKind::ThreatModel => req.target_object_id,
        ObjectKind::Diagram => {
            state
                .store
                .diagram(req.target_object_id)
                .await
                .map_err(Error::Store)?
                .threat_model_id
        }
        _ => {
            state
                .store
                .subresource(req.target_object_id)
                .await
                .map_err(Error::Store)?
                .threat_model_id
        }
    };

    let invocation = state
        .addons
        .invoke(
            &user.principal,
            id,
            req.target_object_kind,
            req.target_object_id,
            threat_model_id,
            req.payload,
        )
        .await?;
    Ok((StatusCode::ACCEPTED, Json(invocation)))
}

async fn list_invocations(
    State(state): State<SharedState>,
    user: AuthedUser,
) -> Result<Json<Vec<AddonInvocation>>, ApiError> {
    Ok(Json(state.addons.invocations_for(&user.principal).await?))
}

async fn get_invocation(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<AddonInvocation>, ApiError> {
    let invocation = state.addons.invocation(id).await?;
    if invocation.invoker_user_uuid != user.principal.internal_uuid && !user.is_admin {
        return Err(Error::Addon(AddonError::InvocationNotFound(id.to_string())).into());
    }
    Ok(Json(invocation))
}

/// `POST /invocations/{id}/status` — signed progress callback. Public
/// route; the HMAC signature over the exact body bytes is the credential.
pub async fn status_callback_handler(
    State(state): State<SharedState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<AddonInvocation>, ApiError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Addon(AddonError::InvalidSignature))?;
    let invocation = state
        .addons
        .apply_status_callback(id, &body, signature)
        .await?;
    Ok(Json(invocation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use tmi_core::webhook::{SubscriptionStatus, WebhookSubscription};
    use tmi_security::signature_header;

    use crate::auth::tests::test_state;
    use crate::build_router;

    async fn seed_active_webhook(state: &crate::SharedState) -> Uuid {
        let now = chrono::Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: None,
            url: "https://example.test/hook".into(),
            secret: "whsec".into(),
            events: vec![],
            status: SubscriptionStatus::Active,
            challenge: String::new(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        };
        state.store.create_subscription(&sub).await.unwrap();
        sub.id
    }

    fn post_json(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_of(response: axum::response::Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn setup_addon_and_tm(
        app: &Router,
        state: &crate::SharedState,
    ) -> (String, String) {
        let webhook_id = seed_active_webhook(state).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/addons",
                "t-owner",
                serde_json::json!({
                    "name": "scanner",
                    "webhook_id": webhook_id,
                    "objects": ["threat_model"]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let addon = json_of(response).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/threat_models",
                "t-owner",
                serde_json::json!({
                    "name": "TM",
                    "authorization": [
                        {"subject": "reader@example.test", "role": "reader"}
                    ]
                }),
            ))
            .await
            .unwrap();
        let tm = json_of(response).await;
        (
            addon["id"].as_str().unwrap().to_string(),
            tm["id"].as_str().unwrap().to_string(),
        )
    }

    #[tokio::test]
    async fn addon_registration_is_admin_only() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let webhook_id = seed_active_webhook(&state).await;

        let body = serde_json::json!({
            "name": "scanner",
            "webhook_id": webhook_id,
            "objects": ["diagram"]
        });
        let response = app
            .clone()
            .oneshot(post_json("/addons", "t-writer", body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(post_json("/addons", "t-owner", body))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn reader_may_invoke_on_readable_target() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let (addon_id, tm_id) = setup_addon_and_tm(&app, &state).await;

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/addons/{addon_id}/invoke"),
                "t-reader",
                serde_json::json!({
                    "target_object_kind": "threat_model",
                    "target_object_id": tm_id,
                    "payload": "{}"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let invocation = json_of(response).await;
        assert_eq!(invocation["status"], "pending");

        // Unrelated user has no role on the threat model
        let response = app
            .oneshot(post_json(
                &format!("/addons/{addon_id}/invoke"),
                "t-writer",
                serde_json::json!({
                    "target_object_kind": "threat_model",
                    "target_object_id": tm_id,
                    "payload": "{}"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn second_concurrent_invocation_is_rate_limited() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let (addon_id, tm_id) = setup_addon_and_tm(&app, &state).await;

        let invoke = post_json(
            &format!("/addons/{addon_id}/invoke"),
            "t-reader",
            serde_json::json!({
                "target_object_kind": "threat_model",
                "target_object_id": tm_id
            }),
        );
        let response = app.clone().oneshot(invoke).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let invocation = json_of(response).await;
        let invocation_id = invocation["id"].as_str().unwrap().to_string();

        // Default quota allows one active invocation
        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/addons/{addon_id}/invoke"),
                "t-reader",
                serde_json::json!({
                    "target_object_kind": "threat_model",
                    "target_object_id": tm_id
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Signed completion callback frees the slot
        let body = serde_json::json!({"status": "completed"}).to_string();
        let callback = Request::builder()
            .method("POST")
            .uri(format!("/invocations/{invocation_id}/status"))
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, signature_header("whsec", body.as_bytes()))
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(callback).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(post_json(
                &format!("/addons/{addon_id}/invoke"),
                "t-reader",
                serde_json::json!({
                    "target_object_kind": "threat_model",
                    "target_object_id": tm_id
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn status_callback_rejects_bad_signature() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let (addon_id, tm_id) = setup_addon_and_tm(&app, &state).await;

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/addons/{addon_id}/invoke"),
                "t-reader",
                serde_json::json!({
                    "target_object_kind": "threat_model",
                    "target_object_id": tm_id
                }),
            ))
            .await
            .unwrap();
        let invocation = json_of(response).await;
        let invocation_id = invocation["id"].as_str().unwrap();

        let body = serde_json::json!({"status": "completed"}).to_string();
        let callback = Request::builder()
            .method("POST")
            .uri(format!("/invocations/{invocation_id}/status"))
            .header("Content-Type", "application/json")
            .header(SIGNATURE_HEADER, "sha256=0000")
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(callback).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn addon_with_open_invocation_cannot_be_deleted() {
        let state = test_state().await;
        let app = build_router(state.clone());
        let (addon_id, tm_id) = setup_addon_and_tm(&app, &state).await;

        app.clone()
            .oneshot(post_json(
                &format!("/addons/{addon_id}/invoke"),
                "t-reader",
                serde_json::json!({
                    "target_object_kind": "threat_model",
                    "target_object_id": tm_id
                }),
            ))
            .await
            .unwrap();

        let delete_req = Request::builder()
            .method("DELETE")
            .uri(format!("/addons/{addon_id}"))
            .header("Authorization", "Bearer t-owner")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(delete_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
