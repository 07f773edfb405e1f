//! Webhook subscription REST surface plus admin deny-list and quota
//! endpoints.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tmi_core::error::Error;
use tmi_core::quota::Quota;
use tmi_core::webhook::WebhookSubscription;
use tmi_webhooks::NewSubscription;

use crate::{ApiError, AuthedUser, SharedState};

pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/webhook/subscriptions", post(create_subscription))
        .route("/webhook/subscriptions", get(list_subscriptions))
        .route("/webhook/subscriptions/{id}", get(get_subscription))
        .route("/webhook/subscriptions/{id}", delete(delete_subscription))
        .route("/admin/deny_list", get(list_deny_entries))
        .route("/admin/deny_list", post(add_deny_entry))
        .route("/admin/deny_list", delete(remove_deny_entry))
        .route("/admin/quotas/{user_id}", get(get_quota))
        .route("/admin/quotas/{user_id}", put(set_quota))
        .route("/admin/administrators/{user_id}", put(grant_admin))
        .route("/admin/administrators/{user_id}", delete(revoke_admin))
        .route("/admin/users/{user_id}", delete(delete_user))
}

#[derive(Deserialize)]
struct CreateSubscriptionRequest {
    url: String,
    events: Vec<String>,
    secret: String,
    #[serde(default)]
    threat_model_id: Option<Uuid>,
}

async fn create_subscription(
    State(state): State<SharedState>,
    user: AuthedUser,
    Json(req): Json<CreateSubscriptionRequest>,
) -> Result<(StatusCode, Json<WebhookSubscription>), ApiError> {
    let sub = state
        .subscriptions
        .create(
            &user.principal,
            NewSubscription {
                url: req.url,
                events: req.events,
                secret: req.secret,
                threat_model_id: req.threat_model_id,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(sub)))
}

async fn list_subscriptions(
    State(state): State<SharedState>,
    user: AuthedUser,
) -> Result<Json<Vec<WebhookSubscription>>, ApiError> {
    let subs = state.subscriptions.list_for_owner(&user.principal).await?;
    Ok(Json(subs))
}

async fn get_subscription(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<WebhookSubscription>, ApiError> {
    let sub = state
        .subscriptions
        .get(&user.principal, id, user.is_admin)
        .await?;
    Ok(Json(sub))
}

async fn delete_subscription(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .subscriptions
        .delete(&user.principal, id, user.is_admin)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Admin ─────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct DenyListResponse {
    patterns: Vec<String>,
}

async fn list_deny_entries(
    State(state): State<SharedState>,
    user: AuthedUser,
) -> Result<Json<DenyListResponse>, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    let patterns = state.store.deny_list_entries().await.map_err(Error::Store)?;
    Ok(Json(DenyListResponse { patterns }))
}

#[derive(Deserialize)]
struct DenyEntryRequest {
    pattern: String,
}

async fn add_deny_entry(
    State(state): State<SharedState>,
    user: AuthedUser,
    Json(req): Json<DenyEntryRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    if req.pattern.trim().is_empty() {
        return Err(Error::InvalidArgument("pattern must not be empty".into()).into());
    }
    state
        .store
        .add_deny_list_entry(&req.pattern)
        .await
        .map_err(Error::Store)?;
    Ok(StatusCode::CREATED)
}

async fn remove_deny_entry(
    State(state): State<SharedState>,
    user: AuthedUser,
    Json(req): Json<DenyEntryRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state
        .store
        .remove_deny_list_entry(&req.pattern)
        .await
        .map_err(Error::Store)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_quota(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Quota>, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    let quota = state
        .store
        .quota_override(user_id)
        .await
        .map_err(Error::Store)?
        .unwrap_or(state.config.quotas);
    Ok(Json(quota))
}

async fn set_quota(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(user_id): Path<Uuid>,
    Json(quota): Json<Quota>,
) -> Result<Json<Quota>, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state
        .store
        .set_quota_override(user_id, &quota)
        .await
        .map_err(Error::Store)?;
    Ok(Json(quota))
}

async fn grant_admin(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(user_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state.store.grant_admin(user_id).await.map_err(Error::Store)?;
    // Demotion/promotion must not wait for the identity cache TTL
    state.identity_cache.invalidate(user_id);
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_admin(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(user_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state.store.revoke_admin(user_id).await.map_err(Error::Store)?;
    state.identity_cache.invalidate(user_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Hard-delete a user: owned threat models transfer to their next owner
/// grant or cascade away, then the row is removed.
async fn delete_user(
    State(state): State<SharedState>,
    user: AuthedUser,
    Path(user_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .authz
        .require_admin(&user.principal)
        .await
        .map_err(Error::Auth)?;
    state
        .store
        .delete_user(user_id, user.principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    state.identity_cache.invalidate(user_id);
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::auth::tests::test_state;
    use crate::build_router;

    fn post_json(uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Authorization", format!("Bearer {token}"))
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn create_subscription_returns_pending_without_secret() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .oneshot(post_json(
                "/webhook/subscriptions",
                "t-writer",
                serde_json::json!({
                    "url": "https://example.test/hook",
                    "events": ["threat_model.updated"],
                    "secret": "s"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let sub: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(sub["status"], "pending_verification");
        assert!(sub.get("secret").is_none());
        assert!(sub.get("challenge").is_none());
    }

    #[tokio::test]
    async fn denied_url_returns_bad_request() {
        let state = test_state().await;
        let app = build_router(state);
        let response = app
            .oneshot(post_json(
                "/webhook/subscriptions",
                "t-writer",
                serde_json::json!({
                    "url": "http://127.0.0.1/hook",
                    "events": ["threat_model.updated"],
                    "secret": "s"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn admin_endpoints_require_admin() {
        let state = test_state().await;
        let app = build_router(state);

        let req = |token: &str| {
            Request::builder()
                .uri("/admin/deny_list")
                .header("Authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };
        let response = app.clone().oneshot(req("t-writer")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = app.clone().oneshot(req("t-owner")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn operator_deny_entry_blocks_future_subscriptions() {
        let state = test_state().await;
        let app = build_router(state);

        let response = app
            .clone()
            .oneshot(post_json(
                "/admin/deny_list",
                "t-owner",
                serde_json::json!({"pattern": "https://blocked.example/*"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(post_json(
                "/webhook/subscriptions",
                "t-writer",
                serde_json::json!({
                    "url": "https://blocked.example/hook",
                    "events": ["threat_model.updated"],
                    "secret": "s"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn quota_override_round_trip() {
        let state = test_state().await;
        let app = build_router(state);
        let target = Uuid::new_v4();

        let put_req = Request::builder()
            .method("PUT")
            .uri(format!("/admin/quotas/{target}"))
            .header("Authorization", "Bearer t-owner")
            .header("Content-Type", "application/json")
            .body(Body::from(
                serde_json::json!({
                    "max_active_invocations": 5,
                    "invocations_per_hour": 100,
                    "max_subscriptions": 2,
                    "events_per_minute": 10,
                    "sub_requests_per_minute": 5,
                    "sub_requests_per_day": 50
                })
                .to_string(),
            ))
            .unwrap();
        let response = app.clone().oneshot(put_req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let get_req = Request::builder()
            .uri(format!("/admin/quotas/{target}"))
            .header("Authorization", "Bearer t-owner")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(get_req).await.unwrap();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let quota: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(quota["max_active_invocations"], 5);
    }
}
