//! HTTP API gateway for TMI.
//!
//! Authenticates bearer tokens into principals, authorizes via the
//! resolver, validates payloads, and dispatches to the domain store,
//! collaboration engine, webhook subsystem, and addon subsystem.
//!
//! Built on Axum for high performance async HTTP.

pub mod addon_api;
pub mod auth;
pub mod collab_api;
pub mod threat_model_api;
pub mod webhook_api;

use axum::extract::DefaultBodyLimit;
use axum::{
    Json, Router,
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use tmi_addons::AddonService;
use tmi_authz::{AuthzResolver, IdentityCache};
use tmi_collab::SessionRegistry;
use tmi_config::AppConfig;
use tmi_core::error::{Error, ErrorKind};
use tmi_core::quota::RateWindow;
use tmi_core::store::DomainStore;
use tmi_webhooks::SubscriptionService;

pub use auth::{AuthedUser, StaticTokenVerifier, TokenVerifier};

/// Shared application state for the gateway.
pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn DomainStore>,
    pub authz: Arc<AuthzResolver>,
    pub identity_cache: Arc<IdentityCache>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub sessions: Arc<SessionRegistry>,
    pub subscriptions: Arc<SubscriptionService>,
    pub addons: Arc<AddonService>,
}

pub type SharedState = Arc<AppState>;

/// Wire-level error envelope.
#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<u64>,
}

/// Error wrapper translating [`ErrorKind`] tags to HTTP statuses.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = match kind {
            ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
            ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if kind == ErrorKind::Internal {
            tracing::error!(error = %self.0, "Internal error surfaced to caller");
        }
        let retry_after_secs = match &self.0 {
            Error::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        let message = match kind {
            // Opaque message for internals; detail stays in the logs
            ErrorKind::Internal => "internal error".to_string(),
            _ => self.0.to_string(),
        };
        (
            status,
            Json(ErrorBody {
                error: kind.as_str(),
                message,
                retry_after_secs,
            }),
        )
            .into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full application router.
///
/// Security layers applied:
/// - Bearer token authentication on every route except `/health` and the
///   HMAC-signed invocation status callback
/// - Request body size limit
/// - In-memory sliding-window rate limiting per client
/// - HTTP trace logging
pub fn build_router(state: SharedState) -> Router {
    let authed = Router::new()
        .merge(threat_model_api::router())
        .merge(collab_api::router())
        .merge(webhook_api::router())
        .merge(addon_api::router())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // The status callback authenticates by HMAC signature, not bearer
    // token: addon services hold the webhook secret, not a session.
    let public = Router::new()
        .route("/health", get(health_handler))
        .route(
            "/invocations/{id}/status",
            axum::routing::post(addon_api::status_callback_handler),
        );

    let rest_rate = Arc::new(RateWindow::new(std::time::Duration::from_secs(60)));
    let rest_cap = state.config.server.rest_requests_per_minute;

    Router::new()
        .merge(public)
        .merge(authed)
        .with_state(state.clone())
        .layer(DefaultBodyLimit::max(state.config.server.body_limit_bytes))
        .layer(middleware::from_fn(move |req, next| {
            let window = rest_rate.clone();
            rate_limit_middleware(window, rest_cap, req, next)
        }))
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Rate limiting middleware keyed by bearer token (or "anonymous").
/// `/health` is exempt so monitoring can poll it freely.
async fn rate_limit_middleware(
    window: Arc<RateWindow>,
    cap: u32,
    req: axum::extract::Request,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }
    let client_key = req
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "anonymous".to_string());

    if !window.try_acquire(&client_key, cap) {
        tracing::warn!("Rate limit exceeded on REST surface");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }
    Ok(next.run(req).await)
}

/// Bind and serve until the shutdown signal fires.
pub async fn serve(
    state: SharedState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let addr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    );
    let sessions = state.sessions.clone();
    let app = build_router(state);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    // Sessions persist and close before the process exits
    sessions.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    pub(crate) use crate::auth::tests::test_state;

    #[tokio::test]
    async fn health_endpoint_is_public() {
        let state = test_state().await;
        let app = build_router(state);
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn authed_routes_reject_missing_token() {
        let state = test_state().await;
        let app = build_router(state);
        let req = Request::builder()
            .uri("/threat_models")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_token_is_unauthorized() {
        let state = test_state().await;
        let app = build_router(state);
        let req = Request::builder()
            .uri("/threat_models")
            .header("Authorization", "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
