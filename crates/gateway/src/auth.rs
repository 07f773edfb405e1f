//! Bearer-token authentication and principal resolution.
//!
//! The gateway consumes a *verified* identity: a [`TokenVerifier`]
//! implementation turns a bearer credential into provider identity plus
//! group set. Users are bootstrapped into the store on first successful
//! authentication; resolution is cached for 15 minutes.

use async_trait::async_trait;
use axum::extract::{FromRequestParts, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;
use tracing::{debug, warn};

use tmi_core::error::{AuthError, Error, StoreError};
use tmi_core::identity::{GroupRef, Principal, User};

use crate::{ApiError, SharedState};

/// A verified identity as asserted by the identity provider.
#[derive(Debug, Clone)]
pub struct VerifiedIdentity {
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    pub groups: Vec<GroupRef>,
}

/// Turns a bearer credential into a verified identity.
///
/// OAuth/OIDC/SAML plumbing lives behind this seam; the gateway never
/// parses identity-protocol payloads itself.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError>;
}

/// Token verifier backed by statically configured principals.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, VerifiedIdentity>,
}

impl StaticTokenVerifier {
    pub fn from_config(auth: &tmi_config::AuthConfig) -> Self {
        let mut tokens = HashMap::new();
        for p in &auth.static_principals {
            let groups = p
                .groups
                .iter()
                .filter_map(|g| {
                    g.split_once(':')
                        .map(|(provider, name)| GroupRef::new(provider, name))
                })
                .collect();
            tokens.insert(
                p.token.clone(),
                VerifiedIdentity {
                    provider: p.provider.clone(),
                    provider_user_id: p.provider_user_id.clone(),
                    email: p.email.clone(),
                    display_name: if p.display_name.is_empty() {
                        p.email.clone()
                    } else {
                        p.display_name.clone()
                    },
                    groups,
                },
            );
        }
        Self { tokens }
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedIdentity, AuthError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::InvalidToken)
    }
}

/// The authenticated caller, attached to request extensions by the
/// middleware. The bool is the admin flag.
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub principal: Principal,
    pub is_admin: bool,
}

impl<S: Send + Sync> FromRequestParts<S> for AuthedUser {
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthedUser>()
            .cloned()
            .ok_or(StatusCode::UNAUTHORIZED)
    }
}

/// Resolve a bearer credential into a principal.
///
/// Lookup order: identity cache → store by `(provider, provider_user_id)`
/// → bootstrap a new user row. Group set = provider-asserted groups plus
/// persisted system groups.
pub async fn resolve_principal(state: &SharedState, token: &str) -> Result<AuthedUser, Error> {
    let identity = state.verifier.verify(token).await.map_err(Error::Auth)?;

    if let Some(cached) = state
        .identity_cache
        .get_by_provider_id(&identity.provider, &identity.provider_user_id)
    {
        let is_admin = state
            .store
            .is_admin(cached.internal_uuid)
            .await
            .map_err(Error::Store)?;
        return Ok(AuthedUser {
            principal: cached,
            is_admin,
        });
    }

    let user = match state
        .store
        .user_by_provider_id(&identity.provider, &identity.provider_user_id)
        .await
        .map_err(Error::Store)?
    {
        Some(user) => {
            let _ = state.store.touch_last_login(user.internal_uuid).await;
            user
        }
        None => {
            // First successful authentication creates the user
            let user = User::bootstrap(
                identity.provider.clone(),
                identity.provider_user_id.clone(),
                identity.email.clone(),
                identity.display_name.clone(),
            );
            match state.store.create_user(&user).await {
                Ok(()) => {
                    debug!(user = %user.internal_uuid, "User bootstrapped on first login");
                    user
                }
                // Lost a bootstrap race: read the winner
                Err(StoreError::DuplicateIdentity { .. }) => state
                    .store
                    .user_by_provider_id(&identity.provider, &identity.provider_user_id)
                    .await
                    .map_err(Error::Store)?
                    .ok_or_else(|| Error::Internal("bootstrap race lost twice".into()))?,
                Err(e) => return Err(Error::Store(e)),
            }
        }
    };

    let mut groups = identity.groups;
    groups.extend(
        state
            .store
            .system_groups_for(user.internal_uuid)
            .await
            .map_err(Error::Store)?,
    );

    let principal = user.principal(groups);
    state.identity_cache.insert(principal.clone());

    let is_admin = state
        .store
        .is_admin(principal.internal_uuid)
        .await
        .map_err(Error::Store)?;
    Ok(AuthedUser {
        principal,
        is_admin,
    })
}

/// Extract the bearer credential from headers or the `token` query param
/// (WebSocket clients cannot always set headers).
pub fn extract_token(parts: &axum::http::Uri, headers: &axum::http::HeaderMap) -> Option<String> {
    if let Some(header) = headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(header.to_string());
    }
    parts.query().and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|t| t.to_string())
    })
}

/// Authentication middleware for all non-public routes.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut req: axum::extract::Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_token(req.uri(), req.headers())
        .ok_or(Error::Auth(AuthError::MissingCredentials))?;

    match resolve_principal(&state, &token).await {
        Ok(authed) => {
            req.extensions_mut().insert(authed);
            Ok(next.run(req).await)
        }
        Err(e) => {
            warn!(error = %e, "Authentication failed");
            Err(ApiError(e))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use tmi_addons::AddonService;
    use tmi_authz::{AuthzResolver, IdentityCache};
    use tmi_bus::InMemoryBus;
    use tmi_collab::SessionRegistry;
    use tmi_config::{AppConfig, StaticPrincipal};
    use tmi_core::quota::Quota;
    use tmi_core::store::DomainStore;
    use tmi_store::{ChangeNotifier, InMemoryStore};
    use tmi_webhooks::SubscriptionService;

    use crate::AppState;

    /// Tokens known to the test verifier: `t-owner` (admin), `t-writer`,
    /// `t-reader`.
    pub(crate) async fn test_state() -> crate::SharedState {
        let mut config = AppConfig::default();
        config.auth.static_principals = vec![
            StaticPrincipal {
                token: "t-owner".into(),
                provider: "github".into(),
                provider_user_id: "gh-owner".into(),
                email: "owner@example.test".into(),
                display_name: "Owner".into(),
                groups: vec![],
                admin: true,
            },
            StaticPrincipal {
                token: "t-writer".into(),
                provider: "github".into(),
                provider_user_id: "gh-writer".into(),
                email: "writer@example.test".into(),
                display_name: "Writer".into(),
                groups: vec![],
                admin: false,
            },
            StaticPrincipal {
                token: "t-reader".into(),
                provider: "github".into(),
                provider_user_id: "gh-reader".into(),
                email: "reader@example.test".into(),
                display_name: "Reader".into(),
                groups: vec![],
                admin: false,
            },
        ];

        let bus = Arc::new(InMemoryBus::new(1000));
        let store: Arc<dyn DomainStore> = Arc::new(
            InMemoryStore::new().with_notifier(ChangeNotifier::new(bus.clone())),
        );
        let verifier = Arc::new(StaticTokenVerifier::from_config(&config.auth));
        let authz = Arc::new(AuthzResolver::new(store.clone()));
        let sessions = Arc::new(SessionRegistry::new(config.collab.clone(), store.clone()));
        let subscriptions = Arc::new(SubscriptionService::new(
            store.clone(),
            None,
            config.webhooks.clone(),
            Quota::default(),
        ));
        let (queue_tx, mut queue_rx) = mpsc::channel(64);
        tokio::spawn(async move { while queue_rx.recv().await.is_some() {} });
        let addons = Arc::new(AddonService::new(
            store.clone(),
            None,
            Quota::default(),
            queue_tx,
        ));

        let state = Arc::new(AppState {
            config,
            store: store.clone(),
            authz,
            identity_cache: Arc::new(IdentityCache::new(Duration::from_secs(900))),
            verifier,
            sessions,
            subscriptions,
            addons,
        });

        // Pre-resolve the admin so the admin flag is persisted
        let admin = resolve_principal(&state, "t-owner").await.unwrap();
        store.grant_admin(admin.principal.internal_uuid).await.unwrap();
        state.identity_cache.invalidate(admin.principal.internal_uuid);
        state
    }

    #[tokio::test]
    async fn first_login_bootstraps_user() {
        let state = test_state().await;
        let authed = resolve_principal(&state, "t-writer").await.unwrap();
        assert_eq!(authed.principal.email, "writer@example.test");
        assert!(!authed.is_admin);

        // Second resolution hits the cache and returns the same identity
        let again = resolve_principal(&state, "t-writer").await.unwrap();
        assert_eq!(
            again.principal.internal_uuid,
            authed.principal.internal_uuid
        );
    }

    #[tokio::test]
    async fn admin_flag_reflects_store() {
        let state = test_state().await;
        let authed = resolve_principal(&state, "t-owner").await.unwrap();
        assert!(authed.is_admin);
    }

    #[tokio::test]
    async fn invalid_token_rejected() {
        let state = test_state().await;
        let err = resolve_principal(&state, "bogus").await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn token_query_param_fallback() {
        let uri: axum::http::Uri = "/ws?foo=1&token=abc".parse().unwrap();
        let headers = axum::http::HeaderMap::new();
        assert_eq!(extract_token(&uri, &headers), Some("abc".into()));

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("Authorization", "Bearer xyz".parse().unwrap());
        assert_eq!(extract_token(&uri, &headers), Some("xyz".into()));
    }
}
