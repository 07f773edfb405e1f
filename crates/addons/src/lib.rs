//! # TMI Addon Subsystem
//!
//! Admin-registered webhook extensions with user-initiated asynchronous
//! invocations, per-user concurrency and rate caps, and signed status
//! callbacks.
//!
//! - [`service`] — registry, invocation quotas, callback verification
//! - [`worker`] — dispatch worker pool and expiry/retention sweeper

pub mod service;
pub mod worker;

pub use service::{AddonService, NewAddon, StatusCallback};
pub use worker::{AddonWorker, InvocationSweeper};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;
    use axum::Router;
    use axum::extract::State;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use chrono::Utc;
    use tokio::sync::{Mutex, mpsc};
    use uuid::Uuid;

    use tmi_config::AddonConfig;
    use tmi_core::addon::InvocationStatus;
    use tmi_core::identity::Principal;
    use tmi_core::model::ObjectKind;
    use tmi_core::quota::Quota;
    use tmi_core::store::DomainStore;
    use tmi_core::webhook::{SubscriptionStatus, WebhookSubscription};
    use tmi_store::InMemoryStore;

    #[derive(Clone, Default)]
    struct Captured {
        bodies: Arc<StdMutex<Vec<(HeaderMap, String)>>>,
    }

    async fn endpoint(state: Captured) -> String {
        async fn handler(State(state): State<Captured>, headers: HeaderMap, body: String) {
            state.bodies.lock().unwrap().push((headers, body));
        }
        let app = Router::new().route("/hook", post(handler)).with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    #[tokio::test]
    async fn worker_posts_signed_invocation_with_callback_url() {
        let captured = Captured::default();
        let url = endpoint(captured.clone()).await;

        let store = Arc::new(InMemoryStore::new());
        let now = Utc::now();
        let webhook = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: None,
            url,
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
        store.create_subscription(&webhook).await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let svc = AddonService::new(
            store.clone() as Arc<dyn DomainStore>,
            None,
            Quota::default(),
            tx,
        );
        let addon = svc
            .register(NewAddon {
                name: "scanner".into(),
                webhook_id: webhook.id,
                description: String::new(),
                icon: None,
                objects: vec![ObjectKind::Diagram],
                threat_model_id: None,
            })
            .await
            .unwrap();
        let invoker = Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "github".into(),
            provider_user_id: "gh-1".into(),
            email: "a@example.test".into(),
            display_name: "A".into(),
            groups: vec![],
        };
        let inv = svc
            .invoke(
                &invoker,
                addon.id,
                ObjectKind::Diagram,
                Uuid::new_v4(),
                Uuid::new_v4(),
                r#"{"depth":2}"#.into(),
            )
            .await
            .unwrap();

        let config = AddonConfig {
            public_base_url: "https://tmi.example.test".into(),
            ..AddonConfig::default()
        };
        let worker = AddonWorker::new(
            store.clone() as Arc<dyn DomainStore>,
            None,
            config,
            Arc::new(Mutex::new(rx)),
        );
        worker.dispatch(inv.id).await;

        let bodies = captured.bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 1);
        let (headers, body) = &bodies[0];
        assert_eq!(
            headers.get("X-Invocation-Id").unwrap().to_str().unwrap(),
            inv.id.to_string()
        );
        assert_eq!(
            headers.get("X-Addon-Id").unwrap().to_str().unwrap(),
            addon.id.to_string()
        );
        let signature = headers
            .get("X-Webhook-Signature")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(tmi_security::verify_signature("whsec", body.as_bytes(), signature));

        let parsed: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed["callback_url"],
            format!("https://tmi.example.test/invocations/{}/status", inv.id)
        );
        assert_eq!(parsed["payload"], r#"{"depth":2}"#);
    }

    #[tokio::test]
    async fn sweeper_expires_stale_and_prunes_old() {
        let store = Arc::new(InMemoryStore::new());
        let user = Uuid::new_v4();
        let mut stale = tmi_core::addon::AddonInvocation::new(
            Uuid::new_v4(),
            user,
            ObjectKind::Diagram,
            Uuid::new_v4(),
            String::new(),
        );
        stale.status_updated_at = Utc::now() - chrono::Duration::hours(1);
        store.create_invocation(&stale).await.unwrap();

        let mut ancient = tmi_core::addon::AddonInvocation::new(
            Uuid::new_v4(),
            user,
            ObjectKind::Diagram,
            Uuid::new_v4(),
            String::new(),
        );
        ancient.created_at = Utc::now() - chrono::Duration::days(30);
        ancient.status = InvocationStatus::Completed;
        store.create_invocation(&ancient).await.unwrap();

        let sweeper = InvocationSweeper::new(
            store.clone() as Arc<dyn DomainStore>,
            AddonConfig::default(),
        );
        sweeper.pass().await;

        let expired = store.invocation(stale.id).await.unwrap();
        assert_eq!(expired.status, InvocationStatus::Failed);
        assert_eq!(expired.status_message, "expired");
        assert!(store.invocation(ancient.id).await.is_err());
    }
}
