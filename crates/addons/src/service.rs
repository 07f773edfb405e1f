//! Addon registry and invocation service.
//!
//! Admins register addons against active webhook subscriptions; any user
//! with reader-or-better on a target's threat model may invoke an
//! applicable addon within their quota. Status callbacks are authenticated
//! by the webhook's HMAC secret.

use std::sync::Arc;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use tmi_core::addon::{
    AddonInvocation, AddonRegistration, InvocationStatus, MAX_INVOCATION_PAYLOAD,
};
use tmi_core::error::{AddonError, Error, WebhookError};
use tmi_core::identity::Principal;
use tmi_core::model::ObjectKind;
use tmi_core::quota::Quota;
use tmi_core::store::DomainStore;
use tmi_core::webhook::SubscriptionStatus;
use tmi_security::SecretsManager;

/// Admin-supplied addon parameters.
#[derive(Debug, Clone)]
pub struct NewAddon {
    pub name: String,
    pub webhook_id: Uuid,
    pub description: String,
    pub icon: Option<String>,
    pub objects: Vec<ObjectKind>,
    pub threat_model_id: Option<Uuid>,
}

/// Parsed status-callback body.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusCallback {
    pub status: InvocationStatus,
    #[serde(default)]
    pub status_percent: Option<u8>,
    #[serde(default)]
    pub status_message: Option<String>,
}

/// Addon registry + invocation lifecycle.
pub struct AddonService {
    store: Arc<dyn DomainStore>,
    secrets: Option<Arc<SecretsManager>>,
    default_quota: Quota,
    queue: mpsc::Sender<Uuid>,
}

impl AddonService {
    pub fn new(
        store: Arc<dyn DomainStore>,
        secrets: Option<Arc<SecretsManager>>,
        default_quota: Quota,
        queue: mpsc::Sender<Uuid>,
    ) -> Self {
        Self {
            store,
            secrets,
            default_quota,
            queue,
        }
    }

    // --- Registry (admin-gated by the caller) ---

    /// Register an addon. The referenced webhook must be active.
    pub async fn register(&self, req: NewAddon) -> Result<AddonRegistration, Error> {
        if req.objects.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one target object kind is required".into(),
            ));
        }
        let webhook = self
            .store
            .subscription(req.webhook_id)
            .await
            .map_err(Error::Store)?;
        if webhook.status != SubscriptionStatus::Active {
            return Err(Error::Addon(AddonError::WebhookInactive));
        }

        let addon = AddonRegistration {
            id: Uuid::new_v4(),
            name: req.name,
            webhook_id: req.webhook_id,
            description: req.description,
            icon: req.icon,
            objects: req.objects,
            threat_model_id: req.threat_model_id,
            created_at: Utc::now(),
        };
        self.store.create_addon(&addon).await.map_err(Error::Store)?;
        info!(addon_id = %addon.id, name = %addon.name, "Addon registered");
        Ok(addon)
    }

    pub async fn get(&self, id: Uuid) -> Result<AddonRegistration, Error> {
        self.store.addon(id).await.map_err(Error::Store)
    }

    pub async fn list(&self) -> Result<Vec<AddonRegistration>, Error> {
        self.store.list_addons().await.map_err(Error::Store)
    }

    /// Delete an addon. Refused while any invocation is non-terminal.
    pub async fn delete(&self, id: Uuid) -> Result<(), Error> {
        let open = self
            .store
            .non_terminal_invocations_for_addon(id)
            .await
            .map_err(Error::Store)?;
        if open > 0 {
            return Err(Error::Addon(AddonError::NonTerminalInvocations(open)));
        }
        self.store.delete_addon(id).await.map_err(Error::Store)?;
        info!(addon_id = %id, "Addon deleted");
        Ok(())
    }

    // --- Invocations ---

    /// Invoke an addon on a target object. The caller has already passed
    /// the reader-or-better check on `target_threat_model`.
    pub async fn invoke(
        &self,
        invoker: &Principal,
        addon_id: Uuid,
        target_kind: ObjectKind,
        target_id: Uuid,
        target_threat_model: Uuid,
        payload: String,
    ) -> Result<AddonInvocation, Error> {
        let addon = self.store.addon(addon_id).await.map_err(Error::Store)?;
        if !addon.applies_to(target_kind, target_threat_model) {
            return Err(Error::InvalidArgument(format!(
                "addon does not apply to {target_kind}"
            )));
        }
        if payload.len() > MAX_INVOCATION_PAYLOAD {
            return Err(Error::Addon(AddonError::PayloadTooLarge {
                max: MAX_INVOCATION_PAYLOAD,
                got: payload.len(),
            }));
        }

        // Per-user caps: concurrent and sliding-hour
        let quota = self
            .store
            .quota_override(invoker.internal_uuid)
            .await
            .map_err(Error::Store)?
            .unwrap_or(self.default_quota);
        let active = self
            .store
            .active_invocation_count(invoker.internal_uuid)
            .await
            .map_err(Error::Store)?;
        if active >= quota.max_active_invocations as usize {
            return Err(Error::RateLimited {
                retry_after_secs: 60,
            });
        }
        let hourly = self
            .store
            .invocations_since(invoker.internal_uuid, Utc::now() - chrono::Duration::hours(1))
            .await
            .map_err(Error::Store)?;
        if hourly >= quota.invocations_per_hour as usize {
            return Err(Error::RateLimited {
                retry_after_secs: 3600,
            });
        }

        let invocation = AddonInvocation::new(
            addon_id,
            invoker.internal_uuid,
            target_kind,
            target_id,
            payload,
        );
        self.store
            .create_invocation(&invocation)
            .await
            .map_err(Error::Store)?;

        self.queue.try_send(invocation.id).map_err(|_| {
            Error::Internal("addon worker queue is full".into())
        })?;
        info!(invocation_id = %invocation.id, addon_id = %addon_id, "Invocation queued");
        Ok(invocation)
    }

    pub async fn invocation(&self, id: Uuid) -> Result<AddonInvocation, Error> {
        self.store.invocation(id).await.map_err(Error::Store)
    }

    pub async fn invocations_for(&self, user: &Principal) -> Result<Vec<AddonInvocation>, Error> {
        self.store
            .invocations_for_user(user.internal_uuid)
            .await
            .map_err(Error::Store)
    }

    /// Apply a signed status callback.
    ///
    /// `body` is the exact bytes received; the signature is verified with
    /// the addon's webhook secret before anything is parsed.
    pub async fn apply_status_callback(
        &self,
        invocation_id: Uuid,
        body: &[u8],
        signature: &str,
    ) -> Result<AddonInvocation, Error> {
        let invocation = self
            .store
            .invocation(invocation_id)
            .await
            .map_err(Error::Store)?;
        let addon = self
            .store
            .addon(invocation.addon_id)
            .await
            .map_err(Error::Store)?;
        let webhook = self
            .store
            .subscription(addon.webhook_id)
            .await
            .map_err(|_| Error::Webhook(WebhookError::NotFound(addon.webhook_id.to_string())))?;

        let secret = match &self.secrets {
            Some(secrets) if SecretsManager::is_envelope(&webhook.secret) => secrets
                .decrypt(&webhook.secret)
                .map_err(|e| Error::Internal(format!("secret decryption failed: {e}")))?,
            _ => webhook.secret.clone(),
        };
        if !tmi_security::verify_signature(&secret, body, signature) {
            return Err(Error::Addon(AddonError::InvalidSignature));
        }

        if invocation.status.is_terminal() {
            return Err(Error::Addon(AddonError::AlreadyTerminal(
                invocation_id.to_string(),
            )));
        }

        let callback: StatusCallback =
            serde_json::from_slice(body).map_err(Error::Serialization)?;
        let percent = callback
            .status_percent
            .unwrap_or(if callback.status.is_terminal() { 100 } else { 0 });
        let message = callback.status_message.unwrap_or_default();

        self.store
            .update_invocation_status(invocation_id, callback.status, percent, &message)
            .await
            .map_err(Error::Store)?;
        info!(
            invocation_id = %invocation_id,
            status = callback.status.as_str(),
            "Invocation status updated"
        );
        self.store.invocation(invocation_id).await.map_err(Error::Store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_core::webhook::WebhookSubscription;
    use tmi_security::signature_header;
    use tmi_store::InMemoryStore;

    fn principal() -> Principal {
        Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "github".into(),
            provider_user_id: "gh-1".into(),
            email: "a@example.test".into(),
            display_name: "A".into(),
            groups: vec![],
        }
    }

    async fn webhook(store: &InMemoryStore, status: SubscriptionStatus) -> Uuid {
        let now = Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: None,
            url: "https://example.test/hook".into(),
            secret: "whsec".into(),
            events: vec![],
            status,
            challenge: String::new(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        };
        store.create_subscription(&sub).await.unwrap();
        sub.id
    }

    fn service(store: Arc<InMemoryStore>) -> (AddonService, mpsc::Receiver<Uuid>) {
        let (tx, rx) = mpsc::channel(16);
        (
            AddonService::new(store, None, Quota::default(), tx),
            rx,
        )
    }

    fn new_addon(webhook_id: Uuid) -> NewAddon {
        NewAddon {
            name: "scanner".into(),
            webhook_id,
            description: "scans diagrams".into(),
            icon: None,
            objects: vec![ObjectKind::Diagram],
            threat_model_id: None,
        }
    }

    #[tokio::test]
    async fn register_requires_active_webhook() {
        let store = Arc::new(InMemoryStore::new());
        let pending = webhook(&store, SubscriptionStatus::PendingVerification).await;
        let active = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, _rx) = service(store);

        assert!(matches!(
            svc.register(new_addon(pending)).await.unwrap_err(),
            Error::Addon(AddonError::WebhookInactive)
        ));
        assert!(svc.register(new_addon(active)).await.is_ok());
    }

    #[tokio::test]
    async fn invoke_enqueues_and_enforces_concurrent_cap() {
        let store = Arc::new(InMemoryStore::new());
        let wh = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, mut rx) = service(store.clone());
        let addon = svc.register(new_addon(wh)).await.unwrap();
        let user = principal();
        let tm = Uuid::new_v4();

        // Default quota: 1 active
        let inv = svc
            .invoke(&user, addon.id, ObjectKind::Diagram, Uuid::new_v4(), tm, "{}".into())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), inv.id);

        let err = svc
            .invoke(&user, addon.id, ObjectKind::Diagram, Uuid::new_v4(), tm, "{}".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));

        // Completing the first frees the slot
        store
            .update_invocation_status(inv.id, InvocationStatus::Completed, 100, "done")
            .await
            .unwrap();
        assert!(
            svc.invoke(&user, addon.id, ObjectKind::Diagram, Uuid::new_v4(), tm, "{}".into())
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn hourly_cap_enforced() {
        let store = Arc::new(InMemoryStore::new());
        let wh = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, _rx) = service(store.clone());
        let addon = svc.register(new_addon(wh)).await.unwrap();
        let user = principal();
        store
            .set_quota_override(
                user.internal_uuid,
                &Quota {
                    max_active_invocations: 100,
                    invocations_per_hour: 2,
                    ..Quota::default()
                },
            )
            .await
            .unwrap();
        let tm = Uuid::new_v4();

        for _ in 0..2 {
            svc.invoke(&user, addon.id, ObjectKind::Diagram, Uuid::new_v4(), tm, String::new())
                .await
                .unwrap();
        }
        let err = svc
            .invoke(&user, addon.id, ObjectKind::Diagram, Uuid::new_v4(), tm, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { retry_after_secs: 3600 }));
    }

    #[tokio::test]
    async fn oversized_payload_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let wh = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, _rx) = service(store);
        let addon = svc.register(new_addon(wh)).await.unwrap();

        let err = svc
            .invoke(
                &principal(),
                addon.id,
                ObjectKind::Diagram,
                Uuid::new_v4(),
                Uuid::new_v4(),
                "x".repeat(MAX_INVOCATION_PAYLOAD + 1),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Addon(AddonError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn delete_refused_while_invocations_open() {
        let store = Arc::new(InMemoryStore::new());
        let wh = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, _rx) = service(store.clone());
        let addon = svc.register(new_addon(wh)).await.unwrap();
        let user = principal();
        let inv = svc
            .invoke(&user, addon.id, ObjectKind::Diagram, Uuid::new_v4(), Uuid::new_v4(), "{}".into())
            .await
            .unwrap();

        assert!(matches!(
            svc.delete(addon.id).await.unwrap_err(),
            Error::Addon(AddonError::NonTerminalInvocations(1))
        ));

        store
            .update_invocation_status(inv.id, InvocationStatus::Failed, 100, "gave up")
            .await
            .unwrap();
        assert!(svc.delete(addon.id).await.is_ok());
    }

    #[tokio::test]
    async fn status_callback_requires_valid_signature() {
        let store = Arc::new(InMemoryStore::new());
        let wh = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, _rx) = service(store.clone());
        let addon = svc.register(new_addon(wh)).await.unwrap();
        let inv = svc
            .invoke(
                &principal(),
                addon.id,
                ObjectKind::Diagram,
                Uuid::new_v4(),
                Uuid::new_v4(),
                "{}".into(),
            )
            .await
            .unwrap();

        let body = br#"{"status":"in_progress","status_percent":40,"status_message":"scanning"}"#;
        let bad = svc
            .apply_status_callback(inv.id, body, "sha256=deadbeef")
            .await
            .unwrap_err();
        assert!(matches!(bad, Error::Addon(AddonError::InvalidSignature)));

        let good = svc
            .apply_status_callback(inv.id, body, &signature_header("whsec", body))
            .await
            .unwrap();
        assert_eq!(good.status, InvocationStatus::InProgress);
        assert_eq!(good.status_percent, 40);
        assert_eq!(good.status_message, "scanning");
    }

    #[tokio::test]
    async fn terminal_callback_is_final() {
        let store = Arc::new(InMemoryStore::new());
        let wh = webhook(&store, SubscriptionStatus::Active).await;
        let (svc, _rx) = service(store.clone());
        let addon = svc.register(new_addon(wh)).await.unwrap();
        let inv = svc
            .invoke(
                &principal(),
                addon.id,
                ObjectKind::Diagram,
                Uuid::new_v4(),
                Uuid::new_v4(),
                "{}".into(),
            )
            .await
            .unwrap();

        let done = br#"{"status":"completed"}"#;
        let updated = svc
            .apply_status_callback(inv.id, done, &signature_header("whsec", done))
            .await
            .unwrap();
        assert_eq!(updated.status, InvocationStatus::Completed);
        assert_eq!(updated.status_percent, 100);

        let again = br#"{"status":"in_progress"}"#;
        let err = svc
            .apply_status_callback(inv.id, again, &signature_header("whsec", again))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Addon(AddonError::AlreadyTerminal(_))));
    }
}
