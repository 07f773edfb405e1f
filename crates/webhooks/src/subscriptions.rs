//! Subscription lifecycle: creation, vetting, listing, deletion.
//!
//! New subscriptions start in `pending_verification`; the challenge worker
//! promotes them to `active` once the endpoint proves control of the URL.
//! Management calls are rate-limited per owner.

use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use tmi_config::WebhookConfig;
use tmi_core::error::{Error, WebhookError};
use tmi_core::identity::Principal;
use tmi_core::quota::{Quota, RateWindow};
use tmi_core::store::DomainStore;
use tmi_core::webhook::{SubscriptionStatus, WebhookSubscription};
use tmi_security::SecretsManager;

use crate::denylist;

/// Caller-supplied subscription parameters.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub url: String,
    pub events: Vec<String>,
    pub secret: String,
    pub threat_model_id: Option<Uuid>,
}

/// Webhook subscription management.
pub struct SubscriptionService {
    store: Arc<dyn DomainStore>,
    secrets: Option<Arc<SecretsManager>>,
    config: WebhookConfig,
    default_quota: Quota,
    mgmt_minute: RateWindow,
    mgmt_day: RateWindow,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn DomainStore>,
        secrets: Option<Arc<SecretsManager>>,
        config: WebhookConfig,
        default_quota: Quota,
    ) -> Self {
        Self {
            store,
            secrets,
            config,
            default_quota,
            mgmt_minute: RateWindow::new(Duration::from_secs(60)),
            mgmt_day: RateWindow::new(Duration::from_secs(24 * 3600)),
        }
    }

    /// Effective quota for a user: stored override or process default.
    pub async fn quota_for(&self, user: Uuid) -> Result<Quota, Error> {
        Ok(self
            .store
            .quota_override(user)
            .await
            .map_err(Error::Store)?
            .unwrap_or(self.default_quota))
    }

    /// Create a subscription in `pending_verification`.
    pub async fn create(
        &self,
        owner: &Principal,
        req: NewSubscription,
    ) -> Result<WebhookSubscription, Error> {
        let quota = self.quota_for(owner.internal_uuid).await?;
        self.check_mgmt_rate(owner.internal_uuid, &quota)?;

        if req.secret.is_empty() {
            return Err(Error::InvalidArgument("secret must not be empty".into()));
        }
        if req.events.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one event kind is required".into(),
            ));
        }

        self.check_deny_list(&req.url).await?;

        let current = self
            .store
            .count_subscriptions(owner.internal_uuid)
            .await
            .map_err(Error::Store)?;
        if current >= quota.max_subscriptions as usize {
            return Err(Error::Webhook(WebhookError::QuotaExceeded {
                current,
                max: quota.max_subscriptions as usize,
            }));
        }

        let id = Uuid::new_v4();
        let secret = match &self.secrets {
            Some(secrets) => secrets
                .encrypt(&id.to_string(), &req.secret)
                .map_err(|e| Error::Internal(format!("secret encryption failed: {e}")))?,
            None => req.secret,
        };

        let now = Utc::now();
        let subscription = WebhookSubscription {
            id,
            owner_user_uuid: owner.internal_uuid,
            threat_model_id: req.threat_model_id,
            url: req.url,
            secret,
            events: req.events,
            status: SubscriptionStatus::PendingVerification,
            challenge: generate_challenge(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        };
        self.store
            .create_subscription(&subscription)
            .await
            .map_err(Error::Store)?;
        info!(subscription_id = %subscription.id, owner = %owner.internal_uuid, "Subscription created");
        Ok(subscription)
    }

    /// Fetch a subscription the caller owns (admins may fetch any).
    pub async fn get(
        &self,
        caller: &Principal,
        id: Uuid,
        caller_is_admin: bool,
    ) -> Result<WebhookSubscription, Error> {
        let sub = self.store.subscription(id).await.map_err(Error::Store)?;
        if sub.owner_user_uuid != caller.internal_uuid && !caller_is_admin {
            return Err(Error::Webhook(WebhookError::NotFound(id.to_string())));
        }
        Ok(sub)
    }

    pub async fn list_for_owner(
        &self,
        owner: &Principal,
    ) -> Result<Vec<WebhookSubscription>, Error> {
        self.store
            .subscriptions_for_owner(owner.internal_uuid)
            .await
            .map_err(Error::Store)
    }

    /// Delete a subscription the caller owns (admins may delete any).
    pub async fn delete(
        &self,
        caller: &Principal,
        id: Uuid,
        caller_is_admin: bool,
    ) -> Result<(), Error> {
        let quota = self.quota_for(caller.internal_uuid).await?;
        self.check_mgmt_rate(caller.internal_uuid, &quota)?;
        let sub = self.store.subscription(id).await.map_err(Error::Store)?;
        if sub.owner_user_uuid != caller.internal_uuid && !caller_is_admin {
            return Err(Error::Webhook(WebhookError::NotFound(id.to_string())));
        }
        self.store
            .delete_subscription(id)
            .await
            .map_err(Error::Store)?;
        info!(subscription_id = %id, "Subscription deleted");
        Ok(())
    }

    /// Plaintext HMAC key for a stored subscription.
    pub fn decrypted_secret(&self, sub: &WebhookSubscription) -> Result<String, Error> {
        match &self.secrets {
            Some(secrets) if SecretsManager::is_envelope(&sub.secret) => secrets
                .decrypt(&sub.secret)
                .map_err(|e| Error::Internal(format!("secret decryption failed: {e}"))),
            _ => Ok(sub.secret.clone()),
        }
    }

    async fn check_deny_list(&self, url: &str) -> Result<(), Error> {
        let mut patterns = self.config.deny_patterns.clone();
        patterns.extend(self.store.deny_list_entries().await.map_err(Error::Store)?);
        denylist::check_url(url, &patterns)
            .map_err(|reason| Error::Webhook(WebhookError::DeniedUrl(reason.to_string())))
    }

    fn check_mgmt_rate(&self, owner: Uuid, quota: &Quota) -> Result<(), Error> {
        let key = owner.to_string();
        if !self
            .mgmt_minute
            .try_acquire(&key, quota.sub_requests_per_minute)
        {
            return Err(Error::RateLimited {
                retry_after_secs: self.mgmt_minute.retry_after_secs(&key),
            });
        }
        if !self.mgmt_day.try_acquire(&key, quota.sub_requests_per_day) {
            return Err(Error::RateLimited {
                retry_after_secs: self.mgmt_day.retry_after_secs(&key),
            });
        }
        Ok(())
    }
}

/// Opaque challenge nonce: 32 random bytes, hex-encoded.
pub fn generate_challenge() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let mut bytes = [0u8; 32];
    rng.fill(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
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

    fn service(store: Arc<InMemoryStore>) -> SubscriptionService {
        SubscriptionService::new(
            store,
            None,
            WebhookConfig::default(),
            Quota::default(),
        )
    }

    fn request(url: &str) -> NewSubscription {
        NewSubscription {
            url: url.into(),
            events: vec!["threat_model.updated".into()],
            secret: "s".into(),
            threat_model_id: None,
        }
    }

    #[tokio::test]
    async fn create_starts_pending_with_challenge() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store);
        let sub = svc
            .create(&principal(), request("https://example.test/hook"))
            .await
            .unwrap();
        assert_eq!(sub.status, SubscriptionStatus::PendingVerification);
        assert_eq!(sub.challenge.len(), 64);
        assert_eq!(sub.challenges_sent, 0);
    }

    #[tokio::test]
    async fn denied_url_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let svc = service(store);
        let err = svc
            .create(&principal(), request("http://169.254.169.254/latest"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Webhook(WebhookError::DeniedUrl(_))));
    }

    #[tokio::test]
    async fn operator_deny_entries_are_consulted() {
        let store = Arc::new(InMemoryStore::new());
        store
            .add_deny_list_entry("https://blocked.example/*")
            .await
            .unwrap();
        let svc = service(store);
        let err = svc
            .create(&principal(), request("https://blocked.example/hook"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Webhook(WebhookError::DeniedUrl(_))));
    }

    #[tokio::test]
    async fn subscription_quota_enforced() {
        let store = Arc::new(InMemoryStore::new());
        let owner = principal();
        store
            .set_quota_override(
                owner.internal_uuid,
                &Quota {
                    max_subscriptions: 1,
                    ..Quota::default()
                },
            )
            .await
            .unwrap();
        let svc = service(store);
        svc.create(&owner, request("https://example.test/a"))
            .await
            .unwrap();
        let err = svc
            .create(&owner, request("https://example.test/b"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Webhook(WebhookError::QuotaExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn mgmt_rate_limit_applies() {
        let store = Arc::new(InMemoryStore::new());
        let owner = principal();
        store
            .set_quota_override(
                owner.internal_uuid,
                &Quota {
                    sub_requests_per_minute: 1,
                    ..Quota::default()
                },
            )
            .await
            .unwrap();
        let svc = service(store);
        svc.create(&owner, request("https://example.test/a"))
            .await
            .unwrap();
        let err = svc
            .create(&owner, request("https://example.test/b"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RateLimited { .. }));
    }

    #[tokio::test]
    async fn non_owner_cannot_see_or_delete() {
        let store = Arc::new(InMemoryStore::new());
        let owner = principal();
        let stranger = principal();
        let svc = service(store);
        let sub = svc
            .create(&owner, request("https://example.test/hook"))
            .await
            .unwrap();

        assert!(svc.get(&stranger, sub.id, false).await.is_err());
        assert!(svc.delete(&stranger, sub.id, false).await.is_err());
        // Admin may
        assert!(svc.get(&stranger, sub.id, true).await.is_ok());
        assert!(svc.delete(&stranger, sub.id, true).await.is_ok());
    }

    #[tokio::test]
    async fn secret_is_envelope_encrypted_when_manager_present() {
        let store = Arc::new(InMemoryStore::new());
        let secrets = Arc::new(SecretsManager::new("passphrase"));
        let svc = SubscriptionService::new(
            store,
            Some(secrets),
            WebhookConfig::default(),
            Quota::default(),
        );
        let sub = svc
            .create(&principal(), request("https://example.test/hook"))
            .await
            .unwrap();
        assert!(SecretsManager::is_envelope(&sub.secret));
        assert_eq!(svc.decrypted_secret(&sub).unwrap(), "s");
    }
}
