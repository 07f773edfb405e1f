//! In-memory domain store.
//!
//! HashMap-backed implementation used by tests and ephemeral runs. It
//! mirrors the SQLite backend's semantics exactly: same invariants, same
//! cascade rules, same change-record emissions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use uuid::Uuid;

use tmi_core::addon::{AddonInvocation, AddonRegistration, InvocationStatus};
use tmi_core::diagram::{Cell, Diagram};
use tmi_core::error::StoreError;
use tmi_core::event::{ChangeAction, ChangeRecord};
use tmi_core::identity::{GroupRef, Role, User, WILDCARD_PROVIDER};
use tmi_core::model::{ObjectKind, Subresource, SubresourcePayload, SubjectKind, ThreatModel};
use tmi_core::quota::Quota;
use tmi_core::store::DomainStore;
use tmi_core::webhook::{
    DeliveryStatus, SubscriptionStatus, WebhookDelivery, WebhookSubscription,
};

use crate::ChangeNotifier;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    group_members: HashMap<(String, String), HashSet<Uuid>>,
    threat_models: HashMap<Uuid, ThreatModel>,
    diagrams: HashMap<Uuid, Diagram>,
    subresources: HashMap<Uuid, Subresource>,
    subscriptions: HashMap<Uuid, WebhookSubscription>,
    deliveries: HashMap<Uuid, WebhookDelivery>,
    delivery_keys: HashSet<(Uuid, Uuid)>,
    addons: HashMap<Uuid, AddonRegistration>,
    invocations: HashMap<Uuid, AddonInvocation>,
    quotas: HashMap<Uuid, Quota>,
    admins: HashSet<Uuid>,
    deny_list: Vec<String>,
}

/// HashMap-backed [`DomainStore`].
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    notifier: Option<ChangeNotifier>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            notifier: None,
        }
    }

    /// Attach a change notifier; mutations emit records after commit.
    pub fn with_notifier(mut self, notifier: ChangeNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    async fn emit(&self, records: Vec<ChangeRecord>) {
        if let Some(notifier) = &self.notifier {
            for record in records {
                notifier.emit(record).await;
            }
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(kind: &'static str, id: Uuid) -> StoreError {
    StoreError::NotFound {
        kind,
        id: id.to_string(),
    }
}

#[async_trait]
impl DomainStore for InMemoryStore {
    // --- Users & groups ---

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.users.values().any(|u| {
            u.provider == user.provider && u.provider_user_id == user.provider_user_id
        });
        if duplicate {
            return Err(StoreError::DuplicateIdentity {
                provider: user.provider.clone(),
                provider_user_id: user.provider_user_id.clone(),
            });
        }
        inner.users.insert(user.internal_uuid, user.clone());
        Ok(())
    }

    async fn user_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        self.inner
            .read()
            .await
            .users
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("user", id))
    }

    async fn user_by_provider_id(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .users
            .values()
            .find(|u| u.provider == provider && u.provider_user_id == provider_user_id)
            .cloned())
    }

    async fn touch_last_login(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let user = inner.users.get_mut(&id).ok_or_else(|| not_found("user", id))?;
        user.last_login = Utc::now();
        Ok(())
    }

    async fn delete_user(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let mut records = Vec::new();
        {
            let mut inner = self.inner.write().await;
            let user = inner.users.get(&id).cloned().ok_or_else(|| not_found("user", id))?;

            // Resolve each owned threat model: transfer to the first other
            // owner-roled user grant (insertion order), else delete.
            let owned: Vec<Uuid> = inner
                .threat_models
                .values()
                .filter(|tm| tm.owner_uuid == id)
                .map(|tm| tm.id)
                .collect();

            for tm_id in owned {
                let tm = inner.threat_models.get(&tm_id).cloned().expect("owned id");
                let successor = tm
                    .authorization
                    .iter()
                    .find(|g| {
                        g.role == Role::Owner
                            && g.subject_kind == SubjectKind::User
                            && g.subject != user.email
                    })
                    .map(|g| g.subject.clone())
                    .and_then(|email| {
                        inner
                            .users
                            .values()
                            .find(|u| u.email == email)
                            .map(|u| (u.internal_uuid, email))
                    });

                match successor {
                    Some((new_owner, email)) => {
                        let tm = inner.threat_models.get_mut(&tm_id).expect("owned id");
                        tm.owner_uuid = new_owner;
                        tm.owner_email = email;
                        tm.authorization
                            .retain(|g| !(g.subject_kind == SubjectKind::User
                                && g.subject == user.email));
                        tm.modified_at = Utc::now();
                        records.push(
                            ChangeRecord::new(
                                ObjectKind::ThreatModel,
                                ChangeAction::Updated,
                                tm_id,
                                Some(tm_id),
                                actor,
                            )
                            .with_after(serde_json::to_value(&*tm).unwrap_or_default()),
                        );
                    }
                    None => {
                        inner.threat_models.remove(&tm_id);
                        inner.diagrams.retain(|_, d| d.threat_model_id != tm_id);
                        inner
                            .subresources
                            .retain(|_, s| s.threat_model_id != tm_id);
                        records.push(ChangeRecord::new(
                            ObjectKind::ThreatModel,
                            ChangeAction::Deleted,
                            tm_id,
                            Some(tm_id),
                            actor,
                        ));
                    }
                }
            }

            // Strip remaining non-owner grants held by the deleted user
            let email = user.email.clone();
            for tm in inner.threat_models.values_mut() {
                let before = tm.authorization.len();
                tm.authorization.retain(|g| {
                    !(g.subject_kind == SubjectKind::User
                        && g.subject == email
                        && g.role != Role::Owner)
                });
                if tm.authorization.len() != before {
                    tm.modified_at = Utc::now();
                }
            }

            for (_, members) in inner.group_members.iter_mut() {
                members.remove(&id);
            }
            inner.users.remove(&id);
            records.push(ChangeRecord::new(
                ObjectKind::User,
                ChangeAction::Deleted,
                id,
                None,
                actor,
            ));
        }
        self.emit(records).await;
        Ok(())
    }

    async fn system_groups_for(&self, user_id: Uuid) -> Result<Vec<GroupRef>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .group_members
            .iter()
            .filter(|((provider, _), members)| {
                provider == WILDCARD_PROVIDER && members.contains(&user_id)
            })
            .map(|((provider, name), _)| GroupRef::new(provider.clone(), name.clone()))
            .collect())
    }

    async fn add_group_member(&self, group: &GroupRef, user_id: Uuid) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .group_members
            .entry((group.provider.clone(), group.name.clone()))
            .or_default()
            .insert(user_id);
        Ok(())
    }

    // --- Threat models ---

    async fn create_threat_model(&self, tm: &ThreatModel, actor: Uuid) -> Result<(), StoreError> {
        if !tm.owner_invariant_holds() {
            return Err(StoreError::OwnerInvariant(tm.id.to_string()));
        }
        {
            let mut inner = self.inner.write().await;
            inner.threat_models.insert(tm.id, tm.clone());
        }
        self.emit(vec![
            ChangeRecord::new(
                ObjectKind::ThreatModel,
                ChangeAction::Created,
                tm.id,
                Some(tm.id),
                actor,
            )
            .with_after(serde_json::to_value(tm).unwrap_or_default()),
        ])
        .await;
        Ok(())
    }

    async fn threat_model(&self, id: Uuid) -> Result<ThreatModel, StoreError> {
        self.inner
            .read()
            .await
            .threat_models
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("threat_model", id))
    }

    async fn update_threat_model(&self, tm: &ThreatModel, actor: Uuid) -> Result<(), StoreError> {
        if !tm.owner_invariant_holds() {
            return Err(StoreError::OwnerInvariant(tm.id.to_string()));
        }
        let before = {
            let mut inner = self.inner.write().await;
            let existing = inner
                .threat_models
                .get_mut(&tm.id)
                .ok_or_else(|| not_found("threat_model", tm.id))?;
            let before = serde_json::to_value(&*existing).unwrap_or_default();
            *existing = ThreatModel {
                modified_at: Utc::now(),
                created_at: existing.created_at,
                ..tm.clone()
            };
            before
        };
        self.emit(vec![
            ChangeRecord::new(
                ObjectKind::ThreatModel,
                ChangeAction::Updated,
                tm.id,
                Some(tm.id),
                actor,
            )
            .with_before(before)
            .with_after(serde_json::to_value(tm).unwrap_or_default()),
        ])
        .await;
        Ok(())
    }

    async fn delete_threat_model(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            inner
                .threat_models
                .remove(&id)
                .ok_or_else(|| not_found("threat_model", id))?;
            inner.diagrams.retain(|_, d| d.threat_model_id != id);
            inner.subresources.retain(|_, s| s.threat_model_id != id);
        }
        self.emit(vec![ChangeRecord::new(
            ObjectKind::ThreatModel,
            ChangeAction::Deleted,
            id,
            Some(id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn list_threat_models(&self) -> Result<Vec<ThreatModel>, StoreError> {
        let mut all: Vec<ThreatModel> =
            self.inner.read().await.threat_models.values().cloned().collect();
        all.sort_by_key(|tm| tm.created_at);
        Ok(all)
    }

    // --- Diagrams ---

    async fn create_diagram(&self, diagram: &Diagram, actor: Uuid) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            if !inner.threat_models.contains_key(&diagram.threat_model_id) {
                return Err(not_found("threat_model", diagram.threat_model_id));
            }
            inner.diagrams.insert(diagram.id, diagram.clone());
        }
        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Created,
            diagram.id,
            Some(diagram.threat_model_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn diagram(&self, id: Uuid) -> Result<Diagram, StoreError> {
        self.inner
            .read()
            .await
            .diagrams
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("diagram", id))
    }

    async fn diagrams_for(&self, threat_model_id: Uuid) -> Result<Vec<Diagram>, StoreError> {
        let mut out: Vec<Diagram> = self
            .inner
            .read()
            .await
            .diagrams
            .values()
            .filter(|d| d.threat_model_id == threat_model_id)
            .cloned()
            .collect();
        out.sort_by_key(|d| d.created_at);
        Ok(out)
    }

    async fn update_diagram_meta(&self, diagram: &Diagram, actor: Uuid) -> Result<(), StoreError> {
        let tm_id = {
            let mut inner = self.inner.write().await;
            let existing = inner
                .diagrams
                .get_mut(&diagram.id)
                .ok_or_else(|| not_found("diagram", diagram.id))?;
            existing.name = diagram.name.clone();
            existing.kind = diagram.kind;
            existing.modified_at = Utc::now();
            existing.threat_model_id
        };
        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Updated,
            diagram.id,
            Some(tm_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn update_diagram_cells(
        &self,
        id: Uuid,
        cells: &[Cell],
        expected_version: u64,
        new_version: u64,
        actor: Uuid,
    ) -> Result<(), StoreError> {
        let tm_id = {
            let mut inner = self.inner.write().await;
            let diagram = inner
                .diagrams
                .get_mut(&id)
                .ok_or_else(|| not_found("diagram", id))?;
            if diagram.version != expected_version {
                return Err(StoreError::VersionConflict {
                    kind: "diagram",
                    id: id.to_string(),
                    expected: expected_version,
                    found: diagram.version,
                });
            }
            if new_version < diagram.version {
                return Err(StoreError::VersionConflict {
                    kind: "diagram",
                    id: id.to_string(),
                    expected: diagram.version,
                    found: new_version,
                });
            }
            diagram.cells = cells.to_vec();
            if let Err(missing) = diagram.validate_references() {
                return Err(StoreError::InvalidReference(missing.to_string()));
            }
            diagram.version = new_version;
            diagram.modified_at = Utc::now();
            diagram.threat_model_id
        };
        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Updated,
            id,
            Some(tm_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn delete_diagram(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let tm_id = {
            let mut inner = self.inner.write().await;
            let diagram = inner
                .diagrams
                .remove(&id)
                .ok_or_else(|| not_found("diagram", id))?;
            diagram.threat_model_id
        };
        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Deleted,
            id,
            Some(tm_id),
            actor,
        )])
        .await;
        Ok(())
    }

    // --- Subresources ---

    async fn create_subresource(&self, sub: &Subresource, actor: Uuid) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.write().await;
            if !inner.threat_models.contains_key(&sub.threat_model_id) {
                return Err(not_found("threat_model", sub.threat_model_id));
            }
            inner.subresources.insert(sub.id, sub.clone());
        }
        self.emit(vec![ChangeRecord::new(
            sub.kind,
            ChangeAction::Created,
            sub.id,
            Some(sub.threat_model_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn subresource(&self, id: Uuid) -> Result<Subresource, StoreError> {
        self.inner
            .read()
            .await
            .subresources
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("subresource", id))
    }

    async fn update_subresource(
        &self,
        id: Uuid,
        payload: &SubresourcePayload,
        actor: Uuid,
    ) -> Result<(), StoreError> {
        let (kind, tm_id) = {
            let mut inner = self.inner.write().await;
            let sub = inner
                .subresources
                .get_mut(&id)
                .ok_or_else(|| not_found("subresource", id))?;
            if sub.kind != payload.object_kind() {
                return Err(StoreError::InvalidReference(format!(
                    "subresource kind mismatch: {} vs {}",
                    sub.kind,
                    payload.object_kind()
                )));
            }
            sub.payload = payload.clone();
            sub.modified_at = Utc::now();
            (sub.kind, sub.threat_model_id)
        };
        self.emit(vec![ChangeRecord::new(
            kind,
            ChangeAction::Updated,
            id,
            Some(tm_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn delete_subresource(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let (kind, tm_id) = {
            let mut inner = self.inner.write().await;
            let sub = inner
                .subresources
                .remove(&id)
                .ok_or_else(|| not_found("subresource", id))?;
            (sub.kind, sub.threat_model_id)
        };
        self.emit(vec![ChangeRecord::new(
            kind,
            ChangeAction::Deleted,
            id,
            Some(tm_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn subresources_for(
        &self,
        threat_model_id: Uuid,
        kind: Option<ObjectKind>,
    ) -> Result<Vec<Subresource>, StoreError> {
        let mut out: Vec<Subresource> = self
            .inner
            .read()
            .await
            .subresources
            .values()
            .filter(|s| s.threat_model_id == threat_model_id)
            .filter(|s| kind.is_none_or(|k| s.kind == k))
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    // --- Webhook subscriptions ---

    async fn create_subscription(&self, sub: &WebhookSubscription) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .subscriptions
            .insert(sub.id, sub.clone());
        Ok(())
    }

    async fn subscription(&self, id: Uuid) -> Result<WebhookSubscription, StoreError> {
        self.inner
            .read()
            .await
            .subscriptions
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("webhook_subscription", id))
    }

    async fn subscriptions_for_owner(
        &self,
        owner: Uuid,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let mut out: Vec<WebhookSubscription> = self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.owner_user_uuid == owner)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn subscriptions_with_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let mut out: Vec<WebhookSubscription> = self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }

    async fn set_subscription_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| not_found("webhook_subscription", id))?;
        sub.status = status;
        sub.modified_at = Utc::now();
        Ok(())
    }

    async fn record_challenge_sent(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| not_found("webhook_subscription", id))?;
        sub.challenges_sent += 1;
        sub.modified_at = Utc::now();
        Ok(sub.challenges_sent)
    }

    async fn record_publication_failure(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| not_found("webhook_subscription", id))?;
        sub.publication_failures += 1;
        sub.modified_at = Utc::now();
        Ok(sub.publication_failures)
    }

    async fn record_successful_use(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let sub = inner
            .subscriptions
            .get_mut(&id)
            .ok_or_else(|| not_found("webhook_subscription", id))?;
        sub.last_successful_use = Some(Utc::now());
        sub.publication_failures = 0;
        sub.modified_at = Utc::now();
        Ok(())
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .subscriptions
            .remove(&id)
            .ok_or_else(|| not_found("webhook_subscription", id))?;
        Ok(())
    }

    async fn count_subscriptions(&self, owner: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .subscriptions
            .values()
            .filter(|s| s.owner_user_uuid == owner)
            .count())
    }

    // --- Webhook deliveries ---

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let key = (delivery.subscription_id, delivery.event_id);
        if inner.delivery_keys.contains(&key) {
            return Ok(false);
        }
        inner.delivery_keys.insert(key);
        inner.deliveries.insert(delivery.id, delivery.clone());
        Ok(true)
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut inner = self.inner.write().await;
        let mut due: Vec<(DateTime<Utc>, Uuid)> = inner
            .deliveries
            .values()
            .filter(|d| {
                matches!(d.status, DeliveryStatus::Pending | DeliveryStatus::Retry)
                    && d.next_retry_at.is_none_or(|at| at <= now)
            })
            .map(|d| (d.created_at, d.id))
            .collect();
        due.sort();
        due.truncate(limit);
        let due: Vec<Uuid> = due.into_iter().map(|(_, id)| id).collect();

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            if let Some(d) = inner.deliveries.get_mut(&id) {
                d.status = DeliveryStatus::InFlight;
                d.updated_at = now;
                claimed.push(d.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        attempts: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let delivery = inner
            .deliveries
            .get_mut(&id)
            .ok_or_else(|| not_found("webhook_delivery", id))?;
        delivery.status = status;
        delivery.attempts = attempts;
        delivery.next_retry_at = next_retry_at;
        delivery.last_error = last_error.map(str::to_string);
        delivery.updated_at = Utc::now();
        Ok(())
    }

    async fn delivery(&self, id: Uuid) -> Result<WebhookDelivery, StoreError> {
        self.inner
            .read()
            .await
            .deliveries
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("webhook_delivery", id))
    }

    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.deliveries.len();
        let live_subs: HashSet<Uuid> = inner.subscriptions.keys().copied().collect();
        inner.deliveries.retain(|_, d| {
            let expired = d.status.is_terminal() && d.updated_at < cutoff;
            let orphaned = !live_subs.contains(&d.subscription_id);
            !(expired || orphaned)
        });
        let keys: HashSet<(Uuid, Uuid)> = inner
            .deliveries
            .values()
            .map(|d| (d.subscription_id, d.event_id))
            .collect();
        inner.delivery_keys = keys;
        Ok((before - inner.deliveries.len()) as u64)
    }

    // --- Addons ---

    async fn create_addon(&self, addon: &AddonRegistration) -> Result<(), StoreError> {
        self.inner.write().await.addons.insert(addon.id, addon.clone());
        Ok(())
    }

    async fn addon(&self, id: Uuid) -> Result<AddonRegistration, StoreError> {
        self.inner
            .read()
            .await
            .addons
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("addon", id))
    }

    async fn list_addons(&self) -> Result<Vec<AddonRegistration>, StoreError> {
        let mut out: Vec<AddonRegistration> =
            self.inner.read().await.addons.values().cloned().collect();
        out.sort_by_key(|a| a.created_at);
        Ok(out)
    }

    async fn delete_addon(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.addons.remove(&id).ok_or_else(|| not_found("addon", id))?;
        Ok(())
    }

    // --- Addon invocations ---

    async fn create_invocation(&self, inv: &AddonInvocation) -> Result<(), StoreError> {
        self.inner.write().await.invocations.insert(inv.id, inv.clone());
        Ok(())
    }

    async fn invocation(&self, id: Uuid) -> Result<AddonInvocation, StoreError> {
        self.inner
            .read()
            .await
            .invocations
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found("addon_invocation", id))
    }

    async fn update_invocation_status(
        &self,
        id: Uuid,
        status: InvocationStatus,
        percent: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let inv = inner
            .invocations
            .get_mut(&id)
            .ok_or_else(|| not_found("addon_invocation", id))?;
        inv.status = status;
        inv.status_percent = percent.min(100);
        inv.status_message = message.to_string();
        inv.status_updated_at = Utc::now();
        Ok(())
    }

    async fn invocations_for_user(&self, user: Uuid) -> Result<Vec<AddonInvocation>, StoreError> {
        let mut out: Vec<AddonInvocation> = self
            .inner
            .read()
            .await
            .invocations
            .values()
            .filter(|i| i.invoker_user_uuid == user)
            .cloned()
            .collect();
        out.sort_by_key(|i| i.created_at);
        Ok(out)
    }

    async fn active_invocation_count(&self, user: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .invocations
            .values()
            .filter(|i| i.invoker_user_uuid == user && !i.status.is_terminal())
            .count())
    }

    async fn invocations_since(
        &self,
        user: Uuid,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .invocations
            .values()
            .filter(|i| i.invoker_user_uuid == user && i.created_at >= since)
            .count())
    }

    async fn non_terminal_invocations_for_addon(&self, addon: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .invocations
            .values()
            .filter(|i| i.addon_id == addon && !i.status.is_terminal())
            .count())
    }

    async fn prune_invocations(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.invocations.len();
        inner.invocations.retain(|_, i| i.created_at >= cutoff);
        Ok((before - inner.invocations.len()) as u64)
    }

    async fn expire_invocations(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut expired = 0u64;
        for inv in inner.invocations.values_mut() {
            if !inv.status.is_terminal() && inv.status_updated_at < cutoff {
                inv.status = InvocationStatus::Failed;
                inv.status_message = "expired".into();
                inv.status_updated_at = Utc::now();
                expired += 1;
            }
        }
        Ok(expired)
    }

    // --- Quotas & administrators ---

    async fn quota_override(&self, user: Uuid) -> Result<Option<Quota>, StoreError> {
        Ok(self.inner.read().await.quotas.get(&user).copied())
    }

    async fn set_quota_override(&self, user: Uuid, quota: &Quota) -> Result<(), StoreError> {
        self.inner.write().await.quotas.insert(user, *quota);
        Ok(())
    }

    async fn is_admin(&self, user: Uuid) -> Result<bool, StoreError> {
        Ok(self.inner.read().await.admins.contains(&user))
    }

    async fn grant_admin(&self, user: Uuid) -> Result<(), StoreError> {
        self.inner.write().await.admins.insert(user);
        Ok(())
    }

    async fn revoke_admin(&self, user: Uuid) -> Result<(), StoreError> {
        self.inner.write().await.admins.remove(&user);
        Ok(())
    }

    // --- Operator deny list ---

    async fn deny_list_entries(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.inner.read().await.deny_list.clone())
    }

    async fn add_deny_list_entry(&self, pattern: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.deny_list.iter().any(|p| p == pattern) {
            inner.deny_list.push(pattern.to_string());
        }
        Ok(())
    }

    async fn remove_deny_list_entry(&self, pattern: &str) -> Result<(), StoreError> {
        self.inner.write().await.deny_list.retain(|p| p != pattern);
        Ok(())
    }
}
