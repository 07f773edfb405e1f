//! Domain store trait — persistent CRUD over the entity graph.
//!
//! Implementations live in `tmi-store`. Every mutation is transactional,
//! assigns a fresh `modified_at`, and emits a change record to the event
//! bus after commit (at-least-once; downstream deduplicates by event id).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::addon::{AddonInvocation, AddonRegistration, InvocationStatus};
use crate::diagram::{Cell, Diagram};
use crate::error::StoreError;
use crate::identity::{GroupRef, User};
use crate::model::{ObjectKind, Subresource, SubresourcePayload, ThreatModel};
use crate::quota::Quota;
use crate::webhook::{DeliveryStatus, SubscriptionStatus, WebhookDelivery, WebhookSubscription};

/// Persistent store of users, threat models, diagrams, subresources,
/// webhook state, addons, invocations, quotas, and administrators.
#[async_trait]
pub trait DomainStore: Send + Sync {
    // --- Users & groups ---

    /// Insert a user; fails on duplicate `(provider, provider_user_id)`.
    async fn create_user(&self, user: &User) -> Result<(), StoreError>;

    async fn user_by_id(&self, id: Uuid) -> Result<User, StoreError>;

    async fn user_by_provider_id(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<User>, StoreError>;

    async fn touch_last_login(&self, id: Uuid) -> Result<(), StoreError>;

    /// Hard-delete a user: transfer or cascade owned threat models, strip
    /// remaining grants, then remove the row. One transaction.
    async fn delete_user(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError>;

    /// Persisted system-group memberships for a user (provider `"*"`).
    async fn system_groups_for(&self, user_id: Uuid) -> Result<Vec<GroupRef>, StoreError>;

    async fn add_group_member(&self, group: &GroupRef, user_id: Uuid) -> Result<(), StoreError>;

    // --- Threat models ---

    async fn create_threat_model(&self, tm: &ThreatModel, actor: Uuid) -> Result<(), StoreError>;

    async fn threat_model(&self, id: Uuid) -> Result<ThreatModel, StoreError>;

    /// Full replace of mutable fields; enforces the one-owner invariant.
    async fn update_threat_model(&self, tm: &ThreatModel, actor: Uuid) -> Result<(), StoreError>;

    async fn delete_threat_model(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError>;

    async fn list_threat_models(&self) -> Result<Vec<ThreatModel>, StoreError>;

    // --- Diagrams ---

    async fn create_diagram(&self, diagram: &Diagram, actor: Uuid) -> Result<(), StoreError>;

    async fn diagram(&self, id: Uuid) -> Result<Diagram, StoreError>;

    async fn diagrams_for(&self, threat_model_id: Uuid) -> Result<Vec<Diagram>, StoreError>;

    /// Rename / retype a diagram without touching cells or version.
    async fn update_diagram_meta(&self, diagram: &Diagram, actor: Uuid) -> Result<(), StoreError>;

    /// Replace the cell set, advancing `version` to `new_version`.
    /// Fails with [`StoreError::VersionConflict`] unless the stored version
    /// equals `expected_version`. The version never decreases.
    async fn update_diagram_cells(
        &self,
        id: Uuid,
        cells: &[Cell],
        expected_version: u64,
        new_version: u64,
        actor: Uuid,
    ) -> Result<(), StoreError>;

    async fn delete_diagram(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError>;

    // --- Subresources ---

    async fn create_subresource(&self, sub: &Subresource, actor: Uuid) -> Result<(), StoreError>;

    async fn subresource(&self, id: Uuid) -> Result<Subresource, StoreError>;

    async fn update_subresource(
        &self,
        id: Uuid,
        payload: &SubresourcePayload,
        actor: Uuid,
    ) -> Result<(), StoreError>;

    async fn delete_subresource(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError>;

    async fn subresources_for(
        &self,
        threat_model_id: Uuid,
        kind: Option<ObjectKind>,
    ) -> Result<Vec<Subresource>, StoreError>;

    // --- Webhook subscriptions ---

    async fn create_subscription(&self, sub: &WebhookSubscription) -> Result<(), StoreError>;

    async fn subscription(&self, id: Uuid) -> Result<WebhookSubscription, StoreError>;

    async fn subscriptions_for_owner(
        &self,
        owner: Uuid,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;

    async fn subscriptions_with_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<WebhookSubscription>, StoreError>;

    async fn set_subscription_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError>;

    async fn record_challenge_sent(&self, id: Uuid) -> Result<u32, StoreError>;

    /// Increment `publication_failures`; returns the new count.
    async fn record_publication_failure(&self, id: Uuid) -> Result<u32, StoreError>;

    async fn record_successful_use(&self, id: Uuid) -> Result<(), StoreError>;

    async fn delete_subscription(&self, id: Uuid) -> Result<(), StoreError>;

    async fn count_subscriptions(&self, owner: Uuid) -> Result<usize, StoreError>;

    // --- Webhook deliveries ---

    /// Insert a delivery unless one already exists for the same
    /// `(subscription_id, event_id)` pair. Returns whether a row was added.
    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError>;

    /// Claim up to `limit` due pending/retry deliveries, marking them
    /// in-flight. A claimed delivery is invisible to other workers.
    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError>;

    async fn mark_delivery(
        &self,
        id: Uuid,
        status: DeliveryStatus,
        attempts: u32,
        next_retry_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn delivery(&self, id: Uuid) -> Result<WebhookDelivery, StoreError>;

    /// Remove terminal deliveries older than `cutoff` and deliveries whose
    /// subscription no longer exists. Returns rows removed.
    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // --- Addons ---

    async fn create_addon(&self, addon: &AddonRegistration) -> Result<(), StoreError>;

    async fn addon(&self, id: Uuid) -> Result<AddonRegistration, StoreError>;

    async fn list_addons(&self) -> Result<Vec<AddonRegistration>, StoreError>;

    async fn delete_addon(&self, id: Uuid) -> Result<(), StoreError>;

    // --- Addon invocations ---

    async fn create_invocation(&self, inv: &AddonInvocation) -> Result<(), StoreError>;

    async fn invocation(&self, id: Uuid) -> Result<AddonInvocation, StoreError>;

    async fn update_invocation_status(
        &self,
        id: Uuid,
        status: InvocationStatus,
        percent: u8,
        message: &str,
    ) -> Result<(), StoreError>;

    async fn invocations_for_user(&self, user: Uuid) -> Result<Vec<AddonInvocation>, StoreError>;

    /// Count of pending + in-progress invocations for a user.
    async fn active_invocation_count(&self, user: Uuid) -> Result<usize, StoreError>;

    /// Invocations created by `user` since `since` (sliding-hour quota).
    async fn invocations_since(
        &self,
        user: Uuid,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    async fn non_terminal_invocations_for_addon(&self, addon: Uuid) -> Result<usize, StoreError>;

    /// Remove invocations past retention. Returns rows removed.
    async fn prune_invocations(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Fail non-terminal invocations whose last status update is older
    /// than `cutoff` (server-side callback lifetime). Returns rows changed.
    async fn expire_invocations(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    // --- Quotas & administrators ---

    async fn quota_override(&self, user: Uuid) -> Result<Option<Quota>, StoreError>;

    async fn set_quota_override(&self, user: Uuid, quota: &Quota) -> Result<(), StoreError>;

    async fn is_admin(&self, user: Uuid) -> Result<bool, StoreError>;

    async fn grant_admin(&self, user: Uuid) -> Result<(), StoreError>;

    async fn revoke_admin(&self, user: Uuid) -> Result<(), StoreError>;

    // --- Operator deny list ---

    async fn deny_list_entries(&self) -> Result<Vec<String>, StoreError>;

    async fn add_deny_list_entry(&self, pattern: &str) -> Result<(), StoreError>;

    async fn remove_deny_list_entry(&self, pattern: &str) -> Result<(), StoreError>;
}
