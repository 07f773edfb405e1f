//! Identity & authorization resolution.
//!
//! Maps a verified principal to an effective role on a resource by walking
//! the containing threat model's grant list and the principal's group set.
//! Applied on every REST, WebSocket, and event-delivery decision.
//!
//! Disclosure rule: "does not exist" is only distinguishable from "not
//! authorized" when the caller already holds reader-or-better on a parent.
//! A missing or unreadable top-level threat model is always `Forbidden`.

pub mod cache;

pub use cache::IdentityCache;

use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use tmi_core::error::{AuthError, StoreError};
use tmi_core::identity::{Principal, Role};
use tmi_core::model::{ObjectKind, ResourceRef, SubjectKind, ThreatModel};
use tmi_core::store::DomainStore;

/// Compute the principal's effective role on a threat model.
///
/// The owner field is an implicit owner grant. Grants match by email (user
/// subjects) or by group membership under the grant's provider scope.
/// The highest matching role wins.
pub fn role_on_threat_model(principal: &Principal, tm: &ThreatModel) -> Option<Role> {
    let mut best: Option<Role> = None;

    if tm.owner_uuid == principal.internal_uuid || tm.owner_email == principal.email {
        best = Some(Role::Owner);
    }

    for grant in &tm.authorization {
        let matches = match grant.subject_kind {
            SubjectKind::User => grant.subject == principal.email,
            SubjectKind::Group => principal.in_group(&grant.provider, &grant.subject),
        };
        if matches && best.is_none_or(|b| grant.role > b) {
            best = Some(grant.role);
        }
    }
    best
}

/// Per-resource role resolution backed by the domain store.
pub struct AuthzResolver {
    store: Arc<dyn DomainStore>,
}

impl AuthzResolver {
    pub fn new(store: Arc<dyn DomainStore>) -> Self {
        Self { store }
    }

    /// Effective role on the threat model containing `resource`.
    ///
    /// Fails closed: store errors surface as transient-retry indicators,
    /// never as authorization granted.
    pub async fn effective_role(
        &self,
        principal: &Principal,
        resource: ResourceRef,
    ) -> Result<Option<Role>, AuthError> {
        let tm_id = self.containing_threat_model(principal, resource).await?;
        let tm = match self.store.threat_model(tm_id).await {
            Ok(tm) => tm,
            Err(StoreError::NotFound { .. }) => return Ok(None),
            Err(e) => return Err(AuthError::Unavailable(e.to_string())),
        };
        Ok(role_on_threat_model(principal, &tm))
    }

    /// Require at least `min_role` on the resource's threat model.
    ///
    /// Returns the effective role. A missing resource surfaces as
    /// `Forbidden` unless the caller holds reader-or-better on the parent
    /// (child lookups do that check inside `containing_threat_model`).
    pub async fn require_role(
        &self,
        principal: &Principal,
        resource: ResourceRef,
        min_role: Role,
    ) -> Result<Role, AuthError> {
        match self.effective_role(principal, resource).await? {
            Some(role) if role >= min_role => Ok(role),
            Some(_) => Err(AuthError::Forbidden(format!(
                "requires {min_role} on {}",
                resource.kind
            ))),
            None => {
                debug!(
                    user = %principal.internal_uuid,
                    kind = %resource.kind,
                    id = %resource.id,
                    "No role on resource"
                );
                Err(AuthError::Forbidden(format!(
                    "requires {min_role} on {}",
                    resource.kind
                )))
            }
        }
    }

    /// Administrators bypass resolution for administrative endpoints only;
    /// they do not implicitly gain access to user content.
    pub async fn require_admin(&self, principal: &Principal) -> Result<(), AuthError> {
        match self.store.is_admin(principal.internal_uuid).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(AuthError::Forbidden("administrator required".into())),
            Err(e) => Err(AuthError::Unavailable(e.to_string())),
        }
    }

    pub async fn is_admin(&self, principal: &Principal) -> Result<bool, AuthError> {
        self.store
            .is_admin(principal.internal_uuid)
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))
    }

    /// Threat models the principal can read, for list endpoints.
    pub async fn visible_threat_models(
        &self,
        principal: &Principal,
    ) -> Result<Vec<(ThreatModel, Role)>, AuthError> {
        let all = self
            .store
            .list_threat_models()
            .await
            .map_err(|e| AuthError::Unavailable(e.to_string()))?;
        Ok(all
            .into_iter()
            .filter_map(|tm| role_on_threat_model(principal, &tm).map(|r| (tm, r)))
            .collect())
    }

    /// Resolve the threat model that owns `resource`.
    ///
    /// For child resources the parent lookup itself enforces disclosure: a
    /// dangling child behind a readable parent yields `NotFound` at the
    /// caller via the store; a child of an invisible parent never gets that
    /// far and collapses to `Forbidden` in `require_role`.
    async fn containing_threat_model(
        &self,
        principal: &Principal,
        resource: ResourceRef,
    ) -> Result<Uuid, AuthError> {
        match resource.kind {
            ObjectKind::ThreatModel => Ok(resource.id),
            ObjectKind::Diagram => match self.store.diagram(resource.id).await {
                Ok(d) => Ok(d.threat_model_id),
                Err(StoreError::NotFound { .. }) => Err(self.missing_child(principal).await),
                Err(e) => Err(AuthError::Unavailable(e.to_string())),
            },
            ObjectKind::Threat
            | ObjectKind::Asset
            | ObjectKind::Document
            | ObjectKind::Note
            | ObjectKind::Repository
            | ObjectKind::Metadata => match self.store.subresource(resource.id).await {
                Ok(s) => Ok(s.threat_model_id),
                Err(StoreError::NotFound { .. }) => Err(self.missing_child(principal).await),
                Err(e) => Err(AuthError::Unavailable(e.to_string())),
            },
            ObjectKind::User | ObjectKind::WebhookSubscription | ObjectKind::Addon => Err(
                AuthError::Forbidden(format!("{} has no threat-model scope", resource.kind)),
            ),
        }
    }

    /// A child id that resolves to nothing. There is no parent to check a
    /// role against, so the signal stays `Forbidden`.
    async fn missing_child(&self, principal: &Principal) -> AuthError {
        debug!(user = %principal.internal_uuid, "Lookup of nonexistent child resource");
        AuthError::Forbidden("no role on resource".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_core::identity::GroupRef;
    use tmi_core::model::Grant;
    use tmi_store::InMemoryStore;

    fn principal(email: &str, groups: Vec<GroupRef>) -> Principal {
        Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "github".into(),
            provider_user_id: format!("gh-{email}"),
            email: email.into(),
            display_name: email.into(),
            groups,
        }
    }

    fn model_owned_by(p: &Principal) -> ThreatModel {
        ThreatModel::new(p.internal_uuid, &p.email, "TM")
    }

    #[test]
    fn owner_field_is_implicit_owner_grant() {
        let owner = principal("o@example.test", vec![]);
        let tm = model_owned_by(&owner);
        assert_eq!(role_on_threat_model(&owner, &tm), Some(Role::Owner));
    }

    #[test]
    fn highest_matching_role_wins() {
        let owner = principal("o@example.test", vec![]);
        let user = principal("u@example.test", vec![GroupRef::new("github", "eng")]);
        let mut tm = model_owned_by(&owner);
        tm.authorization.push(Grant::user(&user.email, Role::Reader));
        tm.authorization
            .push(Grant::group("github", "eng", Role::Writer));
        assert_eq!(role_on_threat_model(&user, &tm), Some(Role::Writer));
    }

    #[test]
    fn group_grant_respects_provider_scope() {
        let owner = principal("o@example.test", vec![]);
        let user = principal("u@example.test", vec![GroupRef::new("google", "eng")]);
        let mut tm = model_owned_by(&owner);
        tm.authorization
            .push(Grant::group("github", "eng", Role::Writer));
        assert_eq!(role_on_threat_model(&user, &tm), None);

        let wildcard_user = principal("w@example.test", vec![GroupRef::new("*", "eng")]);
        assert_eq!(
            role_on_threat_model(&wildcard_user, &tm),
            Some(Role::Writer)
        );
    }

    #[test]
    fn no_grant_means_no_role() {
        let owner = principal("o@example.test", vec![]);
        let stranger = principal("s@example.test", vec![]);
        let tm = model_owned_by(&owner);
        assert_eq!(role_on_threat_model(&stranger, &tm), None);
    }

    #[tokio::test]
    async fn require_role_enforces_minimum() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = AuthzResolver::new(store.clone());

        let owner = principal("o@example.test", vec![]);
        let reader = principal("r@example.test", vec![]);
        let mut tm = model_owned_by(&owner);
        tm.authorization.push(Grant::user(&reader.email, Role::Reader));
        store.create_threat_model(&tm, owner.internal_uuid).await.unwrap();

        let resource = ResourceRef::new(ObjectKind::ThreatModel, tm.id);
        assert_eq!(
            resolver.require_role(&owner, resource, Role::Owner).await.unwrap(),
            Role::Owner
        );
        assert_eq!(
            resolver.require_role(&reader, resource, Role::Reader).await.unwrap(),
            Role::Reader
        );
        assert!(
            resolver
                .require_role(&reader, resource, Role::Writer)
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn missing_threat_model_collapses_to_forbidden() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = AuthzResolver::new(store);
        let p = principal("a@example.test", vec![]);
        let resource = ResourceRef::new(ObjectKind::ThreatModel, Uuid::new_v4());
        let err = resolver.require_role(&p, resource, Role::Reader).await.unwrap_err();
        assert!(matches!(err, AuthError::Forbidden(_)));
    }

    #[tokio::test]
    async fn diagram_inherits_parent_authorization() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = AuthzResolver::new(store.clone());

        let owner = principal("o@example.test", vec![]);
        let writer = principal("w@example.test", vec![]);
        let mut tm = model_owned_by(&owner);
        tm.authorization.push(Grant::user(&writer.email, Role::Writer));
        store.create_threat_model(&tm, owner.internal_uuid).await.unwrap();
        let d = tmi_core::diagram::Diagram::new(tm.id, "DFD", Default::default());
        store.create_diagram(&d, owner.internal_uuid).await.unwrap();

        let resource = ResourceRef::new(ObjectKind::Diagram, d.id);
        assert_eq!(
            resolver.require_role(&writer, resource, Role::Writer).await.unwrap(),
            Role::Writer
        );
    }

    #[tokio::test]
    async fn admin_gate() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = AuthzResolver::new(store.clone());
        let p = principal("a@example.test", vec![]);
        assert!(resolver.require_admin(&p).await.is_err());
        store.grant_admin(p.internal_uuid).await.unwrap();
        assert!(resolver.require_admin(&p).await.is_ok());
    }

    #[tokio::test]
    async fn visible_threat_models_filters_by_role() {
        let store = Arc::new(InMemoryStore::new());
        let resolver = AuthzResolver::new(store.clone());

        let a = principal("a@example.test", vec![]);
        let b = principal("b@example.test", vec![]);
        let tm_a = model_owned_by(&a);
        let tm_b = model_owned_by(&b);
        store.create_threat_model(&tm_a, a.internal_uuid).await.unwrap();
        store.create_threat_model(&tm_b, b.internal_uuid).await.unwrap();

        let visible = resolver.visible_threat_models(&a).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0.id, tm_a.id);
        assert_eq!(visible[0].1, Role::Owner);
    }
}
