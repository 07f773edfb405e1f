//! Identity types — principals, users, groups, and resource roles.
//!
//! A principal is what the gateway hands the rest of the system after token
//! verification: a stable internal UUID plus the provider-issued identity
//! and group set. `(provider, provider_user_id)` is the uniqueness key; two
//! providers asserting the same email are distinct principals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Provider tag for cross-provider system groups.
pub const WILDCARD_PROVIDER: &str = "*";

/// Effective role on a resource, ordered by precedence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Reader,
    Writer,
    Owner,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::Owner => "owner",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "reader" => Some(Role::Reader),
            "writer" => Some(Role::Writer),
            "owner" => Some(Role::Owner),
            _ => None,
        }
    }

    /// Writer-or-better.
    pub fn can_write(&self) -> bool {
        *self >= Role::Writer
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `(provider, group_name)` pair. Provider `"*"` denotes a cross-provider
/// system group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupRef {
    pub provider: String,
    pub name: String,
}

impl GroupRef {
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            name: name.into(),
        }
    }

    /// Whether a grant issued under `grant_provider` matches this membership.
    pub fn matches_provider(&self, grant_provider: &str) -> bool {
        self.provider == grant_provider
            || self.provider == WILDCARD_PROVIDER
            || grant_provider == WILDCARD_PROVIDER
    }
}

/// A verified principal: the identity attached to every request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub internal_uuid: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    /// Group memberships asserted by the identity provider, plus any
    /// system groups resolved from the store.
    #[serde(default)]
    pub groups: Vec<GroupRef>,
}

impl Principal {
    /// Whether the principal is a member of `name` under `provider`
    /// (honoring the `"*"` wildcard on either side).
    pub fn in_group(&self, provider: &str, name: &str) -> bool {
        self.groups
            .iter()
            .any(|g| g.name == name && g.matches_provider(provider))
    }
}

/// A persisted user row. Created on first successful authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub internal_uuid: Uuid,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
}

impl User {
    /// Construct a fresh user for a first-time authentication.
    pub fn bootstrap(
        provider: impl Into<String>,
        provider_user_id: impl Into<String>,
        email: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            internal_uuid: Uuid::new_v4(),
            provider: provider.into(),
            provider_user_id: provider_user_id.into(),
            email: email.into(),
            display_name: display_name.into(),
            created_at: now,
            last_login: now,
        }
    }

    pub fn principal(&self, groups: Vec<GroupRef>) -> Principal {
        Principal {
            internal_uuid: self.internal_uuid,
            provider: self.provider.clone(),
            provider_user_id: self.provider_user_id.clone(),
            email: self.email.clone(),
            display_name: self.display_name.clone(),
            groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_precedence() {
        assert!(Role::Owner > Role::Writer);
        assert!(Role::Writer > Role::Reader);
        assert!(Role::Owner.can_write());
        assert!(Role::Writer.can_write());
        assert!(!Role::Reader.can_write());
    }

    #[test]
    fn role_parse_roundtrip() {
        for r in [Role::Reader, Role::Writer, Role::Owner] {
            assert_eq!(Role::parse(r.as_str()), Some(r));
        }
        assert_eq!(Role::parse("admin"), None);
    }

    #[test]
    fn wildcard_group_matches_any_provider() {
        let p = Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "github".into(),
            provider_user_id: "u1".into(),
            email: "a@example.test".into(),
            display_name: "A".into(),
            groups: vec![GroupRef::new(WILDCARD_PROVIDER, "auditors")],
        };
        assert!(p.in_group("github", "auditors"));
        assert!(p.in_group("google", "auditors"));
        assert!(!p.in_group("github", "other"));
    }

    #[test]
    fn provider_scoped_group_does_not_cross() {
        let p = Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "github".into(),
            provider_user_id: "u1".into(),
            email: "a@example.test".into(),
            display_name: "A".into(),
            groups: vec![GroupRef::new("github", "eng")],
        };
        assert!(p.in_group("github", "eng"));
        assert!(!p.in_group("google", "eng"));
    }

    #[test]
    fn bootstrap_sets_identity_key() {
        let u = User::bootstrap("github", "gh-42", "a@example.test", "A");
        assert_eq!(u.provider, "github");
        assert_eq!(u.provider_user_id, "gh-42");
        assert_eq!(u.created_at, u.last_login);
    }
}
