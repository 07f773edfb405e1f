//! Identity cache — read-heavy user resolution with a short TTL.
//!
//! Caches `internal_uuid → principal` with a 15-minute default TTL and an
//! index `(provider, provider_user_id) → internal_uuid`. The cache is
//! authoritative for short windows; group-membership revocation propagates
//! on the next TTL expiry. Callers that cannot tolerate the window (admin
//! demotion) bypass the cache and hit the store directly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

use tmi_core::identity::Principal;

/// Default TTL for cached identities.
pub const DEFAULT_TTL: Duration = Duration::from_secs(15 * 60);

struct Entry {
    principal: Principal,
    expires_at: Instant,
}

/// TTL cache over resolved principals.
pub struct IdentityCache {
    ttl: Duration,
    by_uuid: Mutex<HashMap<Uuid, Entry>>,
    by_provider_id: Mutex<HashMap<(String, String), Uuid>>,
}

impl IdentityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            by_uuid: Mutex::new(HashMap::new()),
            by_provider_id: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, principal: Principal) {
        let uuid = principal.internal_uuid;
        let key = (principal.provider.clone(), principal.provider_user_id.clone());
        self.by_provider_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, uuid);
        self.by_uuid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                uuid,
                Entry {
                    principal,
                    expires_at: Instant::now() + self.ttl,
                },
            );
    }

    pub fn get(&self, uuid: Uuid) -> Option<Principal> {
        let mut map = self.by_uuid.lock().unwrap_or_else(|e| e.into_inner());
        match map.get(&uuid) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.principal.clone()),
            Some(_) => {
                map.remove(&uuid);
                None
            }
            None => None,
        }
    }

    pub fn get_by_provider_id(&self, provider: &str, provider_user_id: &str) -> Option<Principal> {
        let uuid = {
            let index = self
                .by_provider_id
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            index
                .get(&(provider.to_string(), provider_user_id.to_string()))
                .copied()
        }?;
        self.get(uuid)
    }

    /// Drop a cached identity (e.g. after role/group changes that must not
    /// wait for the TTL window).
    pub fn invalidate(&self, uuid: Uuid) {
        self.by_uuid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&uuid);
    }

    pub fn len(&self) -> usize {
        self.by_uuid.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tmi_core::identity::GroupRef;

    fn principal() -> Principal {
        Principal {
            internal_uuid: Uuid::new_v4(),
            provider: "github".into(),
            provider_user_id: "gh-1".into(),
            email: "a@example.test".into(),
            display_name: "A".into(),
            groups: vec![GroupRef::new("github", "eng")],
        }
    }

    #[test]
    fn insert_and_get() {
        let cache = IdentityCache::default();
        let p = principal();
        let uuid = p.internal_uuid;
        cache.insert(p);
        assert_eq!(cache.get(uuid).unwrap().email, "a@example.test");
        assert!(
            cache
                .get_by_provider_id("github", "gh-1")
                .is_some_and(|p| p.internal_uuid == uuid)
        );
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = IdentityCache::new(Duration::from_millis(5));
        let p = principal();
        let uuid = p.internal_uuid;
        cache.insert(p);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(uuid).is_none());
        assert!(cache.get_by_provider_id("github", "gh-1").is_none());
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = IdentityCache::default();
        let p = principal();
        let uuid = p.internal_uuid;
        cache.insert(p);
        cache.invalidate(uuid);
        assert!(cache.get(uuid).is_none());
    }

    #[test]
    fn miss_returns_none() {
        let cache = IdentityCache::default();
        assert!(cache.get(Uuid::new_v4()).is_none());
        assert!(cache.get_by_provider_id("github", "nope").is_none());
    }
}
