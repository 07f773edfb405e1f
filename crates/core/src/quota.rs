//! Per-user quotas and the sliding-window rate counter.
//!
//! Defaults are defined at the process level; explicit per-user overrides
//! persist in the domain store and take precedence.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-user caps. A zero value means "deny all" and is valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    /// Concurrent pending + in-progress addon invocations.
    #[serde(default = "default_active_invocations")]
    pub max_active_invocations: u32,
    /// Addon invocations per sliding hour.
    #[serde(default = "default_invocations_per_hour")]
    pub invocations_per_hour: u32,
    /// Concurrent webhook subscriptions.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions: u32,
    /// Webhook events delivered per sliding minute.
    #[serde(default = "default_events_per_minute")]
    pub events_per_minute: u32,
    /// Subscription-management requests per sliding minute.
    #[serde(default = "default_sub_per_minute")]
    pub sub_requests_per_minute: u32,
    /// Subscription-management requests per sliding day.
    #[serde(default = "default_sub_per_day")]
    pub sub_requests_per_day: u32,
}

fn default_active_invocations() -> u32 {
    1
}
fn default_invocations_per_hour() -> u32 {
    10
}
fn default_max_subscriptions() -> u32 {
    10
}
fn default_events_per_minute() -> u32 {
    120
}
fn default_sub_per_minute() -> u32 {
    30
}
fn default_sub_per_day() -> u32 {
    500
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            max_active_invocations: default_active_invocations(),
            invocations_per_hour: default_invocations_per_hour(),
            max_subscriptions: default_max_subscriptions(),
            events_per_minute: default_events_per_minute(),
            sub_requests_per_minute: default_sub_per_minute(),
            sub_requests_per_day: default_sub_per_day(),
        }
    }
}

/// Simple in-memory sliding-window rate counter.
///
/// Tracks event timestamps per key. Thread-safe via `std::sync::Mutex`
/// (non-async, held briefly).
pub struct RateWindow {
    window: Duration,
    entries: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record one event for `key` if the count within the window is below
    /// `cap`. Returns `true` when allowed.
    pub fn try_acquire(&self, key: &str, cap: u32) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        // Periodic cleanup: if map grows too large, evict stale entries
        if entries.len() > 10_000 {
            entries.retain(|_, stamps| {
                stamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let stamps = entries.entry(key.to_string()).or_default();
        stamps.retain(|t| now.duration_since(*t) < self.window);

        if stamps.len() >= cap as usize {
            return false;
        }
        stamps.push(now);
        true
    }

    /// Current count within the window without recording anything.
    pub fn count(&self, key: &str) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get_mut(key) {
            Some(stamps) => {
                stamps.retain(|t| now.duration_since(*t) < self.window);
                stamps.len()
            }
            None => 0,
        }
    }

    /// Seconds until the oldest event in the window expires. Used as the
    /// retry-after hint when a caller is rejected.
    pub fn retry_after_secs(&self, key: &str) -> u64 {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .and_then(|stamps| stamps.first())
            .map(|oldest| {
                let elapsed = now.duration_since(*oldest);
                self.window.saturating_sub(elapsed).as_secs().max(1)
            })
            .unwrap_or(1)
    }
}
