//! Webhook subscription and delivery entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingVerification,
    Active,
    Disabled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::PendingVerification => "pending_verification",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Disabled => "disabled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_verification" => Some(SubscriptionStatus::PendingVerification),
            "active" => Some(SubscriptionStatus::Active),
            "disabled" => Some(SubscriptionStatus::Disabled),
            _ => None,
        }
    }
}

/// A challenge-verified webhook subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub owner_user_uuid: Uuid,
    /// Restrict to events of one threat model when set.
    pub threat_model_id: Option<Uuid>,
    pub url: String,
    /// HMAC key. Stored encrypted; in memory only while signing.
    #[serde(default, skip_serializing)]
    pub secret: String,
    /// Dotted event kinds this subscription wants.
    pub events: Vec<String>,
    pub status: SubscriptionStatus,
    /// Opaque nonce the endpoint must echo to prove control of the URL.
    #[serde(default, skip_serializing)]
    pub challenge: String,
    pub challenges_sent: u32,
    pub publication_failures: u32,
    pub last_successful_use: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl WebhookSubscription {
    /// Whether this subscription matches an event of `kind` for
    /// `threat_model_id`.
    pub fn matches(&self, kind: &str, threat_model_id: Option<Uuid>) -> bool {
        if self.status != SubscriptionStatus::Active {
            return false;
        }
        if let Some(scope) = self.threat_model_id
            && threat_model_id != Some(scope)
        {
            return false;
        }
        self.events.iter().any(|e| e == kind)
    }
}

/// Delivery state machine. `Pending` and `Retry` are picked up by the
/// delivery worker; `Delivered` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    InFlight,
    Delivered,
    Retry,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::InFlight => "in_flight",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Retry => "retry",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryStatus::Pending),
            "in_flight" => Some(DeliveryStatus::InFlight),
            "delivered" => Some(DeliveryStatus::Delivered),
            "retry" => Some(DeliveryStatus::Retry),
            "failed" => Some(DeliveryStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Failed)
    }
}

/// One attempt-tracked (event, subscription) pair. The unit of the
/// at-least-once guarantee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_id: Uuid,
    pub event_kind: String,
    /// Canonical JSON body. The exact bytes sent are the HMAC input.
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(status: SubscriptionStatus, scope: Option<Uuid>) -> WebhookSubscription {
        let now = Utc::now();
        WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: scope,
            url: "https://example.test/hook".into(),
            secret: "s".into(),
            events: vec!["threat_model.updated".into()],
            status,
            challenge: "nonce".into(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        }
    }

    #[test]
    fn only_active_subscriptions_match() {
        let sub = subscription(SubscriptionStatus::PendingVerification, None);
        assert!(!sub.matches("threat_model.updated", None));
        let sub = subscription(SubscriptionStatus::Active, None);
        assert!(sub.matches("threat_model.updated", None));
        assert!(!sub.matches("diagram.updated", None));
    }

    #[test]
    fn scoped_subscription_filters_by_threat_model() {
        let tm = Uuid::new_v4();
        let sub = subscription(SubscriptionStatus::Active, Some(tm));
        assert!(sub.matches("threat_model.updated", Some(tm)));
        assert!(!sub.matches("threat_model.updated", Some(Uuid::new_v4())));
        assert!(!sub.matches("threat_model.updated", None));
    }

    #[test]
    fn secret_and_challenge_never_serialize() {
        let sub = subscription(SubscriptionStatus::Active, None);
        let json = serde_json::to_value(&sub).unwrap();
        assert!(json.get("secret").is_none());
        assert!(json.get("challenge").is_none());
    }

    #[test]
    fn terminal_delivery_states() {
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Retry.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::InFlight.is_terminal());
    }
}
