//! Error types for the TMI domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant; every error collapses
//! to one of eight wire-level kinds via [`Error::kind`], which the gateway
//! maps to HTTP status codes.

use thiserror::Error;

/// The top-level error type for all TMI operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Authentication / authorization ---
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    // --- Domain store errors ---
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    // --- Event bus errors ---
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    // --- Collaboration engine errors ---
    #[error("Collaboration error: {0}")]
    Collab(#[from] CollabError),

    // --- Webhook subsystem errors ---
    #[error("Webhook error: {0}")]
    Webhook(#[from] WebhookError),

    // --- Addon subsystem errors ---
    #[error("Addon error: {0}")]
    Addon(#[from] AddonError),

    // --- Validation ---
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // --- Quotas ---
    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

/// The discriminated wire-level error tags.
///
/// Synchronous handlers translate these to HTTP status codes; the
/// collaboration engine translates them into `operation_rejected` reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Unauthenticated,
    Forbidden,
    NotFound,
    Conflict,
    InvalidArgument,
    RateLimited,
    Unavailable,
    Internal,
}

impl ErrorKind {
    /// Stable string tag carried in error response bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthenticated => "unauthenticated",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Internal => "internal",
        }
    }
}

impl Error {
    /// Collapse this error to its wire-level kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Auth(e) => e.kind(),
            Error::Store(e) => e.kind(),
            Error::Bus(_) => ErrorKind::Unavailable,
            Error::Collab(e) => e.kind(),
            Error::Webhook(e) => e.kind(),
            Error::Addon(e) => e.kind(),
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Serialization(_) => ErrorKind::InvalidArgument,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }
}

// --- Bounded context errors ---

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unknown principal: {0}")]
    UnknownPrincipal(String),

    #[error("Identity resolution unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AuthError::MissingCredentials | AuthError::InvalidToken => ErrorKind::Unauthenticated,
            AuthError::Forbidden(_) => ErrorKind::Forbidden,
            AuthError::UnknownPrincipal(_) => ErrorKind::Unauthenticated,
            AuthError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Version conflict on {kind} {id}: expected {expected}, found {found}")]
    VersionConflict {
        kind: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Duplicate identity ({provider}, {provider_user_id})")]
    DuplicateIdentity {
        provider: String,
        provider_user_id: String,
    },

    #[error("Owner invariant violated for threat model {0}")]
    OwnerInvariant(String),

    #[error("Invalid cell reference: {0}")]
    InvalidReference(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound { .. } => ErrorKind::NotFound,
            StoreError::VersionConflict { .. } => ErrorKind::Conflict,
            StoreError::DuplicateIdentity { .. } => ErrorKind::Conflict,
            StoreError::OwnerInvariant(_) => ErrorKind::InvalidArgument,
            StoreError::InvalidReference(_) => ErrorKind::InvalidArgument,
            StoreError::Storage(_) => ErrorKind::Unavailable,
            StoreError::Migration(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("Unknown consumer group: {0}")]
    UnknownGroup(String),

    #[error("Record {0} is not pending for this group")]
    NotPending(u64),

    #[error("Bus closed")]
    Closed,

    #[error("Bus storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("No active session for diagram {0}")]
    SessionNotFound(String),

    #[error("Session participant cap reached ({0})")]
    SessionFull(usize),

    #[error("User is not a participant of the session")]
    NotParticipant,

    #[error("Session role does not permit this message")]
    Forbidden,

    #[error("Diagram is locked for maintenance")]
    DiagramLocked,

    #[error("Session inbound queue is full")]
    QueueFull,

    #[error("Session closed: {0}")]
    Closed(String),
}

impl CollabError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollabError::SessionNotFound(_) => ErrorKind::NotFound,
            CollabError::SessionFull(_) => ErrorKind::RateLimited,
            CollabError::NotParticipant | CollabError::Forbidden => ErrorKind::Forbidden,
            CollabError::DiagramLocked => ErrorKind::Conflict,
            CollabError::QueueFull => ErrorKind::Unavailable,
            CollabError::Closed(_) => ErrorKind::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Subscription not found: {0}")]
    NotFound(String),

    #[error("Target URL is denied: {0}")]
    DeniedUrl(String),

    #[error("Subscription quota exceeded ({current}/{max})")]
    QuotaExceeded { current: usize, max: usize },

    #[error("Challenge verification failed for subscription {0}")]
    ChallengeFailed(String),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

impl WebhookError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::NotFound(_) => ErrorKind::NotFound,
            WebhookError::DeniedUrl(_) => ErrorKind::InvalidArgument,
            WebhookError::QuotaExceeded { .. } => ErrorKind::RateLimited,
            WebhookError::ChallengeFailed(_) => ErrorKind::Conflict,
            WebhookError::Delivery(_) => ErrorKind::Unavailable,
        }
    }
}

#[derive(Debug, Error)]
pub enum AddonError {
    #[error("Addon not found: {0}")]
    NotFound(String),

    #[error("Invocation not found: {0}")]
    InvocationNotFound(String),

    #[error("Referenced webhook subscription is not active")]
    WebhookInactive,

    #[error("Addon has {0} non-terminal invocations")]
    NonTerminalInvocations(usize),

    #[error("Invocation payload exceeds {max} bytes (got {got})")]
    PayloadTooLarge { max: usize, got: usize },

    #[error("Status callback signature is invalid")]
    InvalidSignature,

    #[error("Invocation {0} is already terminal")]
    AlreadyTerminal(String),
}

impl AddonError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AddonError::NotFound(_) | AddonError::InvocationNotFound(_) => ErrorKind::NotFound,
            AddonError::WebhookInactive => ErrorKind::InvalidArgument,
            AddonError::NonTerminalInvocations(_) => ErrorKind::Conflict,
            AddonError::PayloadTooLarge { .. } => ErrorKind::InvalidArgument,
            AddonError::InvalidSignature => ErrorKind::Unauthenticated,
            AddonError::AlreadyTerminal(_) => ErrorKind::Conflict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_not_found() {
        let err = Error::Store(StoreError::NotFound {
            kind: "diagram",
            id: "d-1".into(),
        });
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("d-1"));
    }

    #[test]
    fn version_conflict_maps_to_conflict() {
        let err = Error::Store(StoreError::VersionConflict {
            kind: "diagram",
            id: "d-1".into(),
            expected: 3,
            found: 5,
        });
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn rate_limited_carries_retry_hint() {
        let err = Error::RateLimited {
            retry_after_secs: 30,
        };
        assert_eq!(err.kind(), ErrorKind::RateLimited);
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn auth_errors_split_unauthenticated_and_forbidden() {
        assert_eq!(
            Error::Auth(AuthError::InvalidToken).kind(),
            ErrorKind::Unauthenticated
        );
        assert_eq!(
            Error::Auth(AuthError::Forbidden("no role".into())).kind(),
            ErrorKind::Forbidden
        );
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(ErrorKind::Unauthenticated.as_str(), "unauthenticated");
        assert_eq!(ErrorKind::Forbidden.as_str(), "forbidden");
        assert_eq!(ErrorKind::NotFound.as_str(), "not_found");
        assert_eq!(ErrorKind::Conflict.as_str(), "conflict");
        assert_eq!(ErrorKind::InvalidArgument.as_str(), "invalid_argument");
        assert_eq!(ErrorKind::RateLimited.as_str(), "rate_limited");
        assert_eq!(ErrorKind::Unavailable.as_str(), "unavailable");
        assert_eq!(ErrorKind::Internal.as_str(), "internal");
    }
}
