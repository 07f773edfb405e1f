//! Configuration loading, validation, and management for TMI.
//!
//! Loads configuration from `tmi.toml` (or the path in `TMI_CONFIG`) with
//! environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tmi_core::Quota;

/// The root configuration structure.
///
/// Maps directly to `tmi.toml`.
#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// HTTP/WebSocket server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Relational store settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Event bus settings
    #[serde(default)]
    pub bus: BusConfig,

    /// Collaboration engine tuning
    #[serde(default)]
    pub collab: CollabConfig,

    /// Webhook subsystem tuning
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Addon subsystem tuning
    #[serde(default)]
    pub addons: AddonConfig,

    /// Process-level default quotas
    #[serde(default)]
    pub quotas: Quota,

    /// Secret-at-rest encryption keys
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Static bearer-token principals (development / test identity source)
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Request body limit in bytes.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Allowed CORS origins. Empty = same-origin only.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Per-client requests per minute on the REST surface.
    #[serde(default = "default_rest_rate")]
    pub rest_requests_per_minute: u32,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8080
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_rest_rate() -> u32 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            cors_origins: Vec::new(),
            rest_requests_per_minute: default_rest_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sqlx connection URL, e.g. `sqlite://tmi.db`.
    #[serde(default = "default_database_url")]
    pub url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Maximum connection lifetime in seconds.
    #[serde(default = "default_max_lifetime")]
    pub max_lifetime_secs: u64,
}

fn default_database_url() -> String {
    "sqlite://tmi.db".into()
}
fn default_max_connections() -> u32 {
    25
}
fn default_min_connections() -> u32 {
    5
}
fn default_max_lifetime() -> u64 {
    300
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            max_lifetime_secs: default_max_lifetime(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Maximum retained records per topic; oldest are trimmed first.
    #[serde(default = "default_bus_cap")]
    pub max_len: usize,

    /// Redelivery window for unacknowledged records, in seconds.
    #[serde(default = "default_visibility")]
    pub visibility_secs: u64,
}

fn default_bus_cap() -> usize {
    10_000
}
fn default_visibility() -> u64 {
    30
}

impl BusConfig {
    pub fn visibility(&self) -> Duration {
        Duration::from_secs(self.visibility_secs)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_len: default_bus_cap(),
            visibility_secs: default_visibility(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollabConfig {
    /// Participant cap per session.
    #[serde(default = "default_max_participants")]
    pub max_participants: usize,

    /// Bounded per-session inbound queue length.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,

    /// Bounded per-connection outbound queue length.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,

    /// Staleness tolerance window W for base versions. 0 = strict.
    #[serde(default)]
    pub stale_tolerance: u64,

    /// Persist after every K accepted operations. 0 = end-of-session only.
    #[serde(default)]
    pub checkpoint_every: u64,

    /// Cursor fan-out coalescing window in milliseconds.
    #[serde(default = "default_cursor_window")]
    pub cursor_coalesce_ms: u64,

    /// Minutes without operations before an idle warning is emitted.
    #[serde(default = "default_idle_warning")]
    pub idle_warning_minutes: u64,

    /// Grace minutes after the warning before the session ends.
    #[serde(default = "default_idle_grace")]
    pub idle_grace_minutes: u64,

    /// Remembered operation ids per session (idempotency LRU).
    #[serde(default = "default_op_lru")]
    pub processed_op_cap: usize,

    /// End-of-session persistence retry attempts.
    #[serde(default = "default_persist_retries")]
    pub persist_retry_max: u32,

    /// Bounded grace period for shutdown drain, in seconds.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_max_participants() -> usize {
    50
}
fn default_inbound_queue() -> usize {
    256
}
fn default_outbound_queue() -> usize {
    64
}
fn default_cursor_window() -> u64 {
    50
}
fn default_idle_warning() -> u64 {
    15
}
fn default_idle_grace() -> u64 {
    5
}
fn default_op_lru() -> usize {
    512
}
fn default_persist_retries() -> u32 {
    5
}
fn default_shutdown_grace() -> u64 {
    10
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            max_participants: default_max_participants(),
            inbound_queue: default_inbound_queue(),
            outbound_queue: default_outbound_queue(),
            stale_tolerance: 0,
            checkpoint_every: 0,
            cursor_coalesce_ms: default_cursor_window(),
            idle_warning_minutes: default_idle_warning(),
            idle_grace_minutes: default_idle_grace(),
            processed_op_cap: default_op_lru(),
            persist_retry_max: default_persist_retries(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Outbound HTTP timeout in seconds.
    #[serde(default = "default_http_timeout")]
    pub request_timeout_secs: u64,

    /// Attempts before a delivery is marked failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Exponential backoff base in seconds.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    /// Backoff ceiling in seconds.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,

    /// Delivery worker pool size.
    #[serde(default = "default_deliverers")]
    pub deliverer_pool: usize,

    /// Terminal delivery retention in days.
    #[serde(default = "default_delivery_retention")]
    pub delivery_retention_days: u32,

    /// Seconds between challenge attempts for one subscription.
    #[serde(default = "default_challenge_interval")]
    pub challenge_interval_secs: u64,

    /// Challenge attempts before a subscription is disabled.
    #[serde(default = "default_challenge_cap")]
    pub challenge_cap: u32,

    /// Publication failures before a subscription is auto-disabled.
    #[serde(default = "default_failure_threshold")]
    pub auto_disable_failures: u32,

    /// Operator-configured deny patterns (globs) joined with the built-ins.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

fn default_http_timeout() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    6
}
fn default_backoff_base() -> u64 {
    5
}
fn default_backoff_cap() -> u64 {
    3600
}
fn default_deliverers() -> usize {
    10
}
fn default_delivery_retention() -> u32 {
    30
}
fn default_challenge_interval() -> u64 {
    30
}
fn default_challenge_cap() -> u32 {
    10
}
fn default_failure_threshold() -> u32 {
    20
}

impl WebhookConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_http_timeout(),
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            deliverer_pool: default_deliverers(),
            delivery_retention_days: default_delivery_retention(),
            challenge_interval_secs: default_challenge_interval(),
            challenge_cap: default_challenge_cap(),
            auto_disable_failures: default_failure_threshold(),
            deny_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonConfig {
    /// Invocation record retention in days.
    #[serde(default = "default_invocation_retention")]
    pub invocation_retention_days: u32,

    /// Addon worker pool size.
    #[serde(default = "default_addon_workers")]
    pub worker_pool: usize,

    /// Minutes a non-terminal invocation may live before expiring.
    #[serde(default = "default_callback_lifetime")]
    pub callback_lifetime_minutes: u64,

    /// Externally reachable base URL used to build callback URLs.
    #[serde(default = "default_public_base_url")]
    pub public_base_url: String,
}

fn default_invocation_retention() -> u32 {
    7
}
fn default_addon_workers() -> usize {
    2
}
fn default_callback_lifetime() -> u64 {
    15
}
fn default_public_base_url() -> String {
    "http://127.0.0.1:8080".into()
}

impl Default for AddonConfig {
    fn default() -> Self {
        Self {
            invocation_retention_days: default_invocation_retention(),
            worker_pool: default_addon_workers(),
            callback_lifetime_minutes: default_callback_lifetime(),
            public_base_url: default_public_base_url(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct SecretsConfig {
    /// Passphrase for the AES-256-GCM envelope key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,

    /// Previous-key slot: decrypts old rows during rotation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_key: Option<String>,
}

/// A statically configured principal for the bearer-token verifier.
#[derive(Clone, Serialize, Deserialize)]
pub struct StaticPrincipal {
    pub token: String,
    pub provider: String,
    pub provider_user_id: String,
    pub email: String,
    #[serde(default)]
    pub display_name: String,
    /// `(provider, group)` memberships as `provider:name` strings.
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub static_principals: Vec<StaticPrincipal>,
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for SecretsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretsConfig")
            .field("encryption_key", &redact(&self.encryption_key))
            .field("previous_key", &redact(&self.previous_key))
            .finish()
    }
}

impl std::fmt::Debug for StaticPrincipal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticPrincipal")
            .field("token", &"[REDACTED]")
            .field("provider", &self.provider)
            .field("email", &self.email)
            .field("admin", &self.admin)
            .finish()
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("static_principals", &self.static_principals)
            .finish()
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("server", &self.server)
            .field("database", &self.database)
            .field("bus", &self.bus)
            .field("collab", &self.collab)
            .field("webhooks", &self.webhooks)
            .field("addons", &self.addons)
            .field("quotas", &self.quotas)
            .field("secrets", &self.secrets)
            .field("auth", &self.auth)
            .finish()
    }
}

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// Load config from `TMI_CONFIG` or `./tmi.toml`, then apply
    /// environment variable overrides (highest priority).
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("TMI_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("tmi.toml"));
        let mut config = Self::load_from(&path)?;

        if let Ok(url) = std::env::var("TMI_DATABASE_URL") {
            config.database.url = url;
        }
        if let Ok(host) = std::env::var("TMI_HOST") {
            config.server.host = host;
        }
        if let Ok(port) = std::env::var("TMI_PORT") {
            config.server.port = port
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("TMI_PORT is not a port: {port}")))?;
        }
        if let Ok(key) = std::env::var("TMI_ENCRYPTION_KEY") {
            config.secrets.encryption_key = Some(key);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path. Missing file = defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "database.max_connections must be at least 1".into(),
            ));
        }
        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigError::Invalid(
                "database.min_connections exceeds max_connections".into(),
            ));
        }
        if self.collab.max_participants == 0 {
            return Err(ConfigError::Invalid(
                "collab.max_participants must be at least 1".into(),
            ));
        }
        if self.webhooks.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "webhooks.max_attempts must be at least 1".into(),
            ));
        }
        if self.webhooks.backoff_base_secs == 0 {
            return Err(ConfigError::Invalid(
                "webhooks.backoff_base_secs must be at least 1".into(),
            ));
        }
        if self.bus.max_len == 0 {
            return Err(ConfigError::Invalid("bus.max_len must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.database.max_connections, 25);
        assert_eq!(config.database.min_connections, 5);
        assert_eq!(config.database.max_lifetime_secs, 300);
        assert_eq!(config.webhooks.deliverer_pool, 10);
        assert_eq!(config.collab.stale_tolerance, 0);
        assert_eq!(config.collab.checkpoint_every, 0);
    }

    #[test]
    fn parses_partial_toml_with_defaults() {
        let toml_str = r#"
            [server]
            port = 9090

            [webhooks]
            max_attempts = 3
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.webhooks.max_attempts, 3);
        assert_eq!(config.webhooks.challenge_cap, 10);
    }

    #[test]
    fn invalid_pool_shape_is_rejected() {
        let mut config = AppConfig::default();
        config.database.min_connections = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/tmi.toml")).unwrap();
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut config = AppConfig::default();
        config.secrets.encryption_key = Some("super-secret".into());
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn static_principal_groups_parse() {
        let toml_str = r#"
            [[auth.static_principals]]
            token = "t-1"
            provider = "github"
            provider_user_id = "u-1"
            email = "a@example.test"
            groups = ["github:eng", "*:auditors"]
            admin = true
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.auth.static_principals.len(), 1);
        assert!(config.auth.static_principals[0].admin);
    }
}
