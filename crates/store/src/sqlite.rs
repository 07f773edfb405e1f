//! SQLite domain store.
//!
//! A single WAL-mode database file holds the whole entity graph. Schema
//! bootstrap is inline (`CREATE TABLE IF NOT EXISTS`); entity collections
//! that the relational model gains nothing from normalizing (grant lists,
//! cell arenas, event filters) are stored as JSON columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use tmi_core::addon::{AddonInvocation, AddonRegistration, InvocationStatus};
use tmi_core::diagram::{Cell, Diagram, DiagramKind};
use tmi_core::error::StoreError;
use tmi_core::event::{ChangeAction, ChangeRecord};
use tmi_core::identity::{GroupRef, Role, User, WILDCARD_PROVIDER};
use tmi_core::model::{Grant, ObjectKind, Subresource, SubresourcePayload, SubjectKind, ThreatModel};
use tmi_core::quota::Quota;
use tmi_core::store::DomainStore;
use tmi_core::webhook::{
    DeliveryStatus, SubscriptionStatus, WebhookDelivery, WebhookSubscription,
};

use crate::ChangeNotifier;

/// Pool sizing knobs, mirroring the config defaults.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub max_connections: u32,
    pub min_connections: u32,
    pub max_lifetime: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_connections: 25,
            min_connections: 5,
            max_lifetime: Duration::from_secs(300),
        }
    }
}

/// SQLite-backed [`DomainStore`].
pub struct SqliteStore {
    pool: SqlitePool,
    notifier: Option<ChangeNotifier>,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and bootstrap the schema.
    pub async fn new(url: &str, opts: PoolOptions) -> Result<Self, StoreError> {
        let connect = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", "ON");

        // A shared-memory database only exists per connection; cap the pool
        // at one so every query sees the same schema.
        let max = if url.contains(":memory:") {
            1
        } else {
            opts.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max)
            .min_connections(opts.min_connections.min(max))
            .max_lifetime(opts.max_lifetime)
            .connect_with(connect)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self {
            pool,
            notifier: None,
        };
        store.run_migrations().await?;
        info!(url, "SQLite domain store initialized");
        Ok(store)
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

    /// Bootstrap the schema.
    async fn run_migrations(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                internal_uuid     TEXT PRIMARY KEY,
                provider          TEXT NOT NULL,
                provider_user_id  TEXT NOT NULL,
                email             TEXT NOT NULL,
                display_name      TEXT NOT NULL,
                created_at        TEXT NOT NULL,
                last_login        TEXT NOT NULL,
                UNIQUE(provider, provider_user_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS group_members (
                provider    TEXT NOT NULL,
                group_name  TEXT NOT NULL,
                user_uuid   TEXT NOT NULL,
                PRIMARY KEY (provider, group_name, user_uuid)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS threat_models (
                id             TEXT PRIMARY KEY,
                owner_uuid     TEXT NOT NULL,
                owner_email    TEXT NOT NULL,
                name           TEXT NOT NULL,
                description    TEXT NOT NULL DEFAULT '',
                authorization  TEXT NOT NULL DEFAULT '[]',
                created_at     TEXT NOT NULL,
                modified_at    TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS diagrams (
                id               TEXT PRIMARY KEY,
                threat_model_id  TEXT NOT NULL,
                name             TEXT NOT NULL,
                kind             TEXT NOT NULL,
                cells            TEXT NOT NULL DEFAULT '[]',
                version          INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                modified_at      TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS subresources (
                id               TEXT PRIMARY KEY,
                threat_model_id  TEXT NOT NULL,
                kind             TEXT NOT NULL,
                payload          TEXT NOT NULL,
                created_at       TEXT NOT NULL,
                modified_at      TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhook_subscriptions (
                id                    TEXT PRIMARY KEY,
                owner_user_uuid       TEXT NOT NULL,
                threat_model_id       TEXT,
                url                   TEXT NOT NULL,
                secret                TEXT NOT NULL,
                events                TEXT NOT NULL DEFAULT '[]',
                status                TEXT NOT NULL,
                challenge             TEXT NOT NULL,
                challenges_sent       INTEGER NOT NULL DEFAULT 0,
                publication_failures  INTEGER NOT NULL DEFAULT 0,
                last_successful_use   TEXT,
                created_at            TEXT NOT NULL,
                modified_at           TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id               TEXT PRIMARY KEY,
                subscription_id  TEXT NOT NULL,
                event_id         TEXT NOT NULL,
                event_kind       TEXT NOT NULL,
                payload          TEXT NOT NULL,
                status           TEXT NOT NULL,
                attempts         INTEGER NOT NULL DEFAULT 0,
                next_retry_at    TEXT,
                last_error       TEXT,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL,
                UNIQUE(subscription_id, event_id)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS addons (
                id               TEXT PRIMARY KEY,
                name             TEXT NOT NULL,
                webhook_id       TEXT NOT NULL,
                description      TEXT NOT NULL DEFAULT '',
                icon             TEXT,
                objects          TEXT NOT NULL DEFAULT '[]',
                threat_model_id  TEXT,
                created_at       TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS addon_invocations (
                id                  TEXT PRIMARY KEY,
                addon_id            TEXT NOT NULL,
                invoker_user_uuid   TEXT NOT NULL,
                target_object_kind  TEXT NOT NULL,
                target_object_id    TEXT NOT NULL,
                payload             TEXT NOT NULL DEFAULT '',
                status              TEXT NOT NULL,
                status_percent      INTEGER NOT NULL DEFAULT 0,
                status_message      TEXT NOT NULL DEFAULT '',
                created_at          TEXT NOT NULL,
                status_updated_at   TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_overrides (
                user_uuid  TEXT PRIMARY KEY,
                quota      TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS administrators (
                user_uuid  TEXT PRIMARY KEY
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deny_list (
                pattern  TEXT PRIMARY KEY
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_diagrams_tm ON diagrams(threat_model_id)",
            "CREATE INDEX IF NOT EXISTS idx_subresources_tm ON subresources(threat_model_id)",
            "CREATE INDEX IF NOT EXISTS idx_deliveries_due
               ON webhook_deliveries(status, next_retry_at)",
            "CREATE INDEX IF NOT EXISTS idx_invocations_user
               ON addon_invocations(invoker_user_uuid)",
        ];

        for stmt in statements {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Migration(e.to_string()))?;
        }
        debug!("SQLite migrations complete");
        Ok(())
    }
}

// --- Row mapping helpers ---

fn storage(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Storage(format!("Corrupt uuid column: {e}")))
}

fn parse_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(s).map_err(|e| StoreError::Storage(format!("Corrupt JSON column: {e}")))
}

fn row_to_user(row: &sqlx::sqlite::SqliteRow) -> Result<User, StoreError> {
    Ok(User {
        internal_uuid: parse_uuid(row.get("internal_uuid"))?,
        provider: row.get("provider"),
        provider_user_id: row.get("provider_user_id"),
        email: row.get("email"),
        display_name: row.get("display_name"),
        created_at: row.get("created_at"),
        last_login: row.get("last_login"),
    })
}

fn row_to_threat_model(row: &sqlx::sqlite::SqliteRow) -> Result<ThreatModel, StoreError> {
    let grants: Vec<Grant> = parse_json(row.get("authorization"))?;
    Ok(ThreatModel {
        id: parse_uuid(row.get("id"))?,
        owner_uuid: parse_uuid(row.get("owner_uuid"))?,
        owner_email: row.get("owner_email"),
        name: row.get("name"),
        description: row.get("description"),
        authorization: grants,
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn row_to_diagram(row: &sqlx::sqlite::SqliteRow) -> Result<Diagram, StoreError> {
    let kind: String = row.get("kind");
    let kind: DiagramKind = serde_json::from_value(serde_json::Value::String(kind))
        .map_err(|e| StoreError::Storage(format!("Corrupt diagram kind: {e}")))?;
    let version: i64 = row.get("version");
    Ok(Diagram {
        id: parse_uuid(row.get("id"))?,
        threat_model_id: parse_uuid(row.get("threat_model_id"))?,
        name: row.get("name"),
        kind,
        cells: parse_json(row.get("cells"))?,
        version: version as u64,
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn diagram_kind_str(kind: DiagramKind) -> String {
    match serde_json::to_value(kind) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "data_flow".into(),
    }
}

fn row_to_subresource(row: &sqlx::sqlite::SqliteRow) -> Result<Subresource, StoreError> {
    let kind: String = row.get("kind");
    let kind = ObjectKind::parse(&kind)
        .ok_or_else(|| StoreError::Storage(format!("Corrupt subresource kind: {kind}")))?;
    Ok(Subresource {
        id: parse_uuid(row.get("id"))?,
        threat_model_id: parse_uuid(row.get("threat_model_id"))?,
        kind,
        payload: parse_json(row.get("payload"))?,
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn row_to_subscription(row: &sqlx::sqlite::SqliteRow) -> Result<WebhookSubscription, StoreError> {
    let status: String = row.get("status");
    let status = SubscriptionStatus::parse(&status)
        .ok_or_else(|| StoreError::Storage(format!("Corrupt subscription status: {status}")))?;
    let tm: Option<String> = row.get("threat_model_id");
    let challenges_sent: i64 = row.get("challenges_sent");
    let publication_failures: i64 = row.get("publication_failures");
    Ok(WebhookSubscription {
        id: parse_uuid(row.get("id"))?,
        owner_user_uuid: parse_uuid(row.get("owner_user_uuid"))?,
        threat_model_id: tm.as_deref().map(parse_uuid).transpose()?,
        url: row.get("url"),
        secret: row.get("secret"),
        events: parse_json(row.get("events"))?,
        status,
        challenge: row.get("challenge"),
        challenges_sent: challenges_sent as u32,
        publication_failures: publication_failures as u32,
        last_successful_use: row.get("last_successful_use"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    })
}

fn row_to_delivery(row: &sqlx::sqlite::SqliteRow) -> Result<WebhookDelivery, StoreError> {
    let status: String = row.get("status");
    let status = DeliveryStatus::parse(&status)
        .ok_or_else(|| StoreError::Storage(format!("Corrupt delivery status: {status}")))?;
    let attempts: i64 = row.get("attempts");
    Ok(WebhookDelivery {
        id: parse_uuid(row.get("id"))?,
        subscription_id: parse_uuid(row.get("subscription_id"))?,
        event_id: parse_uuid(row.get("event_id"))?,
        event_kind: row.get("event_kind"),
        payload: row.get("payload"),
        status,
        attempts: attempts as u32,
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_addon(row: &sqlx::sqlite::SqliteRow) -> Result<AddonRegistration, StoreError> {
    let tm: Option<String> = row.get("threat_model_id");
    Ok(AddonRegistration {
        id: parse_uuid(row.get("id"))?,
        name: row.get("name"),
        webhook_id: parse_uuid(row.get("webhook_id"))?,
        description: row.get("description"),
        icon: row.get("icon"),
        objects: parse_json(row.get("objects"))?,
        threat_model_id: tm.as_deref().map(parse_uuid).transpose()?,
        created_at: row.get("created_at"),
    })
}

fn row_to_invocation(row: &sqlx::sqlite::SqliteRow) -> Result<AddonInvocation, StoreError> {
    let status: String = row.get("status");
    let status = InvocationStatus::parse(&status)
        .ok_or_else(|| StoreError::Storage(format!("Corrupt invocation status: {status}")))?;
    let kind: String = row.get("target_object_kind");
    let kind = ObjectKind::parse(&kind)
        .ok_or_else(|| StoreError::Storage(format!("Corrupt target kind: {kind}")))?;
    let percent: i64 = row.get("status_percent");
    Ok(AddonInvocation {
        id: parse_uuid(row.get("id"))?,
        addon_id: parse_uuid(row.get("addon_id"))?,
        invoker_user_uuid: parse_uuid(row.get("invoker_user_uuid"))?,
        target_object_kind: kind,
        target_object_id: parse_uuid(row.get("target_object_id"))?,
        payload: row.get("payload"),
        status,
        status_percent: percent as u8,
        status_message: row.get("status_message"),
        created_at: row.get("created_at"),
        status_updated_at: row.get("status_updated_at"),
    })
}

#[async_trait]
impl DomainStore for SqliteStore {
    // --- Users & groups ---

    async fn create_user(&self, user: &User) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO users
                (internal_uuid, provider, provider_user_id, email, display_name,
                 created_at, last_login)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.internal_uuid.to_string())
        .bind(&user.provider)
        .bind(&user.provider_user_id)
        .bind(&user.email)
        .bind(&user.display_name)
        .bind(user.created_at)
        .bind(user.last_login)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateIdentity {
                    provider: user.provider.clone(),
                    provider_user_id: user.provider_user_id.clone(),
                })
            }
            Err(e) => Err(storage(e)),
        }
    }

    async fn user_by_id(&self, id: Uuid) -> Result<User, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE internal_uuid = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "user",
                id: id.to_string(),
            })?;
        row_to_user(&row)
    }

    async fn user_by_provider_id(
        &self,
        provider: &str,
        provider_user_id: &str,
    ) -> Result<Option<User>, StoreError> {
        let row = sqlx::query("SELECT * FROM users WHERE provider = ? AND provider_user_id = ?")
            .bind(provider)
            .bind(provider_user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn touch_last_login(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE users SET last_login = ? WHERE internal_uuid = ?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "user",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_user(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let mut records = Vec::new();
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let user_row = sqlx::query("SELECT * FROM users WHERE internal_uuid = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "user",
                id: id.to_string(),
            })?;
        let user = row_to_user(&user_row)?;

        // Owned threat models: transfer to the first other owner-roled user
        // grant in insertion order, else delete with cascade.
        let owned_rows = sqlx::query("SELECT * FROM threat_models WHERE owner_uuid = ?")
            .bind(id.to_string())
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;

        for row in &owned_rows {
            let mut tm = row_to_threat_model(row)?;
            let successor_email = tm
                .authorization
                .iter()
                .find(|g| {
                    g.role == Role::Owner
                        && g.subject_kind == SubjectKind::User
                        && g.subject != user.email
                })
                .map(|g| g.subject.clone());

            let successor = match successor_email {
                Some(email) => sqlx::query("SELECT * FROM users WHERE email = ? LIMIT 1")
                    .bind(&email)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(storage)?
                    .map(|r| row_to_user(&r))
                    .transpose()?,
                None => None,
            };

            match successor {
                Some(next) => {
                    tm.owner_uuid = next.internal_uuid;
                    tm.owner_email = next.email.clone();
                    tm.authorization.retain(|g| {
                        !(g.subject_kind == SubjectKind::User && g.subject == user.email)
                    });
                    tm.modified_at = Utc::now();
                    sqlx::query(
                        r#"
                        UPDATE threat_models
                        SET owner_uuid = ?, owner_email = ?, authorization = ?, modified_at = ?
                        WHERE id = ?
                        "#,
                    )
                    .bind(tm.owner_uuid.to_string())
                    .bind(&tm.owner_email)
                    .bind(serde_json::to_string(&tm.authorization).unwrap_or_default())
                    .bind(tm.modified_at)
                    .bind(tm.id.to_string())
                    .execute(&mut *tx)
                    .await
                    .map_err(storage)?;
                    records.push(
                        ChangeRecord::new(
                            ObjectKind::ThreatModel,
                            ChangeAction::Updated,
                            tm.id,
                            Some(tm.id),
                            actor,
                        )
                        .with_after(serde_json::to_value(&tm).unwrap_or_default()),
                    );
                }
                None => {
                    sqlx::query("DELETE FROM diagrams WHERE threat_model_id = ?")
                        .bind(tm.id.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage)?;
                    sqlx::query("DELETE FROM subresources WHERE threat_model_id = ?")
                        .bind(tm.id.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage)?;
                    sqlx::query("DELETE FROM threat_models WHERE id = ?")
                        .bind(tm.id.to_string())
                        .execute(&mut *tx)
                        .await
                        .map_err(storage)?;
                    records.push(ChangeRecord::new(
                        ObjectKind::ThreatModel,
                        ChangeAction::Deleted,
                        tm.id,
                        Some(tm.id),
                        actor,
                    ));
                }
            }
        }

        // Strip remaining non-owner grants held by the deleted user
        let remaining = sqlx::query("SELECT * FROM threat_models")
            .fetch_all(&mut *tx)
            .await
            .map_err(storage)?;
        for row in &remaining {
            let mut tm = row_to_threat_model(row)?;
            let before = tm.authorization.len();
            tm.authorization.retain(|g| {
                !(g.subject_kind == SubjectKind::User
                    && g.subject == user.email
                    && g.role != Role::Owner)
            });
            if tm.authorization.len() != before {
                sqlx::query(
                    "UPDATE threat_models SET authorization = ?, modified_at = ? WHERE id = ?",
                )
                .bind(serde_json::to_string(&tm.authorization).unwrap_or_default())
                .bind(Utc::now())
                .bind(tm.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            }
        }

        sqlx::query("DELETE FROM group_members WHERE user_uuid = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM users WHERE internal_uuid = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;

        tx.commit().await.map_err(storage)?;
        records.push(ChangeRecord::new(
            ObjectKind::User,
            ChangeAction::Deleted,
            id,
            None,
            actor,
        ));
        self.emit(records).await;
        Ok(())
    }

    async fn system_groups_for(&self, user_id: Uuid) -> Result<Vec<GroupRef>, StoreError> {
        let rows = sqlx::query(
            "SELECT provider, group_name FROM group_members WHERE user_uuid = ? AND provider = ?",
        )
        .bind(user_id.to_string())
        .bind(WILDCARD_PROVIDER)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        Ok(rows
            .iter()
            .map(|r| GroupRef::new(r.get::<String, _>("provider"), r.get::<String, _>("group_name")))
            .collect())
    }

    async fn add_group_member(&self, group: &GroupRef, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT OR IGNORE INTO group_members (provider, group_name, user_uuid) VALUES (?, ?, ?)",
        )
        .bind(&group.provider)
        .bind(&group.name)
        .bind(user_id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    // --- Threat models ---

    async fn create_threat_model(&self, tm: &ThreatModel, actor: Uuid) -> Result<(), StoreError> {
        if !tm.owner_invariant_holds() {
            return Err(StoreError::OwnerInvariant(tm.id.to_string()));
        }
        sqlx::query(
            r#"
            INSERT INTO threat_models
                (id, owner_uuid, owner_email, name, description, authorization,
                 created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(tm.id.to_string())
        .bind(tm.owner_uuid.to_string())
        .bind(&tm.owner_email)
        .bind(&tm.name)
        .bind(&tm.description)
        .bind(serde_json::to_string(&tm.authorization).unwrap_or_default())
        .bind(tm.created_at)
        .bind(tm.modified_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

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
        let row = sqlx::query("SELECT * FROM threat_models WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "threat_model",
                id: id.to_string(),
            })?;
        row_to_threat_model(&row)
    }

    async fn update_threat_model(&self, tm: &ThreatModel, actor: Uuid) -> Result<(), StoreError> {
        if !tm.owner_invariant_holds() {
            return Err(StoreError::OwnerInvariant(tm.id.to_string()));
        }
        let before = self.threat_model(tm.id).await?;
        let result = sqlx::query(
            r#"
            UPDATE threat_models
            SET owner_uuid = ?, owner_email = ?, name = ?, description = ?,
                authorization = ?, modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(tm.owner_uuid.to_string())
        .bind(&tm.owner_email)
        .bind(&tm.name)
        .bind(&tm.description)
        .bind(serde_json::to_string(&tm.authorization).unwrap_or_default())
        .bind(Utc::now())
        .bind(tm.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "threat_model",
                id: tm.id.to_string(),
            });
        }

        self.emit(vec![
            ChangeRecord::new(
                ObjectKind::ThreatModel,
                ChangeAction::Updated,
                tm.id,
                Some(tm.id),
                actor,
            )
            .with_before(serde_json::to_value(&before).unwrap_or_default())
            .with_after(serde_json::to_value(tm).unwrap_or_default()),
        ])
        .await;
        Ok(())
    }

    async fn delete_threat_model(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query("DELETE FROM threat_models WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "threat_model",
                id: id.to_string(),
            });
        }
        sqlx::query("DELETE FROM diagrams WHERE threat_model_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        sqlx::query("DELETE FROM subresources WHERE threat_model_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

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
        let rows = sqlx::query("SELECT * FROM threat_models ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_threat_model).collect()
    }

    // --- Diagrams ---

    async fn create_diagram(&self, diagram: &Diagram, actor: Uuid) -> Result<(), StoreError> {
        self.threat_model(diagram.threat_model_id).await?;
        sqlx::query(
            r#"
            INSERT INTO diagrams
                (id, threat_model_id, name, kind, cells, version, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(diagram.id.to_string())
        .bind(diagram.threat_model_id.to_string())
        .bind(&diagram.name)
        .bind(diagram_kind_str(diagram.kind))
        .bind(serde_json::to_string(&diagram.cells).unwrap_or_default())
        .bind(diagram.version as i64)
        .bind(diagram.created_at)
        .bind(diagram.modified_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

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
        let row = sqlx::query("SELECT * FROM diagrams WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "diagram",
                id: id.to_string(),
            })?;
        row_to_diagram(&row)
    }

    async fn diagrams_for(&self, threat_model_id: Uuid) -> Result<Vec<Diagram>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM diagrams WHERE threat_model_id = ? ORDER BY created_at",
        )
        .bind(threat_model_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_diagram).collect()
    }

    async fn update_diagram_meta(&self, diagram: &Diagram, actor: Uuid) -> Result<(), StoreError> {
        let existing = self.diagram(diagram.id).await?;
        sqlx::query("UPDATE diagrams SET name = ?, kind = ?, modified_at = ? WHERE id = ?")
            .bind(&diagram.name)
            .bind(diagram_kind_str(diagram.kind))
            .bind(Utc::now())
            .bind(diagram.id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Updated,
            diagram.id,
            Some(existing.threat_model_id),
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
        let mut tx = self.pool.begin().await.map_err(storage)?;

        let row = sqlx::query("SELECT * FROM diagrams WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "diagram",
                id: id.to_string(),
            })?;
        let mut diagram = row_to_diagram(&row)?;

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

        sqlx::query("UPDATE diagrams SET cells = ?, version = ?, modified_at = ? WHERE id = ?")
            .bind(serde_json::to_string(&diagram.cells).unwrap_or_default())
            .bind(new_version as i64)
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;

        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Updated,
            id,
            Some(diagram.threat_model_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn delete_diagram(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let existing = self.diagram(id).await?;
        sqlx::query("DELETE FROM diagrams WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        self.emit(vec![ChangeRecord::new(
            ObjectKind::Diagram,
            ChangeAction::Deleted,
            id,
            Some(existing.threat_model_id),
            actor,
        )])
        .await;
        Ok(())
    }

    // --- Subresources ---

    async fn create_subresource(&self, sub: &Subresource, actor: Uuid) -> Result<(), StoreError> {
        self.threat_model(sub.threat_model_id).await?;
        sqlx::query(
            r#"
            INSERT INTO subresources
                (id, threat_model_id, kind, payload, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sub.id.to_string())
        .bind(sub.threat_model_id.to_string())
        .bind(sub.kind.as_str())
        .bind(serde_json::to_string(&sub.payload).unwrap_or_default())
        .bind(sub.created_at)
        .bind(sub.modified_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

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
        let row = sqlx::query("SELECT * FROM subresources WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "subresource",
                id: id.to_string(),
            })?;
        row_to_subresource(&row)
    }

    async fn update_subresource(
        &self,
        id: Uuid,
        payload: &SubresourcePayload,
        actor: Uuid,
    ) -> Result<(), StoreError> {
        let existing = self.subresource(id).await?;
        if existing.kind != payload.object_kind() {
            return Err(StoreError::InvalidReference(format!(
                "subresource kind mismatch: {} vs {}",
                existing.kind,
                payload.object_kind()
            )));
        }
        sqlx::query("UPDATE subresources SET payload = ?, modified_at = ? WHERE id = ?")
            .bind(serde_json::to_string(payload).unwrap_or_default())
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        self.emit(vec![ChangeRecord::new(
            existing.kind,
            ChangeAction::Updated,
            id,
            Some(existing.threat_model_id),
            actor,
        )])
        .await;
        Ok(())
    }

    async fn delete_subresource(&self, id: Uuid, actor: Uuid) -> Result<(), StoreError> {
        let existing = self.subresource(id).await?;
        sqlx::query("DELETE FROM subresources WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;

        self.emit(vec![ChangeRecord::new(
            existing.kind,
            ChangeAction::Deleted,
            id,
            Some(existing.threat_model_id),
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
        let rows = match kind {
            Some(kind) => sqlx::query(
                "SELECT * FROM subresources WHERE threat_model_id = ? AND kind = ? ORDER BY created_at",
            )
            .bind(threat_model_id.to_string())
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?,
            None => sqlx::query(
                "SELECT * FROM subresources WHERE threat_model_id = ? ORDER BY created_at",
            )
            .bind(threat_model_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?,
        };
        rows.iter().map(row_to_subresource).collect()
    }

    // --- Webhook subscriptions ---

    async fn create_subscription(&self, sub: &WebhookSubscription) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO webhook_subscriptions
                (id, owner_user_uuid, threat_model_id, url, secret, events, status,
                 challenge, challenges_sent, publication_failures, last_successful_use,
                 created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(sub.id.to_string())
        .bind(sub.owner_user_uuid.to_string())
        .bind(sub.threat_model_id.map(|u| u.to_string()))
        .bind(&sub.url)
        .bind(&sub.secret)
        .bind(serde_json::to_string(&sub.events).unwrap_or_default())
        .bind(sub.status.as_str())
        .bind(&sub.challenge)
        .bind(sub.challenges_sent as i64)
        .bind(sub.publication_failures as i64)
        .bind(sub.last_successful_use)
        .bind(sub.created_at)
        .bind(sub.modified_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn subscription(&self, id: Uuid) -> Result<WebhookSubscription, StoreError> {
        let row = sqlx::query("SELECT * FROM webhook_subscriptions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "webhook_subscription",
                id: id.to_string(),
            })?;
        row_to_subscription(&row)
    }

    async fn subscriptions_for_owner(
        &self,
        owner: Uuid,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_subscriptions WHERE owner_user_uuid = ? ORDER BY created_at",
        )
        .bind(owner.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn subscriptions_with_status(
        &self,
        status: SubscriptionStatus,
    ) -> Result<Vec<WebhookSubscription>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM webhook_subscriptions WHERE status = ? ORDER BY created_at",
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_subscription).collect()
    }

    async fn set_subscription_status(
        &self,
        id: Uuid,
        status: SubscriptionStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_subscriptions SET status = ?, modified_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook_subscription",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn record_challenge_sent(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET challenges_sent = challenges_sent + 1, modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook_subscription",
                id: id.to_string(),
            });
        }
        let row = sqlx::query("SELECT challenges_sent FROM webhook_subscriptions WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        let count: i64 = row.get("challenges_sent");
        Ok(count as u32)
    }

    async fn record_publication_failure(&self, id: Uuid) -> Result<u32, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let result = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET publication_failures = publication_failures + 1, modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&mut *tx)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook_subscription",
                id: id.to_string(),
            });
        }
        let row =
            sqlx::query("SELECT publication_failures FROM webhook_subscriptions WHERE id = ?")
                .bind(id.to_string())
                .fetch_one(&mut *tx)
                .await
                .map_err(storage)?;
        tx.commit().await.map_err(storage)?;
        let count: i64 = row.get("publication_failures");
        Ok(count as u32)
    }

    async fn record_successful_use(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_subscriptions
            SET last_successful_use = ?, publication_failures = 0, modified_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook_subscription",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_subscription(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook_subscription",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn count_subscriptions(&self, owner: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM webhook_subscriptions WHERE owner_user_uuid = ?",
        )
        .bind(owner.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    // --- Webhook deliveries ---

    async fn insert_delivery(&self, delivery: &WebhookDelivery) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO webhook_deliveries
                (id, subscription_id, event_id, event_kind, payload, status, attempts,
                 next_retry_at, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(delivery.id.to_string())
        .bind(delivery.subscription_id.to_string())
        .bind(delivery.event_id.to_string())
        .bind(&delivery.event_kind)
        .bind(&delivery.payload)
        .bind(delivery.status.as_str())
        .bind(delivery.attempts as i64)
        .bind(delivery.next_retry_at)
        .bind(&delivery.last_error)
        .bind(delivery.created_at)
        .bind(delivery.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn claim_due_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        let rows = sqlx::query(
            r#"
            SELECT * FROM webhook_deliveries
            WHERE status IN ('pending', 'retry')
              AND (next_retry_at IS NULL OR next_retry_at <= ?)
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut delivery = row_to_delivery(row)?;
            sqlx::query("UPDATE webhook_deliveries SET status = 'in_flight', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(delivery.id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            delivery.status = DeliveryStatus::InFlight;
            delivery.updated_at = now;
            claimed.push(delivery);
        }
        tx.commit().await.map_err(storage)?;
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
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET status = ?, attempts = ?, next_retry_at = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(attempts as i64)
        .bind(next_retry_at)
        .bind(last_error)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "webhook_delivery",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delivery(&self, id: Uuid) -> Result<WebhookDelivery, StoreError> {
        let row = sqlx::query("SELECT * FROM webhook_deliveries WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "webhook_delivery",
                id: id.to_string(),
            })?;
        row_to_delivery(&row)
    }

    async fn prune_deliveries(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let expired = sqlx::query(
            r#"
            DELETE FROM webhook_deliveries
            WHERE status IN ('delivered', 'failed') AND updated_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        let orphaned = sqlx::query(
            r#"
            DELETE FROM webhook_deliveries
            WHERE subscription_id NOT IN (SELECT id FROM webhook_subscriptions)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(expired.rows_affected() + orphaned.rows_affected())
    }

    // --- Addons ---

    async fn create_addon(&self, addon: &AddonRegistration) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO addons
                (id, name, webhook_id, description, icon, objects, threat_model_id, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(addon.id.to_string())
        .bind(&addon.name)
        .bind(addon.webhook_id.to_string())
        .bind(&addon.description)
        .bind(&addon.icon)
        .bind(serde_json::to_string(&addon.objects).unwrap_or_default())
        .bind(addon.threat_model_id.map(|u| u.to_string()))
        .bind(addon.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn addon(&self, id: Uuid) -> Result<AddonRegistration, StoreError> {
        let row = sqlx::query("SELECT * FROM addons WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "addon",
                id: id.to_string(),
            })?;
        row_to_addon(&row)
    }

    async fn list_addons(&self) -> Result<Vec<AddonRegistration>, StoreError> {
        let rows = sqlx::query("SELECT * FROM addons ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_addon).collect()
    }

    async fn delete_addon(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM addons WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "addon",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // --- Addon invocations ---

    async fn create_invocation(&self, inv: &AddonInvocation) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO addon_invocations
                (id, addon_id, invoker_user_uuid, target_object_kind, target_object_id,
                 payload, status, status_percent, status_message, created_at, status_updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(inv.id.to_string())
        .bind(inv.addon_id.to_string())
        .bind(inv.invoker_user_uuid.to_string())
        .bind(inv.target_object_kind.as_str())
        .bind(inv.target_object_id.to_string())
        .bind(&inv.payload)
        .bind(inv.status.as_str())
        .bind(inv.status_percent as i64)
        .bind(&inv.status_message)
        .bind(inv.created_at)
        .bind(inv.status_updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn invocation(&self, id: Uuid) -> Result<AddonInvocation, StoreError> {
        let row = sqlx::query("SELECT * FROM addon_invocations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .ok_or(StoreError::NotFound {
                kind: "addon_invocation",
                id: id.to_string(),
            })?;
        row_to_invocation(&row)
    }

    async fn update_invocation_status(
        &self,
        id: Uuid,
        status: InvocationStatus,
        percent: u8,
        message: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE addon_invocations
            SET status = ?, status_percent = ?, status_message = ?, status_updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(percent.min(100) as i64)
        .bind(message)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                kind: "addon_invocation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn invocations_for_user(&self, user: Uuid) -> Result<Vec<AddonInvocation>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM addon_invocations WHERE invoker_user_uuid = ? ORDER BY created_at",
        )
        .bind(user.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter().map(row_to_invocation).collect()
    }

    async fn active_invocation_count(&self, user: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM addon_invocations
            WHERE invoker_user_uuid = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(user.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    async fn invocations_since(
        &self,
        user: Uuid,
        since: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM addon_invocations
            WHERE invoker_user_uuid = ? AND created_at >= ?
            "#,
        )
        .bind(user.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    async fn non_terminal_invocations_for_addon(&self, addon: Uuid) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS n FROM addon_invocations
            WHERE addon_id = ? AND status IN ('pending', 'in_progress')
            "#,
        )
        .bind(addon.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(storage)?;
        let n: i64 = row.get("n");
        Ok(n as usize)
    }

    async fn prune_invocations(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM addon_invocations WHERE created_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(result.rows_affected())
    }

    async fn expire_invocations(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE addon_invocations
            SET status = 'failed', status_message = 'expired', status_updated_at = ?
            WHERE status IN ('pending', 'in_progress') AND status_updated_at < ?
            "#,
        )
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(result.rows_affected())
    }

    // --- Quotas & administrators ---

    async fn quota_override(&self, user: Uuid) -> Result<Option<Quota>, StoreError> {
        let row = sqlx::query("SELECT quota FROM quota_overrides WHERE user_uuid = ?")
            .bind(user.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.map(|r| parse_json(r.get("quota"))).transpose()
    }

    async fn set_quota_override(&self, user: Uuid, quota: &Quota) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO quota_overrides (user_uuid, quota) VALUES (?, ?)
            ON CONFLICT(user_uuid) DO UPDATE SET quota = excluded.quota
            "#,
        )
        .bind(user.to_string())
        .bind(serde_json::to_string(quota).unwrap_or_default())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn is_admin(&self, user: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 AS x FROM administrators WHERE user_uuid = ?")
            .bind(user.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        Ok(row.is_some())
    }

    async fn grant_admin(&self, user: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO administrators (user_uuid) VALUES (?)")
            .bind(user.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn revoke_admin(&self, user: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM administrators WHERE user_uuid = ?")
            .bind(user.to_string())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    // --- Operator deny list ---

    async fn deny_list_entries(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query("SELECT pattern FROM deny_list ORDER BY pattern")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        Ok(rows.iter().map(|r| r.get("pattern")).collect())
    }

    async fn add_deny_list_entry(&self, pattern: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT OR IGNORE INTO deny_list (pattern) VALUES (?)")
            .bind(pattern)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn remove_deny_list_entry(&self, pattern: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM deny_list WHERE pattern = ?")
            .bind(pattern)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tmi_bus::InMemoryBus;
    use tmi_core::bus::EventBus;
    use tmi_core::event::DOMAIN_TOPIC;

    async fn store() -> (SqliteStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db", dir.path().display());
        let store = SqliteStore::new(&url, PoolOptions::default()).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db", dir.path().display());
        let s1 = SqliteStore::new(&url, PoolOptions::default()).await.unwrap();
        drop(s1);
        SqliteStore::new(&url, PoolOptions::default()).await.unwrap();
    }

    #[tokio::test]
    async fn user_round_trip_and_duplicate_identity() {
        let (store, _dir) = store().await;
        let user = User::bootstrap("github", "gh-1", "a@example.test", "A");
        store.create_user(&user).await.unwrap();

        let loaded = store.user_by_id(user.internal_uuid).await.unwrap();
        assert_eq!(loaded.email, "a@example.test");

        let mut dup = User::bootstrap("github", "gh-1", "other@example.test", "O");
        dup.internal_uuid = Uuid::new_v4();
        assert!(matches!(
            store.create_user(&dup).await,
            Err(StoreError::DuplicateIdentity { .. })
        ));

        let found = store.user_by_provider_id("github", "gh-1").await.unwrap();
        assert_eq!(found.unwrap().internal_uuid, user.internal_uuid);
    }

    #[tokio::test]
    async fn threat_model_round_trip_preserves_grants() {
        let (store, _dir) = store().await;
        let owner = User::bootstrap("github", "gh-1", "o@example.test", "O");
        store.create_user(&owner).await.unwrap();

        let mut tm = ThreatModel::new(owner.internal_uuid, &owner.email, "Payments");
        tm.authorization.push(Grant::user("w@example.test", Role::Writer));
        tm.authorization
            .push(Grant::group("github", "security", Role::Reader));
        store.create_threat_model(&tm, owner.internal_uuid).await.unwrap();

        let loaded = store.threat_model(tm.id).await.unwrap();
        assert_eq!(loaded.authorization.len(), 3);
        assert_eq!(loaded.authorization[1].subject, "w@example.test");
        assert_eq!(loaded.authorization[2].provider, "github");
    }

    #[tokio::test]
    async fn diagram_cells_version_gate() {
        let (store, _dir) = store().await;
        let owner = User::bootstrap("github", "gh-1", "o@example.test", "O");
        store.create_user(&owner).await.unwrap();
        let tm = ThreatModel::new(owner.internal_uuid, &owner.email, "TM");
        store.create_threat_model(&tm, owner.internal_uuid).await.unwrap();
        let d = Diagram::new(tm.id, "DFD", DiagramKind::DataFlow);
        store.create_diagram(&d, owner.internal_uuid).await.unwrap();

        let n1 = Uuid::new_v4();
        let cells = vec![Cell::node(n1, "process", Default::default())];
        store
            .update_diagram_cells(d.id, &cells, 0, 1, owner.internal_uuid)
            .await
            .unwrap();

        let loaded = store.diagram(d.id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.cells.len(), 1);

        let err = store
            .update_diagram_cells(d.id, &cells, 0, 2, owner.internal_uuid)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn mutations_publish_change_records() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}/test.db", dir.path().display());
        let bus = Arc::new(InMemoryBus::new(100));
        let store = SqliteStore::new(&url, PoolOptions::default())
            .await
            .unwrap()
            .with_notifier(crate::ChangeNotifier::new(bus.clone()));

        let owner = User::bootstrap("github", "gh-1", "o@example.test", "O");
        store.create_user(&owner).await.unwrap();
        let tm = ThreatModel::new(owner.internal_uuid, &owner.email, "TM");
        store.create_threat_model(&tm, owner.internal_uuid).await.unwrap();

        let records = bus
            .read(DOMAIN_TOPIC, "test", 10, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, "threat_model.created");
    }

    #[tokio::test]
    async fn delete_threat_model_cascades() {
        let (store, _dir) = store().await;
        let owner = User::bootstrap("github", "gh-1", "o@example.test", "O");
        store.create_user(&owner).await.unwrap();
        let tm = ThreatModel::new(owner.internal_uuid, &owner.email, "TM");
        store.create_threat_model(&tm, owner.internal_uuid).await.unwrap();
        let d = Diagram::new(tm.id, "DFD", DiagramKind::DataFlow);
        store.create_diagram(&d, owner.internal_uuid).await.unwrap();
        let sub = Subresource::new(
            tm.id,
            SubresourcePayload::Note {
                content: "check auth".into(),
            },
        );
        store.create_subresource(&sub, owner.internal_uuid).await.unwrap();

        store.delete_threat_model(tm.id, owner.internal_uuid).await.unwrap();
        assert!(store.diagram(d.id).await.is_err());
        assert!(store.subresource(sub.id).await.is_err());
    }

    #[tokio::test]
    async fn subscription_counters_round_trip() {
        let (store, _dir) = store().await;
        let now = Utc::now();
        let sub = WebhookSubscription {
            id: Uuid::new_v4(),
            owner_user_uuid: Uuid::new_v4(),
            threat_model_id: None,
            url: "https://example.test/hook".into(),
            secret: "ENC:v1:x:0:AAAA".into(),
            events: vec!["threat_model.updated".into()],
            status: SubscriptionStatus::PendingVerification,
            challenge: "nonce".into(),
            challenges_sent: 0,
            publication_failures: 0,
            last_successful_use: None,
            created_at: now,
            modified_at: now,
        };
        store.create_subscription(&sub).await.unwrap();

        assert_eq!(store.record_challenge_sent(sub.id).await.unwrap(), 1);
        assert_eq!(store.record_challenge_sent(sub.id).await.unwrap(), 2);
        assert_eq!(store.record_publication_failure(sub.id).await.unwrap(), 1);

        store
            .set_subscription_status(sub.id, SubscriptionStatus::Active)
            .await
            .unwrap();
        store.record_successful_use(sub.id).await.unwrap();

        let loaded = store.subscription(sub.id).await.unwrap();
        assert_eq!(loaded.status, SubscriptionStatus::Active);
        assert_eq!(loaded.publication_failures, 0);
        assert!(loaded.last_successful_use.is_some());
        assert_eq!(loaded.challenges_sent, 2);
    }

    #[tokio::test]
    async fn delivery_dedupe_and_claim() {
        let (store, _dir) = store().await;
        let now = Utc::now();
        let d = WebhookDelivery {
            id: Uuid::new_v4(),
            subscription_id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            event_kind: "e".into(),
            payload: "{}".into(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(store.insert_delivery(&d).await.unwrap());
        let dup = WebhookDelivery {
            id: Uuid::new_v4(),
            ..d.clone()
        };
        assert!(!store.insert_delivery(&dup).await.unwrap());

        let claimed = store.claim_due_deliveries(now, 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, DeliveryStatus::InFlight);
        assert!(store.claim_due_deliveries(now, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invocation_quota_queries() {
        let (store, _dir) = store().await;
        let user = Uuid::new_v4();
        let addon = Uuid::new_v4();
        let inv = AddonInvocation::new(addon, user, ObjectKind::Diagram, Uuid::new_v4(), "{}".into());
        store.create_invocation(&inv).await.unwrap();

        assert_eq!(store.active_invocation_count(user).await.unwrap(), 1);
        assert_eq!(
            store
                .invocations_since(user, Utc::now() - chrono::Duration::hours(1))
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store.non_terminal_invocations_for_addon(addon).await.unwrap(),
            1
        );

        store
            .update_invocation_status(inv.id, InvocationStatus::Completed, 100, "done")
            .await
            .unwrap();
        assert_eq!(store.active_invocation_count(user).await.unwrap(), 0);
        assert_eq!(
            store.non_terminal_invocations_for_addon(addon).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn admin_and_deny_list_round_trip() {
        let (store, _dir) = store().await;
        let user = Uuid::new_v4();
        assert!(!store.is_admin(user).await.unwrap());
        store.grant_admin(user).await.unwrap();
        assert!(store.is_admin(user).await.unwrap());
        store.revoke_admin(user).await.unwrap();
        assert!(!store.is_admin(user).await.unwrap());

        store.add_deny_list_entry("https://internal.corp/*").await.unwrap();
        assert_eq!(store.deny_list_entries().await.unwrap().len(), 1);
        store.remove_deny_list_entry("https://internal.corp/*").await.unwrap();
        assert!(store.deny_list_entries().await.unwrap().is_empty());
    }
}
