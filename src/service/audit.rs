//! Audit recorder
//!
//! Audit rows are written in the same transaction as the mutation they
//! describe. A failed audit write fails the enclosing operation.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;
use std::sync::Arc;

use crate::data::{AuditEntry, AuditStatus, Database, User, now_timestamp, timestamp};
use crate::error::StoreError;
use crate::metrics::AUDIT_WRITES_TOTAL;

/// Area of the system an audit entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditCategory {
    Content,
    Tag,
    Series,
    User,
    Token,
    Webhook,
    Media,
    Settings,
    System,
}

impl AuditCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditCategory::Content => "content",
            AuditCategory::Tag => "tag",
            AuditCategory::Series => "series",
            AuditCategory::User => "user",
            AuditCategory::Token => "token",
            AuditCategory::Webhook => "webhook",
            AuditCategory::Media => "media",
            AuditCategory::Settings => "settings",
            AuditCategory::System => "system",
        }
    }
}

/// Identity of whoever performs an operation, captured at action time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub role: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Actor {
    /// Actor for periodic jobs and start-up work.
    pub fn system() -> Self {
        Self {
            username: Some("system".to_string()),
            role: Some("system".to_string()),
            ..Self::default()
        }
    }

    pub fn user(user: &User) -> Self {
        Self {
            user_id: Some(user.id),
            username: Some(user.username.clone()),
            role: Some(user.role.as_str().to_string()),
            ..Self::default()
        }
    }

    pub fn with_request(mut self, ip_address: Option<String>, user_agent: Option<String>) -> Self {
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

/// Audit entry under construction.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub action: String,
    pub category: AuditCategory,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub entity_title: Option<String>,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub changes: Option<Value>,
    pub metadata: Option<Value>,
}

impl AuditDraft {
    pub fn new(action: impl Into<String>, category: AuditCategory) -> Self {
        Self {
            action: action.into(),
            category,
            entity_type: None,
            entity_id: None,
            entity_title: None,
            status: AuditStatus::Success,
            error_message: None,
            changes: None,
            metadata: None,
        }
    }

    pub fn entity(mut self, entity_type: &str, id: i64, title: Option<&str>) -> Self {
        self.entity_type = Some(entity_type.to_string());
        self.entity_id = Some(id);
        self.entity_title = title.map(str::to_string);
        self
    }

    /// Structured diff, typically `{field: {from, to}}`.
    pub fn changes(mut self, changes: Value) -> Self {
        self.changes = Some(changes);
        self
    }

    /// Add one key to the metadata object.
    pub fn metadata_value(mut self, key: &str, value: Value) -> Self {
        let metadata = self
            .metadata
            .get_or_insert_with(|| Value::Object(Default::default()));
        if let Value::Object(map) = metadata {
            map.insert(key.to_string(), value);
        }
        self
    }

    pub fn failure(mut self, error: &str) -> Self {
        self.status = AuditStatus::Failure;
        self.error_message = Some(error.to_string());
        self
    }
}

/// Query filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub user_id: Option<i64>,
    pub category: Option<AuditCategory>,
    pub action: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub status: Option<AuditStatus>,
    /// Inclusive lower bound, canonical timestamp text
    pub since: Option<String>,
    /// Exclusive upper bound, canonical timestamp text
    pub until: Option<String>,
}

const FILTER_CLAUSE: &str = "(?1 IS NULL OR user_id = ?1) \
     AND (?2 IS NULL OR category = ?2) \
     AND (?3 IS NULL OR action = ?3) \
     AND (?4 IS NULL OR entity_type = ?4) \
     AND (?5 IS NULL OR entity_id = ?5) \
     AND (?6 IS NULL OR status = ?6) \
     AND (?7 IS NULL OR timestamp >= ?7) \
     AND (?8 IS NULL OR timestamp < ?8)";

/// Append an audit entry inside the caller's transaction.
///
/// Any failure is reported as [`StoreError::AuditWrite`] so the caller's
/// transaction is abandoned with it.
pub async fn record(
    conn: &mut SqliteConnection,
    actor: &Actor,
    draft: &AuditDraft,
) -> Result<i64, StoreError> {
    let encode = |value: &Option<Value>| {
        value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::AuditWrite(e.to_string()))
    };
    let changes = encode(&draft.changes)?;
    let metadata = encode(&draft.metadata)?;

    let status = match draft.status {
        AuditStatus::Success => "success",
        AuditStatus::Failure => "failure",
    };

    let result = sqlx::query(
        r#"
        INSERT INTO audit_logs (
            timestamp, user_id, username, user_role, action, category,
            entity_type, entity_id, entity_title, ip_address, user_agent,
            status, error_message, changes, metadata
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(now_timestamp())
    .bind(actor.user_id)
    .bind(&actor.username)
    .bind(&actor.role)
    .bind(&draft.action)
    .bind(draft.category.as_str())
    .bind(&draft.entity_type)
    .bind(draft.entity_id)
    .bind(&draft.entity_title)
    .bind(&actor.ip_address)
    .bind(&actor.user_agent)
    .bind(status)
    .bind(&draft.error_message)
    .bind(changes)
    .bind(metadata)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(done) => {
            AUDIT_WRITES_TOTAL.with_label_values(&[status]).inc();
            Ok(done.last_insert_rowid())
        }
        Err(error) => {
            AUDIT_WRITES_TOTAL.with_label_values(&["error"]).inc();
            tracing::error!(
                %error,
                action = %draft.action,
                category = draft.category.as_str(),
                "Audit write failed"
            );
            Err(StoreError::AuditWrite(error.to_string()))
        }
    }
}

/// Audit log queries and out-of-band writes.
pub struct AuditLog {
    db: Arc<Database>,
}

impl AuditLog {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record an entry in its own transaction, typically the failure of
    /// a primary action that was itself rolled back.
    pub async fn record_standalone(
        &self,
        actor: &Actor,
        draft: &AuditDraft,
    ) -> Result<i64, StoreError> {
        let mut tx = self
            .db
            .begin_write()
            .await
            .map_err(|e| StoreError::AuditWrite(e.to_string()))?;
        let id = record(tx.conn(), actor, draft).await?;
        tx.commit()
            .await
            .map_err(|e| StoreError::AuditWrite(e.to_string()))?;
        Ok(id)
    }

    /// Entries matching `filter`, newest first.
    pub async fn list(
        &self,
        filter: &AuditFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let sql = format!(
            "SELECT * FROM audit_logs WHERE {FILTER_CLAUSE} ORDER BY id DESC LIMIT ?9 OFFSET ?10"
        );
        let entries = bind_filter(sqlx::query_as::<_, AuditEntry>(&sql), filter)
            .bind(limit)
            .bind(offset)
            .fetch_all(self.db.pool())
            .await?;
        Ok(entries)
    }

    pub async fn count(&self, filter: &AuditFilter) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM audit_logs WHERE {FILTER_CLAUSE}");
        let count = bind_filter_scalar(sqlx::query_scalar::<_, i64>(&sql), filter)
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    pub async fn get(&self, id: i64) -> Result<Option<AuditEntry>, StoreError> {
        let entry = sqlx::query_as::<_, AuditEntry>("SELECT * FROM audit_logs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(entry)
    }

    /// Dashboard counts: totals, today's activity and the last `days` of
    /// failures and actions.
    pub async fn summary(&self, days: u32, now: DateTime<Utc>) -> Result<AuditSummary, StoreError> {
        let cutoff = timestamp(now - Duration::days(i64::from(days)));
        let midnight = now
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| StoreError::Validation(format!("invalid date {now}")))?;
        let today = timestamp(Utc.from_utc_datetime(&midnight));
        let pool = self.db.pool();

        let total_events = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM audit_logs")
            .fetch_one(pool)
            .await?;

        let events_today =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM audit_logs WHERE timestamp >= ?")
                .bind(&today)
                .fetch_one(pool)
                .await?;

        let failed_events = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM audit_logs WHERE status = 'failure' AND timestamp >= ?",
        )
        .bind(&cutoff)
        .fetch_one(pool)
        .await?;

        let active_users_today = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(DISTINCT user_id) FROM audit_logs \
             WHERE user_id IS NOT NULL AND timestamp >= ?",
        )
        .bind(&today)
        .fetch_one(pool)
        .await?;

        let recent_failures = sqlx::query_as::<_, AuditEntry>(
            "SELECT * FROM audit_logs WHERE status = 'failure' ORDER BY id DESC LIMIT 5",
        )
        .fetch_all(pool)
        .await?;

        let actions = sqlx::query_as::<_, ActionCount>(
            r#"
            SELECT action, COUNT(*) AS count
            FROM audit_logs
            WHERE timestamp >= ?
            GROUP BY action
            ORDER BY count DESC, action
            LIMIT 10
            "#,
        )
        .bind(&cutoff)
        .fetch_all(pool)
        .await?;

        let categories = sqlx::query_as::<_, CategoryCount>(
            r#"
            SELECT category, COUNT(*) AS count
            FROM audit_logs
            WHERE timestamp >= ?
            GROUP BY category
            ORDER BY count DESC, category
            "#,
        )
        .bind(&cutoff)
        .fetch_all(pool)
        .await?;

        Ok(AuditSummary {
            total_events,
            events_today,
            failed_events,
            active_users_today,
            recent_failures,
            actions,
            categories,
        })
    }

    /// Render up to [`EXPORT_LIMIT`] matching entries, newest first.
    pub async fn export(
        &self,
        filter: &AuditFilter,
        format: ExportFormat,
    ) -> Result<String, StoreError> {
        let entries = self.list(filter, EXPORT_LIMIT, 0).await?;

        match format {
            ExportFormat::Json => serde_json::to_string_pretty(&entries)
                .map_err(|e| StoreError::Internal(e.into())),
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer
                    .write_record(CSV_HEADER)
                    .map_err(|e| StoreError::Internal(e.into()))?;
                for entry in &entries {
                    writer
                        .write_record([
                            timestamp(entry.timestamp),
                            entry.username.clone().unwrap_or_default(),
                            entry.action.clone(),
                            entry.category.clone(),
                            entry.entity_type.clone().unwrap_or_default(),
                            entry.entity_id.map(|id| id.to_string()).unwrap_or_default(),
                            entry.entity_title.clone().unwrap_or_default(),
                            status_text(Some(entry.status)).unwrap_or_default().to_string(),
                            entry.ip_address.clone().unwrap_or_default(),
                        ])
                        .map_err(|e| StoreError::Internal(e.into()))?;
                }
                let bytes = writer
                    .into_inner()
                    .map_err(|e| StoreError::Internal(anyhow::anyhow!(e.to_string())))?;
                String::from_utf8(bytes).map_err(|e| StoreError::Internal(e.into()))
            }
        }
    }

    /// Users that appear in the log, by the username recorded at the time.
    pub async fn users(&self) -> Result<Vec<(i64, String)>, StoreError> {
        let users = sqlx::query_as::<_, (i64, String)>(
            r#"
            SELECT DISTINCT user_id, username
            FROM audit_logs
            WHERE user_id IS NOT NULL AND username IS NOT NULL
            ORDER BY username, user_id
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(users)
    }
}

/// Most entries a single export renders.
pub const EXPORT_LIMIT: i64 = 10_000;

const CSV_HEADER: [&str; 9] = [
    "timestamp",
    "user",
    "action",
    "category",
    "entity_type",
    "entity_id",
    "entity_title",
    "status",
    "ip_address",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ActionCount {
    pub action: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CategoryCount {
    pub category: String,
    pub count: i64,
}

/// Result of [`AuditLog::summary`].
#[derive(Debug, Clone, Serialize)]
pub struct AuditSummary {
    pub total_events: i64,
    pub events_today: i64,
    /// Within the summary window
    pub failed_events: i64,
    pub active_users_today: i64,
    /// Five newest failures, regardless of the window
    pub recent_failures: Vec<AuditEntry>,
    /// Ten most frequent actions in the window
    pub actions: Vec<ActionCount>,
    pub categories: Vec<CategoryCount>,
}

type AuditQuery<'q> = sqlx::query::QueryAs<
    'q,
    sqlx::Sqlite,
    AuditEntry,
    sqlx::sqlite::SqliteArguments<'q>,
>;

type CountQuery<'q> =
    sqlx::query::QueryScalar<'q, sqlx::Sqlite, i64, sqlx::sqlite::SqliteArguments<'q>>;

fn status_text(status: Option<AuditStatus>) -> Option<&'static str> {
    status.map(|s| match s {
        AuditStatus::Success => "success",
        AuditStatus::Failure => "failure",
    })
}

fn bind_filter<'q>(query: AuditQuery<'q>, filter: &'q AuditFilter) -> AuditQuery<'q> {
    query
        .bind(filter.user_id)
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.action.as_deref())
        .bind(filter.entity_type.as_deref())
        .bind(filter.entity_id)
        .bind(status_text(filter.status))
        .bind(filter.since.as_deref())
        .bind(filter.until.as_deref())
}

fn bind_filter_scalar<'q>(query: CountQuery<'q>, filter: &'q AuditFilter) -> CountQuery<'q> {
    query
        .bind(filter.user_id)
        .bind(filter.category.map(|c| c.as_str()))
        .bind(filter.action.as_deref())
        .bind(filter.entity_type.as_deref())
        .bind(filter.entity_id)
        .bind(status_text(filter.status))
        .bind(filter.since.as_deref())
        .bind(filter.until.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn draft_failure_sets_status_and_message() {
        let draft = AuditDraft::new("publish", AuditCategory::Content)
            .entity("content", 7, Some("Hello"))
            .failure("permission denied");
        assert_eq!(draft.status, AuditStatus::Failure);
        assert_eq!(draft.error_message.as_deref(), Some("permission denied"));
        assert_eq!(draft.entity_id, Some(7));
    }

    #[test]
    fn metadata_values_accumulate() {
        let draft = AuditDraft::new("cleanup", AuditCategory::System)
            .metadata_value("deleted", json!(3))
            .metadata_value("target", json!("versions"));
        assert_eq!(draft.metadata, Some(json!({"deleted": 3, "target": "versions"})));
    }

    #[test]
    fn system_actor_has_no_user_reference() {
        let actor = Actor::system();
        assert!(actor.user_id.is_none());
        assert_eq!(actor.username.as_deref(), Some("system"));
    }
}
