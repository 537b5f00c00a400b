//! Schema catalog
//!
//! The authoritative list of managed indexes and triggers, keyed by the
//! schema version that introduced (and possibly retired) each one. The
//! migration runner reconciles the live schema against this list after
//! every unit, so a table rebuild can never silently lose an index.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Index,
    Trigger,
}

impl ObjectKind {
    fn as_sql(&self) -> &'static str {
        match self {
            ObjectKind::Index => "INDEX",
            ObjectKind::Trigger => "TRIGGER",
        }
    }

    fn from_master_type(kind: &str) -> Option<Self> {
        match kind {
            "index" => Some(ObjectKind::Index),
            "trigger" => Some(ObjectKind::Trigger),
            _ => None,
        }
    }
}

/// A managed index or trigger
#[derive(Debug)]
pub struct CatalogObject {
    pub kind: ObjectKind,
    pub name: &'static str,
    pub table: &'static str,
    pub sql: &'static str,
    pub introduced_in: i64,
    pub retired_in: Option<i64>,
}

impl CatalogObject {
    pub fn present_at(&self, version: i64) -> bool {
        version >= self.introduced_in && self.retired_in.is_none_or(|retired| version < retired)
    }
}

/// Objects expected to exist once `version` is applied, in catalog order.
pub fn expected_at(version: i64) -> Vec<&'static CatalogObject> {
    CATALOG.iter().filter(|o| o.present_at(version)).collect()
}

/// Objects attached to `table` at `version`; a rebuild of `table` must restore these.
pub fn objects_for_table(table: &str, version: i64) -> Vec<&'static CatalogObject> {
    CATALOG
        .iter()
        .filter(|o| o.table == table && o.present_at(version))
        .collect()
}

/// Difference between the catalog and the live schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogDrift {
    /// Expected but absent
    pub missing: Vec<String>,
    /// Present but not expected at this version
    pub unexpected: Vec<String>,
    /// Present with a definition that differs from the catalog
    pub changed: Vec<String>,
}

impl CatalogDrift {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LiveObject {
    #[sqlx(rename = "type")]
    kind: String,
    name: String,
    sql: String,
}

async fn live_objects(
    conn: &mut SqliteConnection,
) -> Result<BTreeMap<String, (ObjectKind, String)>, sqlx::Error> {
    let rows = sqlx::query_as::<_, LiveObject>(
        "SELECT type, name, sql FROM sqlite_master \
         WHERE type IN ('index', 'trigger') AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'",
    )
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            ObjectKind::from_master_type(&row.kind).map(|kind| (row.name, (kind, row.sql)))
        })
        .collect())
}

/// SQLite normalises stored DDL whitespace, so compare token streams.
fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(';')
        .trim_end()
        .to_string()
}

/// Compare the live schema against the catalog at `version`.
pub async fn verify(conn: &mut SqliteConnection, version: i64) -> Result<CatalogDrift, sqlx::Error> {
    let live = live_objects(conn).await?;
    let expected = expected_at(version);
    let expected_names: BTreeSet<&str> = expected.iter().map(|o| o.name).collect();

    let mut drift = CatalogDrift::default();
    for object in &expected {
        match live.get(object.name) {
            None => drift.missing.push(object.name.to_string()),
            Some((kind, sql)) => {
                if *kind != object.kind || normalize_sql(sql) != normalize_sql(object.sql) {
                    drift.changed.push(object.name.to_string());
                }
            }
        }
    }
    drift.unexpected = live
        .keys()
        .filter(|name| !expected_names.contains(name.as_str()))
        .cloned()
        .collect();

    Ok(drift)
}

/// Bring the live indexes and triggers in line with the catalog at `version`.
///
/// Runs inside the caller's transaction.
pub async fn reconcile(conn: &mut SqliteConnection, version: i64) -> Result<CatalogDrift, sqlx::Error> {
    let drift = verify(conn, version).await?;
    if drift.is_clean() {
        return Ok(drift);
    }

    let live = live_objects(conn).await?;
    for name in drift.unexpected.iter().chain(drift.changed.iter()) {
        if let Some((kind, _)) = live.get(name) {
            sqlx::query(&format!("DROP {} IF EXISTS \"{}\"", kind.as_sql(), name))
                .execute(&mut *conn)
                .await?;
        }
    }

    for object in expected_at(version) {
        if drift.missing.iter().any(|n| n == object.name)
            || drift.changed.iter().any(|n| n == object.name)
        {
            sqlx::query(object.sql).execute(&mut *conn).await?;
        }
    }

    tracing::debug!(
        version,
        created = drift.missing.len(),
        dropped = drift.unexpected.len(),
        replaced = drift.changed.len(),
        "Reconciled schema catalog"
    );

    Ok(drift)
}

pub static CATALOG: &[CatalogObject] = &[
    // v1: core tables
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_status",
        table: "content",
        sql: "CREATE INDEX idx_content_status ON content(status)",
        introduced_in: 1,
        retired_in: Some(4),
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_type",
        table: "content",
        sql: "CREATE INDEX idx_content_type ON content(content_type)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_published_at",
        table: "content",
        sql: "CREATE INDEX idx_content_published_at ON content(published_at)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_author",
        table: "content",
        sql: "CREATE INDEX idx_content_author ON content(author_id)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Trigger,
        name: "trg_content_updated_at",
        table: "content",
        // body_html is derived; refreshing it alone keeps updated_at
        sql: "CREATE TRIGGER trg_content_updated_at \
              AFTER UPDATE OF slug, title, content_type, body_markdown, excerpt, \
              featured_image, status, published_at, author_id, metadata ON content \
              FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at \
              BEGIN \
                  UPDATE content SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id; \
              END",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_tags_tag",
        table: "content_tags",
        sql: "CREATE INDEX idx_content_tags_tag ON content_tags(tag_id)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_media_mime_type",
        table: "media",
        sql: "CREATE INDEX idx_media_mime_type ON media(mime_type)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_sessions_user",
        table: "sessions",
        sql: "CREATE INDEX idx_sessions_user ON sessions(user_id)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_sessions_expires",
        table: "sessions",
        sql: "CREATE INDEX idx_sessions_expires ON sessions(expires_at)",
        introduced_in: 1,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Trigger,
        name: "trg_users_updated_at",
        table: "users",
        sql: "CREATE TRIGGER trg_users_updated_at AFTER UPDATE ON users \
              FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at \
              BEGIN \
                  UPDATE users SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id; \
              END",
        introduced_in: 1,
        retired_in: None,
    },
    // v3: media optimisation
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_media_pending_webp",
        table: "media",
        sql: "CREATE INDEX idx_media_pending_webp ON media(id) WHERE has_webp = 0",
        introduced_in: 3,
        retired_in: None,
    },
    // v4: scheduled publishing
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_status_published",
        table: "content",
        sql: "CREATE INDEX idx_content_status_published ON content(status, published_at)",
        introduced_in: 4,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_scheduled",
        table: "content",
        sql: "CREATE INDEX idx_content_scheduled ON content(scheduled_at) WHERE status = 'scheduled'",
        introduced_in: 4,
        retired_in: None,
    },
    // v5: analytics
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_analytics_events_timestamp",
        table: "analytics_events",
        sql: "CREATE INDEX idx_analytics_events_timestamp ON analytics_events(timestamp)",
        introduced_in: 5,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_analytics_events_content",
        table: "analytics_events",
        sql: "CREATE INDEX idx_analytics_events_content ON analytics_events(content_id)",
        introduced_in: 5,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_analytics_hourly_hour",
        table: "analytics_hourly",
        sql: "CREATE INDEX idx_analytics_hourly_hour ON analytics_hourly(hour)",
        introduced_in: 5,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_analytics_content_date",
        table: "analytics_content",
        sql: "CREATE INDEX idx_analytics_content_date ON analytics_content(date)",
        introduced_in: 5,
        retired_in: None,
    },
    // v6: versions
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_content_versions_created_by",
        table: "content_versions",
        sql: "CREATE INDEX idx_content_versions_created_by ON content_versions(created_by)",
        introduced_in: 6,
        retired_in: None,
    },
    // v7: audit
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_audit_logs_timestamp",
        table: "audit_logs",
        sql: "CREATE INDEX idx_audit_logs_timestamp ON audit_logs(timestamp)",
        introduced_in: 7,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_audit_logs_user",
        table: "audit_logs",
        sql: "CREATE INDEX idx_audit_logs_user ON audit_logs(user_id)",
        introduced_in: 7,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_audit_logs_entity",
        table: "audit_logs",
        sql: "CREATE INDEX idx_audit_logs_entity ON audit_logs(entity_type, entity_id)",
        introduced_in: 7,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_audit_logs_category",
        table: "audit_logs",
        sql: "CREATE INDEX idx_audit_logs_category ON audit_logs(category, action)",
        introduced_in: 7,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Trigger,
        name: "trg_audit_logs_append_only",
        table: "audit_logs",
        sql: "CREATE TRIGGER trg_audit_logs_append_only \
              BEFORE UPDATE OF timestamp, username, user_role, action, category, entity_type, \
              entity_id, entity_title, ip_address, user_agent, status, error_message, changes, \
              metadata ON audit_logs \
              BEGIN \
                  SELECT RAISE(ABORT, 'audit_logs is append-only'); \
              END",
        introduced_in: 7,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Trigger,
        name: "trg_audit_logs_no_delete",
        table: "audit_logs",
        sql: "CREATE TRIGGER trg_audit_logs_no_delete BEFORE DELETE ON audit_logs \
              BEGIN \
                  SELECT RAISE(ABORT, 'audit_logs is append-only'); \
              END",
        introduced_in: 7,
        retired_in: None,
    },
    // v8: preview tokens
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_preview_tokens_content",
        table: "preview_tokens",
        sql: "CREATE INDEX idx_preview_tokens_content ON preview_tokens(content_id)",
        introduced_in: 8,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_preview_tokens_expires",
        table: "preview_tokens",
        sql: "CREATE INDEX idx_preview_tokens_expires ON preview_tokens(expires_at)",
        introduced_in: 8,
        retired_in: None,
    },
    // v9: series
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_series_items_series",
        table: "series_items",
        sql: "CREATE INDEX idx_series_items_series ON series_items(series_id, position)",
        introduced_in: 9,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_series_items_content",
        table: "series_items",
        sql: "CREATE INDEX idx_series_items_content ON series_items(content_id)",
        introduced_in: 9,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Trigger,
        name: "trg_content_series_updated_at",
        table: "content_series",
        sql: "CREATE TRIGGER trg_content_series_updated_at AFTER UPDATE ON content_series \
              FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at \
              BEGIN \
                  UPDATE content_series SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id; \
              END",
        introduced_in: 9,
        retired_in: None,
    },
    // v10: API tokens and webhooks
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_api_tokens_created_by",
        table: "api_tokens",
        sql: "CREATE INDEX idx_api_tokens_created_by ON api_tokens(created_by)",
        introduced_in: 10,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Index,
        name: "idx_webhook_deliveries_webhook",
        table: "webhook_deliveries",
        sql: "CREATE INDEX idx_webhook_deliveries_webhook ON webhook_deliveries(webhook_id, delivered_at)",
        introduced_in: 10,
        retired_in: None,
    },
    CatalogObject {
        kind: ObjectKind::Trigger,
        name: "trg_webhooks_updated_at",
        table: "webhooks",
        sql: "CREATE TRIGGER trg_webhooks_updated_at AFTER UPDATE ON webhooks \
              FOR EACH ROW WHEN NEW.updated_at = OLD.updated_at \
              BEGIN \
                  UPDATE webhooks SET updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now') WHERE id = NEW.id; \
              END",
        introduced_in: 10,
        retired_in: None,
    },
];
