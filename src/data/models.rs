//! Data models
//!
//! Rust structs representing database rows. Timestamps are stored as
//! fixed-width UTC text (`YYYY-MM-DDTHH:MM:SS.sssZ`) so that string order
//! equals time order; see [`timestamp`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

// =============================================================================
// Timestamps and JSON columns
// =============================================================================

/// Canonical text form of a timestamp, identical to
/// `strftime('%Y-%m-%dT%H:%M:%fZ', ...)` in SQL.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in canonical text form.
pub fn now_timestamp() -> String {
    timestamp(Utc::now())
}

fn decode_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, sqlx::Error> {
    serde_json::from_str(raw).map_err(|error| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(error),
    })
}

fn decode_optional_json(
    column: &str,
    raw: Option<String>,
) -> Result<Option<serde_json::Value>, sqlx::Error> {
    raw.map(|raw| decode_json(column, &raw)).transpose()
}

/// Open key-value map stored as a JSON object.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// =============================================================================
// Users
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    Author,
    Viewer,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::Admin => "admin",
            UserRole::Author => "author",
            UserRole::Viewer => "viewer",
        }
    }
}

/// Identity data referenced by content, versions, tokens and audit rows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: Option<String>,
    pub role: UserRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Content
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Post,
    Page,
    Snippet,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Post => "post",
            ContentType::Page => "page",
            ContentType::Snippet => "snippet",
        }
    }
}

impl std::str::FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "post" => Ok(Self::Post),
            "page" => Ok(Self::Page),
            "snippet" => Ok(Self::Snippet),
            other => Err(format!("unknown content type: {other}")),
        }
    }
}

/// Lifecycle state of a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ContentStatus {
    #[default]
    Draft,
    Scheduled,
    Published,
    Archived,
}

impl ContentStatus {
    pub const ALL: [ContentStatus; 4] = [
        ContentStatus::Draft,
        ContentStatus::Scheduled,
        ContentStatus::Published,
        ContentStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentStatus::Draft => "draft",
            ContentStatus::Scheduled => "scheduled",
            ContentStatus::Published => "published",
            ContentStatus::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ContentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "draft" => Ok(Self::Draft),
            "scheduled" => Ok(Self::Scheduled),
            "published" => Ok(Self::Published),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown content status: {other}")),
        }
    }
}

/// A post, page or snippet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub id: i64,
    pub slug: String,
    pub title: String,
    pub content_type: ContentType,
    pub body_markdown: String,
    /// Derived from `body_markdown`; may lag until a rerender
    pub body_html: String,
    pub excerpt: Option<String>,
    pub featured_image: Option<String>,
    pub status: ContentStatus,
    /// Only set while `status` is scheduled
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub author_id: Option<i64>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for Content {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let metadata: String = row.try_get("metadata")?;
        Ok(Self {
            id: row.try_get("id")?,
            slug: row.try_get("slug")?,
            title: row.try_get("title")?,
            content_type: row.try_get("content_type")?,
            body_markdown: row.try_get("body_markdown")?,
            body_html: row.try_get("body_html")?,
            excerpt: row.try_get("excerpt")?,
            featured_image: row.try_get("featured_image")?,
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            published_at: row.try_get("published_at")?,
            author_id: row.try_get("author_id")?,
            metadata: decode_json("metadata", &metadata)?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Content row together with its tag names (sorted)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentWithTags {
    #[serde(flatten)]
    pub content: Content,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tag {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TagWithCount {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub content_count: i64,
}

// =============================================================================
// Media
// =============================================================================

/// Uploaded file metadata; the bytes live on disk under `filename`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Media {
    pub id: i64,
    pub filename: String,
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub alt_text: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub has_webp: bool,
    pub has_thumbnail: bool,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Versions
// =============================================================================

/// Pre-mutation snapshot of a content item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentVersion {
    pub id: i64,
    pub content_id: i64,
    pub version_number: i64,
    pub title: String,
    pub slug: String,
    pub body_markdown: String,
    pub excerpt: Option<String>,
    pub featured_image: Option<String>,
    pub metadata: Metadata,
    pub tags: Vec<String>,
    pub created_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, SqliteRow> for ContentVersion {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let metadata: String = row.try_get("metadata")?;
        let tags: String = row.try_get("tags_json")?;
        Ok(Self {
            id: row.try_get("id")?,
            content_id: row.try_get("content_id")?,
            version_number: row.try_get("version_number")?,
            title: row.try_get("title")?,
            slug: row.try_get("slug")?,
            body_markdown: row.try_get("body_markdown")?,
            excerpt: row.try_get("excerpt")?,
            featured_image: row.try_get("featured_image")?,
            metadata: decode_json("metadata", &metadata)?,
            tags: decode_json("tags_json", &tags)?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ContentVersionSummary {
    pub id: i64,
    pub version_number: i64,
    pub title: String,
    pub created_by: Option<i64>,
    pub created_by_username: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Audit
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum AuditStatus {
    Success,
    Failure,
}

/// One append-only audit log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<i64>,
    pub username: Option<String>,
    pub user_role: Option<String>,
    pub action: String,
    pub category: String,
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub entity_title: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub status: AuditStatus,
    pub error_message: Option<String>,
    pub changes: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
}

impl<'r> FromRow<'r, SqliteRow> for AuditEntry {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            timestamp: row.try_get("timestamp")?,
            user_id: row.try_get("user_id")?,
            username: row.try_get("username")?,
            user_role: row.try_get("user_role")?,
            action: row.try_get("action")?,
            category: row.try_get("category")?,
            entity_type: row.try_get("entity_type")?,
            entity_id: row.try_get("entity_id")?,
            entity_title: row.try_get("entity_title")?,
            ip_address: row.try_get("ip_address")?,
            user_agent: row.try_get("user_agent")?,
            status: row.try_get("status")?,
            error_message: row.try_get("error_message")?,
            changes: decode_optional_json("changes", row.try_get("changes")?)?,
            metadata: decode_optional_json("metadata", row.try_get("metadata")?)?,
        })
    }
}

// =============================================================================
// Series
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum SeriesStatus {
    #[default]
    Draft,
    Published,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Series {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub description: Option<String>,
    pub status: SeriesStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SeriesItem {
    pub content_id: i64,
    pub position: i64,
    pub title: String,
    pub slug: String,
    pub status: ContentStatus,
}

/// Neighbours of a content item inside its series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesNavigation {
    pub series: Series,
    pub position: i64,
    pub total: i64,
    pub previous: Option<SeriesItem>,
    pub next: Option<SeriesItem>,
}

// =============================================================================
// Tokens
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PreviewToken {
    pub token: String,
    pub content_id: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Persisted API token; the raw secret is never stored
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiToken {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing)]
    pub token_hash: String,
    /// Display form, e.g. `qs_AbCd...`
    pub prefix: String,
    pub permissions: String,
    pub created_by: Option<i64>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Webhooks
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Webhook {
    pub id: i64,
    pub name: String,
    pub url: String,
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    pub events: Vec<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    pub fn handles_event(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == event || e == "*")
    }
}

impl<'r> FromRow<'r, SqliteRow> for Webhook {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let events: String = row.try_get("events")?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            secret: row.try_get("secret")?,
            events: events
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect(),
            active: row.try_get("active")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct WebhookDelivery {
    pub id: i64,
    pub webhook_id: i64,
    pub event: String,
    pub payload: String,
    pub response_status: Option<i64>,
    pub response_body: Option<String>,
    pub success: bool,
    pub attempts: i64,
    pub delivered_at: DateTime<Utc>,
}

// =============================================================================
// Analytics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct HourlyStat {
    pub hour: String,
    pub path: String,
    pub content_id: Option<i64>,
    pub content_type: Option<String>,
    pub pageviews: i64,
    pub unique_sessions: i64,
    pub avg_response_time_ms: Option<f64>,
    pub error_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: String,
    pub total_pageviews: i64,
    pub unique_sessions: i64,
    pub avg_response_time_ms: Option<f64>,
    pub error_count: i64,
    pub top_pages: Vec<PageCount>,
}

impl<'r> FromRow<'r, SqliteRow> for DailyStat {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let top_pages: String = row.try_get("top_pages")?;
        Ok(Self {
            date: row.try_get("date")?,
            total_pageviews: row.try_get("total_pageviews")?,
            unique_sessions: row.try_get("unique_sessions")?,
            avg_response_time_ms: row.try_get("avg_response_time_ms")?,
            error_count: row.try_get("error_count")?,
            top_pages: decode_json("top_pages", &top_pages)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct PageCount {
    pub path: String,
    pub views: i64,
}

// =============================================================================
// Schema bookkeeping
// =============================================================================

/// Row of `schema_migrations`
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn timestamp_matches_sqlite_strftime_layout() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(timestamp(at), "2024-03-09T07:05:01.000Z");
    }

    #[test]
    fn content_status_parses_case_insensitively() {
        assert_eq!(
            "Scheduled".parse::<ContentStatus>().unwrap(),
            ContentStatus::Scheduled
        );
        assert!("pending".parse::<ContentStatus>().is_err());
    }

    #[test]
    fn webhook_wildcard_matches_every_event() {
        let webhook = Webhook {
            id: 1,
            name: "all".to_string(),
            url: "https://hooks.example.com".to_string(),
            secret: None,
            events: vec!["*".to_string()],
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(webhook.handles_event("content.deleted"));
    }
}
