//! Ordered schema migrations
//!
//! Each migration is a list of forward steps and a list of rollback steps.
//! Indexes and triggers are never created here: after the steps of a unit
//! run, the catalog reconciles them for the resulting version. Migration
//! text is checksummed, so it must not reference code that may evolve.

use sha2::{Digest, Sha256};

/// One schema change unit
#[derive(Debug)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub up: &'static [Step],
    pub down: &'static [Step],
    /// Rolling back drops tables holding user data
    pub destructive: bool,
}

/// A single step of a migration unit
#[derive(Debug)]
pub enum Step {
    /// Plain SQL, possibly several statements
    Sql(&'static str),
    /// Shadow-table rebuild of `table`
    Rebuild(Rebuild),
}

/// Rebuild-copy-swap of a table whose constraint set changes.
///
/// `create_sql` must create `<table>_rebuild`. Rows are copied with the
/// explicit `columns` projection, the old table is dropped and the shadow
/// table renamed into place.
#[derive(Debug)]
pub struct Rebuild {
    pub table: &'static str,
    pub create_sql: &'static str,
    pub columns: &'static str,
}

impl Rebuild {
    pub fn shadow_table(&self) -> String {
        format!("{}_rebuild", self.table)
    }

    /// Statements executed after `create_sql`, in order.
    pub fn swap_statements(&self) -> [String; 3] {
        let shadow = self.shadow_table();
        [
            format!(
                "INSERT INTO {shadow} ({cols}) SELECT {cols} FROM {table}",
                cols = self.columns,
                table = self.table
            ),
            format!("DROP TABLE {}", self.table),
            format!("ALTER TABLE {shadow} RENAME TO {}", self.table),
        ]
    }
}

impl Migration {
    /// SHA-256 over the forward step definitions, lowercase hex.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.version.to_le_bytes());
        for step in self.up {
            match step {
                Step::Sql(sql) => {
                    hasher.update(b"sql\0");
                    hasher.update(sql.as_bytes());
                }
                Step::Rebuild(rebuild) => {
                    hasher.update(b"rebuild\0");
                    hasher.update(rebuild.table.as_bytes());
                    hasher.update(b"\0");
                    hasher.update(rebuild.create_sql.as_bytes());
                    hasher.update(b"\0");
                    hasher.update(rebuild.columns.as_bytes());
                }
            }
            hasher.update(b"\0");
        }
        format!("{:x}", hasher.finalize())
    }
}

/// Highest version this binary knows about.
pub fn latest_version() -> i64 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

pub fn find(version: i64) -> Option<&'static Migration> {
    MIGRATIONS.iter().find(|m| m.version == version)
}

pub static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial",
        description: "users, sessions, content, tags, media and settings",
        up: &[Step::Sql(INITIAL_UP)],
        down: &[Step::Sql(INITIAL_DOWN)],
        destructive: true,
    },
    Migration {
        version: 2,
        name: "full_text_search",
        description: "FTS5 index over content title, body and tags",
        up: &[Step::Sql(FTS_UP)],
        down: &[Step::Sql("DROP TABLE IF EXISTS content_fts;")],
        destructive: false,
    },
    Migration {
        version: 3,
        name: "media_optimization",
        description: "image dimensions and derived-variant flags on media",
        up: &[Step::Sql(MEDIA_OPTIMIZATION_UP)],
        down: &[Step::Rebuild(Rebuild {
            table: "media",
            create_sql: MEDIA_V1_REBUILD,
            columns: "id, filename, original_name, mime_type, size_bytes, alt_text, created_at",
        })],
        destructive: false,
    },
    Migration {
        version: 4,
        name: "scheduled_publishing",
        description: "scheduled status and scheduled_at on content",
        up: &[Step::Rebuild(Rebuild {
            table: "content",
            create_sql: CONTENT_V4_REBUILD,
            columns: "id, slug, title, content_type, body_markdown, body_html, excerpt, \
                      featured_image, status, published_at, author_id, metadata, \
                      created_at, updated_at",
        })],
        down: &[
            Step::Sql(
                "UPDATE content SET status = 'draft', scheduled_at = NULL \
                 WHERE status = 'scheduled';",
            ),
            Step::Rebuild(Rebuild {
                table: "content",
                create_sql: CONTENT_V1_REBUILD,
                columns: "id, slug, title, content_type, body_markdown, body_html, excerpt, \
                          featured_image, status, published_at, author_id, metadata, \
                          created_at, updated_at",
            }),
        ],
        destructive: false,
    },
    Migration {
        version: 5,
        name: "analytics",
        description: "raw analytics events with hourly, daily and per-content roll-ups",
        up: &[Step::Sql(ANALYTICS_UP)],
        down: &[Step::Sql(
            "DROP TABLE IF EXISTS analytics_content;
             DROP TABLE IF EXISTS analytics_daily;
             DROP TABLE IF EXISTS analytics_hourly;
             DROP TABLE IF EXISTS analytics_events;",
        )],
        destructive: true,
    },
    Migration {
        version: 6,
        name: "content_versions",
        description: "pre-mutation content snapshots",
        up: &[Step::Sql(CONTENT_VERSIONS_UP)],
        down: &[Step::Sql("DROP TABLE IF EXISTS content_versions;")],
        destructive: true,
    },
    Migration {
        version: 7,
        name: "audit_log",
        description: "append-only audit log",
        up: &[Step::Sql(AUDIT_LOG_UP)],
        down: &[Step::Sql("DROP TABLE IF EXISTS audit_logs;")],
        destructive: true,
    },
    Migration {
        version: 8,
        name: "preview_tokens",
        description: "short-lived draft preview tokens",
        up: &[Step::Sql(PREVIEW_TOKENS_UP)],
        down: &[Step::Sql("DROP TABLE IF EXISTS preview_tokens;")],
        destructive: false,
    },
    Migration {
        version: 9,
        name: "content_series",
        description: "ordered content series",
        up: &[Step::Sql(SERIES_UP)],
        down: &[Step::Sql(
            "DROP TABLE IF EXISTS series_items;
             DROP TABLE IF EXISTS content_series;",
        )],
        destructive: true,
    },
    Migration {
        version: 10,
        name: "api_tokens_and_webhooks",
        description: "hashed API tokens, webhook registrations and delivery log",
        up: &[Step::Sql(API_AND_WEBHOOKS_UP)],
        down: &[Step::Sql(
            "DROP TABLE IF EXISTS webhook_deliveries;
             DROP TABLE IF EXISTS webhooks;
             DROP TABLE IF EXISTS api_tokens;",
        )],
        destructive: true,
    },
];

const INITIAL_UP: &str = r#"
CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    username TEXT NOT NULL UNIQUE,
    email TEXT,
    role TEXT NOT NULL DEFAULT 'author' CHECK (role IN ('admin', 'author', 'viewer')),
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE sessions (
    token TEXT PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE content (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'post' CHECK (content_type IN ('post', 'page', 'snippet')),
    body_markdown TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    excerpt TEXT,
    featured_image TEXT,
    status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN ('draft', 'published', 'archived')),
    published_at TEXT,
    author_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    slug TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE content_tags (
    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
    tag_id INTEGER NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
    PRIMARY KEY (content_id, tag_id)
);

CREATE TABLE media (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    original_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    alt_text TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

const INITIAL_DOWN: &str = r#"
DROP TABLE IF EXISTS settings;
DROP TABLE IF EXISTS media;
DROP TABLE IF EXISTS content_tags;
DROP TABLE IF EXISTS tags;
DROP TABLE IF EXISTS content;
DROP TABLE IF EXISTS sessions;
DROP TABLE IF EXISTS users;
"#;

const FTS_UP: &str = r#"
CREATE VIRTUAL TABLE content_fts USING fts5(title, body, tags, tokenize = 'porter unicode61');

INSERT INTO content_fts (rowid, title, body, tags)
SELECT c.id, c.title, c.body_markdown,
       COALESCE((SELECT GROUP_CONCAT(name, ' ') FROM (
           SELECT t.name FROM tags t
           JOIN content_tags ct ON ct.tag_id = t.id
           WHERE ct.content_id = c.id
           ORDER BY t.name
       )), '')
FROM content c;
"#;

const MEDIA_OPTIMIZATION_UP: &str = r#"
ALTER TABLE media ADD COLUMN width INTEGER;
ALTER TABLE media ADD COLUMN height INTEGER;
ALTER TABLE media ADD COLUMN has_webp INTEGER NOT NULL DEFAULT 0;
ALTER TABLE media ADD COLUMN has_thumbnail INTEGER NOT NULL DEFAULT 0;
"#;

const MEDIA_V1_REBUILD: &str = r#"
CREATE TABLE media_rebuild (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    filename TEXT NOT NULL UNIQUE,
    original_name TEXT NOT NULL,
    mime_type TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    alt_text TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

const CONTENT_V1_REBUILD: &str = r#"
CREATE TABLE content_rebuild (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'post' CHECK (content_type IN ('post', 'page', 'snippet')),
    body_markdown TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    excerpt TEXT,
    featured_image TEXT,
    status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN ('draft', 'published', 'archived')),
    published_at TEXT,
    author_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

const CONTENT_V4_REBUILD: &str = r#"
CREATE TABLE content_rebuild (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    slug TEXT NOT NULL UNIQUE,
    title TEXT NOT NULL,
    content_type TEXT NOT NULL DEFAULT 'post' CHECK (content_type IN ('post', 'page', 'snippet')),
    body_markdown TEXT NOT NULL DEFAULT '',
    body_html TEXT NOT NULL DEFAULT '',
    excerpt TEXT,
    featured_image TEXT,
    status TEXT NOT NULL DEFAULT 'draft'
        CHECK (status IN ('draft', 'scheduled', 'published', 'archived')),
    scheduled_at TEXT,
    published_at TEXT,
    author_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    CHECK (scheduled_at IS NULL OR status = 'scheduled')
)
"#;

const ANALYTICS_UP: &str = r#"
CREATE TABLE analytics_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    path TEXT NOT NULL,
    referrer_domain TEXT,
    country_code TEXT,
    device_type TEXT NOT NULL DEFAULT 'desktop' CHECK (device_type IN ('desktop', 'mobile', 'tablet')),
    browser_family TEXT,
    session_hash TEXT NOT NULL,
    response_time_ms INTEGER,
    status_code INTEGER NOT NULL DEFAULT 200,
    content_id INTEGER REFERENCES content(id) ON DELETE SET NULL,
    content_type TEXT
);

CREATE TABLE analytics_hourly (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    hour TEXT NOT NULL,
    path TEXT NOT NULL,
    content_id INTEGER,
    content_type TEXT,
    pageviews INTEGER NOT NULL DEFAULT 0,
    unique_sessions INTEGER NOT NULL DEFAULT 0,
    avg_response_time_ms REAL,
    error_count INTEGER NOT NULL DEFAULT 0,
    UNIQUE (hour, path)
);

CREATE TABLE analytics_daily (
    date TEXT PRIMARY KEY,
    total_pageviews INTEGER NOT NULL DEFAULT 0,
    unique_sessions INTEGER NOT NULL DEFAULT 0,
    avg_response_time_ms REAL,
    error_count INTEGER NOT NULL DEFAULT 0,
    top_pages TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE analytics_content (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
    date TEXT NOT NULL,
    pageviews INTEGER NOT NULL DEFAULT 0,
    unique_sessions INTEGER NOT NULL DEFAULT 0,
    UNIQUE (content_id, date)
);
"#;

const CONTENT_VERSIONS_UP: &str = r#"
CREATE TABLE content_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
    version_number INTEGER NOT NULL CHECK (version_number >= 1),
    title TEXT NOT NULL,
    slug TEXT NOT NULL,
    body_markdown TEXT NOT NULL,
    excerpt TEXT,
    featured_image TEXT,
    metadata TEXT NOT NULL DEFAULT '{}',
    tags_json TEXT NOT NULL DEFAULT '[]',
    created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    UNIQUE (content_id, version_number)
);
"#;

const AUDIT_LOG_UP: &str = r#"
CREATE TABLE audit_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    user_id INTEGER REFERENCES users(id) ON DELETE SET NULL,
    username TEXT,
    user_role TEXT,
    action TEXT NOT NULL,
    category TEXT NOT NULL,
    entity_type TEXT,
    entity_id INTEGER,
    entity_title TEXT,
    ip_address TEXT,
    user_agent TEXT,
    status TEXT NOT NULL DEFAULT 'success' CHECK (status IN ('success', 'failure')),
    error_message TEXT,
    changes TEXT,
    metadata TEXT
);
"#;

const PREVIEW_TOKENS_UP: &str = r#"
CREATE TABLE preview_tokens (
    token TEXT PRIMARY KEY,
    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
    expires_at TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

const SERIES_UP: &str = r#"
CREATE TABLE content_series (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE,
    description TEXT,
    status TEXT NOT NULL DEFAULT 'draft' CHECK (status IN ('draft', 'published')),
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE series_items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    series_id INTEGER NOT NULL REFERENCES content_series(id) ON DELETE CASCADE,
    content_id INTEGER NOT NULL REFERENCES content(id) ON DELETE CASCADE,
    position INTEGER NOT NULL,
    UNIQUE (series_id, content_id)
);
"#;

const API_AND_WEBHOOKS_UP: &str = r#"
CREATE TABLE api_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    token_hash TEXT NOT NULL UNIQUE,
    prefix TEXT NOT NULL,
    permissions TEXT NOT NULL DEFAULT 'read',
    created_by INTEGER REFERENCES users(id) ON DELETE SET NULL,
    last_used_at TEXT,
    expires_at TEXT,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE webhooks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    url TEXT NOT NULL,
    secret TEXT,
    events TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    updated_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE TABLE webhook_deliveries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    webhook_id INTEGER NOT NULL REFERENCES webhooks(id) ON DELETE CASCADE,
    event TEXT NOT NULL,
    payload TEXT NOT NULL,
    response_status INTEGER,
    response_body TEXT,
    success INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 1,
    delivered_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;
