//! Search index synchronizer
//!
//! `content_fts` mirrors every content row as `{title, body, tags}` with
//! rowid = content id. Writers call [`sync_content`] or [`remove_content`]
//! inside their own transaction, so a committed write and its index entry
//! become visible together. An index update that fails is rolled back to
//! its savepoint, the index is flagged stale and the content write goes
//! on; [`SearchIndex::rebuild`] heals it.

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::sync::Arc;

use crate::data::{Content, Database, SEARCH_INDEX_STALE_KEY, put_setting};
use crate::error::StoreError;
use crate::metrics::{SEARCH_INDEX_REBUILDS_TOTAL, SEARCH_INDEX_SYNC_FAILURES_TOTAL};

/// `INSERT .. SELECT` producing index entries into `table`.
fn index_entries_sql(table: &str) -> String {
    format!(
        r#"
INSERT INTO {table} (rowid, title, body, tags)
SELECT c.id, c.title, c.body_markdown,
       COALESCE((SELECT GROUP_CONCAT(name, ' ') FROM (
           SELECT t.name FROM tags t
           JOIN content_tags ct ON ct.tag_id = t.id
           WHERE ct.content_id = c.id
           ORDER BY t.name
       )), '')
FROM content c
"#
    )
}

const CREATE_REBUILD_TABLE: &str = "CREATE VIRTUAL TABLE content_fts_rebuild \
     USING fts5(title, body, tags, tokenize = 'porter unicode61')";

/// Replace the index entry for one content row.
///
/// If the row no longer exists the entry is simply removed.
pub async fn sync_content(conn: &mut SqliteConnection, content_id: i64) -> Result<(), StoreError> {
    let mut savepoint = conn.begin().await?;
    let result: Result<(), sqlx::Error> = async {
        sqlx::query("DELETE FROM content_fts WHERE rowid = ?")
            .bind(content_id)
            .execute(&mut *savepoint)
            .await?;
        sqlx::query(&format!("{} WHERE c.id = ?", index_entries_sql("content_fts")))
            .bind(content_id)
            .execute(&mut *savepoint)
            .await?;
        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            savepoint.commit().await?;
            Ok(())
        }
        Err(error) => {
            savepoint.rollback().await?;
            mark_stale(conn, content_id, &error).await
        }
    }
}

/// Drop the index entry for a deleted content row.
pub async fn remove_content(
    conn: &mut SqliteConnection,
    content_id: i64,
) -> Result<(), StoreError> {
    let mut savepoint = conn.begin().await?;
    let result = sqlx::query("DELETE FROM content_fts WHERE rowid = ?")
        .bind(content_id)
        .execute(&mut *savepoint)
        .await;

    match result {
        Ok(_) => {
            savepoint.commit().await?;
            Ok(())
        }
        Err(error) => {
            savepoint.rollback().await?;
            mark_stale(conn, content_id, &error).await
        }
    }
}

/// Re-index every content row tagged with `tag_id`.
pub async fn sync_tagged(conn: &mut SqliteConnection, tag_id: i64) -> Result<usize, StoreError> {
    let ids = sqlx::query_scalar::<_, i64>("SELECT content_id FROM content_tags WHERE tag_id = ?")
        .bind(tag_id)
        .fetch_all(&mut *conn)
        .await?;
    for id in &ids {
        sync_content(conn, *id).await?;
    }
    Ok(ids.len())
}

async fn mark_stale(
    conn: &mut SqliteConnection,
    content_id: i64,
    error: &sqlx::Error,
) -> Result<(), StoreError> {
    SEARCH_INDEX_SYNC_FAILURES_TOTAL.inc();
    tracing::warn!(
        content_id,
        %error,
        "Search index update failed; index marked stale"
    );
    put_setting(conn, SEARCH_INDEX_STALE_KEY, "1").await
}

/// Build an FTS5 expression: each whitespace-separated term becomes a
/// quoted prefix match and terms are OR-ed together.
pub fn build_fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|term| term.replace('"', ""))
        .filter(|term| !term.is_empty())
        .map(|term| format!("\"{term}\"*"))
        .collect();

    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

/// Outcome of a full rebuild.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RebuildSummary {
    pub indexed: u64,
}

/// Search queries and maintenance.
pub struct SearchIndex {
    db: Arc<Database>,
}

impl SearchIndex {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Published content matching `query`, best match first.
    pub async fn search(&self, query: &str, limit: i64) -> Result<Vec<Content>, StoreError> {
        self.run_query(query, limit, true).await
    }

    /// Like [`SearchIndex::search`] over every status, for the admin side.
    pub async fn search_all(&self, query: &str, limit: i64) -> Result<Vec<Content>, StoreError> {
        self.run_query(query, limit, false).await
    }

    async fn run_query(
        &self,
        query: &str,
        limit: i64,
        published_only: bool,
    ) -> Result<Vec<Content>, StoreError> {
        let Some(expression) = build_fts_query(query) else {
            return Ok(Vec::new());
        };

        let rows = sqlx::query_as::<_, Content>(
            r#"
            SELECT c.* FROM content_fts
            JOIN content c ON c.id = content_fts.rowid
            WHERE content_fts MATCH ?1
              AND (?2 = 0 OR c.status = 'published')
            ORDER BY bm25(content_fts)
            LIMIT ?3
            "#,
        )
        .bind(expression)
        .bind(published_only)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(rows)
    }

    pub async fn is_stale(&self) -> Result<bool, StoreError> {
        Ok(self
            .db
            .get_setting(SEARCH_INDEX_STALE_KEY)
            .await?
            .is_some_and(|v| v == "1"))
    }

    /// Regenerate the whole index from `content` and swap it in.
    ///
    /// The new index is built under a separate name and renamed in the
    /// same transaction, so readers see the old or the new index only.
    pub async fn rebuild(&self) -> Result<RebuildSummary, StoreError> {
        let mut tx = self.db.begin_write().await?;

        let result: Result<u64, sqlx::Error> = async {
            let conn = tx.conn();
            sqlx::query("DROP TABLE IF EXISTS content_fts_rebuild")
                .execute(&mut *conn)
                .await?;
            sqlx::query(CREATE_REBUILD_TABLE).execute(&mut *conn).await?;
            let indexed = sqlx::query(&index_entries_sql("content_fts_rebuild"))
                .execute(&mut *conn)
                .await?
                .rows_affected();
            sqlx::query("DROP TABLE IF EXISTS content_fts")
                .execute(&mut *conn)
                .await?;
            sqlx::query("ALTER TABLE content_fts_rebuild RENAME TO content_fts")
                .execute(&mut *conn)
                .await?;
            Ok(indexed)
        }
        .await;

        let indexed = match result {
            Ok(indexed) => indexed,
            Err(error) => {
                SEARCH_INDEX_REBUILDS_TOTAL
                    .with_label_values(&["failure"])
                    .inc();
                tracing::error!(%error, "Search index rebuild failed");
                return Err(StoreError::IndexSync(error.to_string()));
            }
        };

        put_setting(tx.conn(), SEARCH_INDEX_STALE_KEY, "0").await?;
        tx.commit().await?;

        SEARCH_INDEX_REBUILDS_TOTAL
            .with_label_values(&["success"])
            .inc();
        tracing::info!(indexed, "Search index rebuilt");
        Ok(RebuildSummary { indexed })
    }

    /// Rebuild only when an earlier incremental update failed.
    pub async fn heal_if_stale(&self) -> Result<bool, StoreError> {
        if !self.is_stale().await? {
            return Ok(false);
        }
        self.rebuild().await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fts_query_quotes_and_prefixes_terms() {
        assert_eq!(
            build_fts_query("rust  sqlite").as_deref(),
            Some("\"rust\"* OR \"sqlite\"*")
        );
    }

    #[test]
    fn fts_query_strips_embedded_quotes() {
        assert_eq!(
            build_fts_query("say \"hi\"").as_deref(),
            Some("\"say\"* OR \"hi\"*")
        );
        assert_eq!(build_fts_query("\"\" "), None);
    }

    #[test]
    fn empty_query_yields_nothing() {
        assert_eq!(build_fts_query("   "), None);
    }
}
