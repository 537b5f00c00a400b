//! Tag service
//!
//! Tags are attached to content through `content_tags`. Every junction
//! change re-indexes the owning content rows in the same transaction.

use serde_json::json;
use sqlx::SqliteConnection;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft};
use super::search;
use super::slug::generate_slug;
use crate::data::{Database, Tag, TagWithCount};
use crate::error::StoreError;

/// Tag names of one content row, sorted.
pub async fn tags_for(
    conn: &mut SqliteConnection,
    content_id: i64,
) -> Result<Vec<String>, StoreError> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT t.name FROM tags t JOIN content_tags ct ON ct.tag_id = t.id \
         WHERE ct.content_id = ? ORDER BY t.name",
    )
    .bind(content_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(names)
}

/// Trimmed, de-duplicated, sorted tag names.
pub fn normalize_tag_names(names: &[String]) -> Result<Vec<String>, StoreError> {
    let mut unique = BTreeSet::new();
    for name in names {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        if generate_slug(name).is_empty() {
            return Err(StoreError::Validation(format!(
                "tag '{name}' must contain at least one ASCII letter or digit"
            )));
        }
        unique.insert(name.to_string());
    }
    Ok(unique.into_iter().collect())
}

/// Names as [`replace_content_tags`] would store them, sorted.
///
/// A name whose slug matches an existing tag resolves to that tag's name;
/// new names sharing a slug collapse to the first one.
pub async fn resolve_tag_names(
    conn: &mut SqliteConnection,
    names: &[String],
) -> Result<Vec<String>, StoreError> {
    let mut by_slug: BTreeMap<String, String> = BTreeMap::new();
    let mut resolved = BTreeSet::new();
    for name in normalize_tag_names(names)? {
        let slug = generate_slug(&name);
        if let Some(existing) = by_slug.get(&slug) {
            resolved.insert(existing.clone());
            continue;
        }
        let stored = sqlx::query_scalar::<_, String>(
            "SELECT name FROM tags WHERE name = ?1 OR slug = ?2 ORDER BY (name = ?1) DESC LIMIT 1",
        )
        .bind(&name)
        .bind(&slug)
        .fetch_optional(&mut *conn)
        .await?;
        let stored = stored.unwrap_or(name);
        by_slug.insert(slug, stored.clone());
        resolved.insert(stored);
    }
    Ok(resolved.into_iter().collect())
}

/// Id of the tag called `name`, creating it when missing.
async fn ensure_tag(conn: &mut SqliteConnection, name: &str) -> Result<i64, StoreError> {
    let slug = generate_slug(name);
    let existing = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM tags WHERE name = ?1 OR slug = ?2 ORDER BY (name = ?1) DESC LIMIT 1",
    )
    .bind(name)
    .bind(&slug)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some(id) = existing {
        return Ok(id);
    }

    let id = sqlx::query("INSERT INTO tags (name, slug) VALUES (?, ?)")
        .bind(name)
        .bind(&slug)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();
    Ok(id)
}

/// Replace the tag set of `content_id`. The caller re-indexes the row.
pub async fn replace_content_tags(
    conn: &mut SqliteConnection,
    content_id: i64,
    names: &[String],
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM content_tags WHERE content_id = ?")
        .bind(content_id)
        .execute(&mut *conn)
        .await?;

    for name in normalize_tag_names(names)? {
        let tag_id = ensure_tag(conn, &name).await?;
        sqlx::query("INSERT OR IGNORE INTO content_tags (content_id, tag_id) VALUES (?, ?)")
            .bind(content_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Tag service
pub struct TagService {
    db: Arc<Database>,
}

impl TagService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<Tag>, StoreError> {
        let tag = sqlx::query_as::<_, Tag>(
            "SELECT id, name, slug, created_at FROM tags WHERE slug = ?",
        )
        .bind(slug)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(tag)
    }

    pub async fn list(&self) -> Result<Vec<Tag>, StoreError> {
        let tags = sqlx::query_as::<_, Tag>("SELECT id, name, slug, created_at FROM tags ORDER BY name")
            .fetch_all(self.db.pool())
            .await?;
        Ok(tags)
    }

    pub async fn list_with_counts(&self) -> Result<Vec<TagWithCount>, StoreError> {
        let tags = sqlx::query_as::<_, TagWithCount>(
            r#"
            SELECT t.id, t.name, t.slug, COUNT(ct.content_id) AS content_count
            FROM tags t
            LEFT JOIN content_tags ct ON ct.tag_id = t.id
            GROUP BY t.id
            ORDER BY content_count DESC, t.name
            "#,
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(tags)
    }

    /// Rename a tag and re-index every content row carrying it.
    pub async fn rename(&self, actor: &Actor, id: i64, name: &str) -> Result<Tag, StoreError> {
        let name = name.trim();
        let slug = generate_slug(name);
        if slug.is_empty() {
            return Err(StoreError::Validation(
                "tag name must contain at least one ASCII letter or digit".to_string(),
            ));
        }

        let mut tx = self.db.begin_write().await?;
        let previous = sqlx::query_scalar::<_, String>("SELECT name FROM tags WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("tag"))?;

        sqlx::query("UPDATE tags SET name = ?, slug = ? WHERE id = ?")
            .bind(name)
            .bind(&slug)
            .bind(id)
            .execute(tx.conn())
            .await?;

        let reindexed = search::sync_tagged(tx.conn(), id).await?;

        let draft = AuditDraft::new("tag_rename", AuditCategory::Tag)
            .entity("tag", id, Some(name))
            .changes(json!({ "name": { "from": previous, "to": name } }));
        audit::record(tx.conn(), actor, &draft).await?;

        let tag = sqlx::query_as::<_, Tag>("SELECT id, name, slug, created_at FROM tags WHERE id = ?")
            .bind(id)
            .fetch_one(tx.conn())
            .await?;
        tx.commit().await?;

        tracing::info!(tag_id = id, reindexed, "Tag renamed");
        Ok(tag)
    }

    /// Delete a tag; junction rows cascade and affected content is re-indexed.
    pub async fn delete(&self, actor: &Actor, id: i64) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM tags WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("tag"))?;

        let affected =
            sqlx::query_scalar::<_, i64>("SELECT content_id FROM content_tags WHERE tag_id = ?")
                .bind(id)
                .fetch_all(tx.conn())
                .await?;

        sqlx::query("DELETE FROM tags WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        for content_id in &affected {
            search::sync_content(tx.conn(), *content_id).await?;
        }

        let draft = AuditDraft::new("tag_delete", AuditCategory::Tag)
            .entity("tag", id, Some(&name))
            .metadata_value("affected_content", json!(affected.len()));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        tracing::info!(tag_id = id, affected = affected.len(), "Tag deleted");
        Ok(())
    }

    /// Delete tags no content refers to.
    pub async fn cleanup_orphaned(&self) -> Result<u64, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let deleted = sqlx::query(
            "DELETE FROM tags WHERE id NOT IN (SELECT DISTINCT tag_id FROM content_tags)",
        )
        .execute(tx.conn())
        .await?
        .rows_affected();
        tx.commit().await?;

        if deleted > 0 {
            tracing::info!(deleted, "Removed orphaned tags");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_trims_dedupes_and_sorts() {
        let names = vec![
            " rust ".to_string(),
            "sqlite".to_string(),
            "rust".to_string(),
            "".to_string(),
        ];
        assert_eq!(normalize_tag_names(&names).unwrap(), vec!["rust", "sqlite"]);
    }

    #[test]
    fn normalize_rejects_unsluggable_names() {
        let names = vec!["!!!".to_string()];
        assert!(matches!(
            normalize_tag_names(&names),
            Err(StoreError::Validation(_))
        ));
    }
}
