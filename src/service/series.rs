//! Content series
//!
//! Items keep contiguous positions starting at 1 within their series.

use serde::Deserialize;
use serde_json::json;
use sqlx::SqliteConnection;
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft};
use super::slug::{generate_slug, validate_slug};
use crate::data::{Database, Series, SeriesItem, SeriesNavigation, SeriesStatus, now_timestamp};
use crate::error::{ConstraintViolation, StoreError};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewSeries {
    pub title: String,
    pub slug: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub status: SeriesStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesPatch {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub description: Option<Option<String>>,
    pub status: Option<SeriesStatus>,
}

const ITEMS_QUERY: &str = r#"
    SELECT si.content_id, si.position, c.title, c.slug, c.status
    FROM series_items si
    JOIN content c ON c.id = si.content_id
    WHERE si.series_id = ?
    ORDER BY si.position
"#;

async fn load_series(conn: &mut SqliteConnection, id: i64) -> Result<Series, StoreError> {
    sqlx::query_as::<_, Series>("SELECT * FROM content_series WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::NotFound("series"))
}

/// Rewrite positions of `series_id` as 1..n in their current order.
async fn renumber(conn: &mut SqliteConnection, series_id: i64) -> Result<(), StoreError> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT content_id FROM series_items WHERE series_id = ? ORDER BY position, id",
    )
    .bind(series_id)
    .fetch_all(&mut *conn)
    .await?;
    write_positions(conn, series_id, &ids).await
}

async fn write_positions(
    conn: &mut SqliteConnection,
    series_id: i64,
    content_ids: &[i64],
) -> Result<(), StoreError> {
    for (index, content_id) in content_ids.iter().enumerate() {
        sqlx::query("UPDATE series_items SET position = ? WHERE series_id = ? AND content_id = ?")
            .bind(index as i64 + 1)
            .bind(series_id)
            .bind(content_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn touch(conn: &mut SqliteConnection, series_id: i64) -> Result<(), StoreError> {
    sqlx::query("UPDATE content_series SET updated_at = ? WHERE id = ?")
        .bind(now_timestamp())
        .bind(series_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

fn slug_conflict(error: sqlx::Error, slug: &str) -> StoreError {
    match StoreError::from(error) {
        StoreError::Constraint(ConstraintViolation::Unique(_)) => {
            ConstraintViolation::SlugTaken(slug.to_string()).into()
        }
        other => other,
    }
}

/// Series service
pub struct SeriesService {
    db: Arc<Database>,
}

impl SeriesService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create(&self, actor: &Actor, input: NewSeries) -> Result<Series, StoreError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(StoreError::Validation("series title cannot be empty".to_string()));
        }
        let slug = input
            .slug
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| generate_slug(title));
        if !validate_slug(&slug) {
            return Err(StoreError::Validation(format!("invalid series slug '{slug}'")));
        }

        let now = now_timestamp();
        let mut tx = self.db.begin_write().await?;
        let id = sqlx::query(
            "INSERT INTO content_series (title, slug, description, status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(title)
        .bind(&slug)
        .bind(&input.description)
        .bind(input.status)
        .bind(&now)
        .bind(&now)
        .execute(tx.conn())
        .await
        .map_err(|e| slug_conflict(e, &slug))?
        .last_insert_rowid();

        let draft = AuditDraft::new("series_create", AuditCategory::Series)
            .entity("series", id, Some(title));
        audit::record(tx.conn(), actor, &draft).await?;
        let series = load_series(tx.conn(), id).await?;
        tx.commit().await?;

        tracing::info!(series_id = id, slug = %series.slug, "Series created");
        Ok(series)
    }

    pub async fn update(
        &self,
        actor: &Actor,
        id: i64,
        patch: SeriesPatch,
    ) -> Result<Series, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let current = load_series(tx.conn(), id).await?;

        let title = match patch.title {
            Some(title) if title.trim().is_empty() => {
                return Err(StoreError::Validation("series title cannot be empty".to_string()));
            }
            Some(title) => title.trim().to_string(),
            None => current.title.clone(),
        };
        let slug = match patch.slug {
            Some(slug) if !validate_slug(slug.trim()) => {
                return Err(StoreError::Validation(format!("invalid series slug '{slug}'")));
            }
            Some(slug) => slug.trim().to_string(),
            None => current.slug.clone(),
        };
        let description = patch.description.unwrap_or_else(|| current.description.clone());
        let status = patch.status.unwrap_or(current.status);

        sqlx::query(
            "UPDATE content_series SET title = ?, slug = ?, description = ?, status = ?, \
             updated_at = ? WHERE id = ?",
        )
        .bind(&title)
        .bind(&slug)
        .bind(&description)
        .bind(status)
        .bind(now_timestamp())
        .bind(id)
        .execute(tx.conn())
        .await
        .map_err(|e| slug_conflict(e, &slug))?;

        let draft = AuditDraft::new("series_update", AuditCategory::Series)
            .entity("series", id, Some(&title))
            .changes(json!({
                "title": { "from": current.title, "to": title },
                "slug": { "from": current.slug, "to": slug },
                "status": { "from": current.status, "to": status },
            }));
        audit::record(tx.conn(), actor, &draft).await?;
        let series = load_series(tx.conn(), id).await?;
        tx.commit().await?;
        Ok(series)
    }

    /// Delete a series; its items cascade, the content rows stay.
    pub async fn delete(&self, actor: &Actor, id: i64) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let series = load_series(tx.conn(), id).await?;
        sqlx::query("DELETE FROM content_series WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft = AuditDraft::new("series_delete", AuditCategory::Series)
            .entity("series", id, Some(&series.title));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        tracing::info!(series_id = id, "Series deleted");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Series>, StoreError> {
        let series = sqlx::query_as::<_, Series>("SELECT * FROM content_series WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(series)
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<Series>, StoreError> {
        let series = sqlx::query_as::<_, Series>("SELECT * FROM content_series WHERE slug = ?")
            .bind(slug)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(series)
    }

    pub async fn list(&self) -> Result<Vec<Series>, StoreError> {
        let series =
            sqlx::query_as::<_, Series>("SELECT * FROM content_series ORDER BY title, id")
                .fetch_all(self.db.pool())
                .await?;
        Ok(series)
    }

    /// Append `content_id` at the end of the series.
    pub async fn add_item(
        &self,
        actor: &Actor,
        series_id: i64,
        content_id: i64,
    ) -> Result<i64, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let series = load_series(tx.conn(), series_id).await?;

        let position = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(position), 0) + 1 FROM series_items WHERE series_id = ?",
        )
        .bind(series_id)
        .fetch_one(tx.conn())
        .await?;

        sqlx::query("INSERT INTO series_items (series_id, content_id, position) VALUES (?, ?, ?)")
            .bind(series_id)
            .bind(content_id)
            .bind(position)
            .execute(tx.conn())
            .await?;
        touch(tx.conn(), series_id).await?;

        let draft = AuditDraft::new("series_add_item", AuditCategory::Series)
            .entity("series", series_id, Some(&series.title))
            .metadata_value("content_id", json!(content_id))
            .metadata_value("position", json!(position));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;
        Ok(position)
    }

    /// Remove one item and close the gap it leaves.
    pub async fn remove_item(
        &self,
        actor: &Actor,
        series_id: i64,
        content_id: i64,
    ) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let series = load_series(tx.conn(), series_id).await?;

        let removed =
            sqlx::query("DELETE FROM series_items WHERE series_id = ? AND content_id = ?")
                .bind(series_id)
                .bind(content_id)
                .execute(tx.conn())
                .await?
                .rows_affected();
        if removed == 0 {
            return Err(StoreError::NotFound("series item"));
        }
        renumber(tx.conn(), series_id).await?;
        touch(tx.conn(), series_id).await?;

        let draft = AuditDraft::new("series_remove_item", AuditCategory::Series)
            .entity("series", series_id, Some(&series.title))
            .metadata_value("content_id", json!(content_id));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Set the order of a series; `content_ids` must list every item once.
    pub async fn reorder(
        &self,
        actor: &Actor,
        series_id: i64,
        content_ids: &[i64],
    ) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let series = load_series(tx.conn(), series_id).await?;

        let mut current = sqlx::query_scalar::<_, i64>(
            "SELECT content_id FROM series_items WHERE series_id = ?",
        )
        .bind(series_id)
        .fetch_all(tx.conn())
        .await?;
        let mut requested = content_ids.to_vec();
        current.sort_unstable();
        requested.sort_unstable();
        if current != requested {
            return Err(StoreError::Validation(
                "reorder must list every item of the series exactly once".to_string(),
            ));
        }

        write_positions(tx.conn(), series_id, content_ids).await?;
        touch(tx.conn(), series_id).await?;

        let draft = AuditDraft::new("series_reorder", AuditCategory::Series)
            .entity("series", series_id, Some(&series.title))
            .metadata_value("order", json!(content_ids));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn items(&self, series_id: i64) -> Result<Vec<SeriesItem>, StoreError> {
        let items = sqlx::query_as::<_, SeriesItem>(ITEMS_QUERY)
            .bind(series_id)
            .fetch_all(self.db.pool())
            .await?;
        Ok(items)
    }

    /// Series membership and neighbours of one content item.
    ///
    /// When the item belongs to several series the lowest series id wins.
    pub async fn navigation(
        &self,
        content_id: i64,
    ) -> Result<Option<SeriesNavigation>, StoreError> {
        let membership = sqlx::query_as::<_, (i64, i64)>(
            "SELECT series_id, position FROM series_items WHERE content_id = ? \
             ORDER BY series_id LIMIT 1",
        )
        .bind(content_id)
        .fetch_optional(self.db.pool())
        .await?;

        let Some((series_id, position)) = membership else {
            return Ok(None);
        };
        let Some(series) = self.get(series_id).await? else {
            return Ok(None);
        };

        let items = self.items(series_id).await?;
        let index = items.iter().position(|item| item.content_id == content_id);
        let previous = index
            .and_then(|i| i.checked_sub(1))
            .and_then(|i| items.get(i).cloned());
        let next = index.and_then(|i| items.get(i + 1).cloned());

        Ok(Some(SeriesNavigation {
            series,
            position,
            total: items.len() as i64,
            previous,
            next,
        }))
    }
}
