//! Media library rows
//!
//! Only metadata is stored here. The upload handler writes the file under
//! a generated name and records it; after [`MediaStore::delete`] returns,
//! the caller removes the file it names.

use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft};
use crate::data::{Database, Media};
use crate::error::{ConstraintViolation, StoreError};

/// 10 MB
pub const MAX_MEDIA_BYTES: i64 = 10 * 1024 * 1024;

pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/gif",
    "image/webp",
    "image/svg+xml",
    "application/pdf",
    "video/mp4",
    "video/webm",
    "audio/mpeg",
    "audio/ogg",
];

#[derive(Debug, Clone, Deserialize)]
pub struct NewMedia {
    /// Stored file name, unique
    pub filename: String,
    /// Name the file was uploaded under
    pub original_name: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub alt_text: Option<String>,
    pub width: Option<i64>,
    pub height: Option<i64>,
}

fn validate(input: &NewMedia) -> Result<(), StoreError> {
    let filename = input.filename.trim();
    if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
        return Err(StoreError::Validation(format!(
            "invalid media filename '{}'",
            input.filename
        )));
    }
    if input.size_bytes < 0 || input.size_bytes > MAX_MEDIA_BYTES {
        return Err(StoreError::Validation(format!(
            "file too large: {} bytes (max {MAX_MEDIA_BYTES} bytes)",
            input.size_bytes
        )));
    }
    if !ALLOWED_MIME_TYPES.contains(&input.mime_type.as_str()) {
        return Err(StoreError::Validation(format!(
            "file type not allowed: {}",
            input.mime_type
        )));
    }
    Ok(())
}

/// Media service
pub struct MediaStore {
    db: Arc<Database>,
}

impl MediaStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Record an uploaded file.
    pub async fn record(&self, actor: &Actor, input: NewMedia) -> Result<Media, StoreError> {
        validate(&input)?;
        let filename = input.filename.trim();

        let mut tx = self.db.begin_write().await?;
        let id = sqlx::query(
            "INSERT INTO media (filename, original_name, mime_type, size_bytes, alt_text, width, height) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(filename)
        .bind(&input.original_name)
        .bind(&input.mime_type)
        .bind(input.size_bytes)
        .bind(&input.alt_text)
        .bind(input.width)
        .bind(input.height)
        .execute(tx.conn())
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Constraint(ConstraintViolation::Unique(_)) => {
                StoreError::Validation(format!("media file '{filename}' already exists"))
            }
            other => other,
        })?
        .last_insert_rowid();

        let draft = AuditDraft::new("media_upload", AuditCategory::Media)
            .entity("media", id, Some(&input.original_name))
            .metadata_value("mime_type", json!(input.mime_type))
            .metadata_value("size_bytes", json!(input.size_bytes));
        audit::record(tx.conn(), actor, &draft).await?;

        let media = sqlx::query_as::<_, Media>("SELECT * FROM media WHERE id = ?")
            .bind(id)
            .fetch_one(tx.conn())
            .await?;
        tx.commit().await?;

        tracing::info!(media_id = id, filename = %media.filename, "Media recorded");
        Ok(media)
    }

    /// Newest first.
    pub async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Media>, StoreError> {
        let media = sqlx::query_as::<_, Media>(
            "SELECT * FROM media ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.pool())
        .await?;
        Ok(media)
    }

    pub async fn get_by_filename(&self, filename: &str) -> Result<Option<Media>, StoreError> {
        let media = sqlx::query_as::<_, Media>("SELECT * FROM media WHERE filename = ?")
            .bind(filename)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(media)
    }

    pub async fn update_alt(
        &self,
        actor: &Actor,
        id: i64,
        alt_text: &str,
    ) -> Result<Media, StoreError> {
        let alt_text = Some(alt_text.trim()).filter(|alt| !alt.is_empty());

        let mut tx = self.db.begin_write().await?;
        let current = sqlx::query_as::<_, Media>("SELECT * FROM media WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("media"))?;

        if current.alt_text.as_deref() == alt_text {
            return Ok(current);
        }

        sqlx::query("UPDATE media SET alt_text = ? WHERE id = ?")
            .bind(alt_text)
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft = AuditDraft::new("media_update", AuditCategory::Media)
            .entity("media", id, Some(&current.original_name))
            .changes(json!({ "alt_text": { "from": current.alt_text, "to": alt_text } }));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        Ok(Media {
            alt_text: alt_text.map(str::to_string),
            ..current
        })
    }

    /// Remove the row and return it so the caller can delete the file.
    pub async fn delete(&self, actor: &Actor, id: i64) -> Result<Media, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let media = sqlx::query_as::<_, Media>("SELECT * FROM media WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("media"))?;

        sqlx::query("DELETE FROM media WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft = AuditDraft::new("media_delete", AuditCategory::Media)
            .entity("media", id, Some(&media.original_name))
            .metadata_value("filename", json!(media.filename));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        tracing::info!(media_id = id, filename = %media.filename, "Media deleted");
        Ok(media)
    }
}
