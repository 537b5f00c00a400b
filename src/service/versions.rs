//! Content versions
//!
//! A version is a pre-mutation snapshot: version N holds the state that
//! existed before the Nth change. Numbers start at 1 and only grow;
//! retention pruning drops the oldest ones.

use serde::Serialize;
use sqlx::{Connection, SqliteConnection};
use std::sync::Arc;

use super::tags::tags_for;
use crate::data::{Content, ContentVersion, ContentVersionSummary, Database, now_timestamp};
use crate::error::StoreError;
use crate::metrics::RETENTION_PRUNE_FAILURES_TOTAL;

/// Snapshot `content` (as currently stored) and its tags.
///
/// Returns the new version number.
pub async fn snapshot(
    conn: &mut SqliteConnection,
    content: &Content,
    created_by: Option<i64>,
) -> Result<i64, StoreError> {
    let tags = tags_for(conn, content.id).await?;
    let tags_json = serde_json::to_string(&tags).map_err(|e| StoreError::Internal(e.into()))?;
    let metadata =
        serde_json::to_string(&content.metadata).map_err(|e| StoreError::Internal(e.into()))?;

    let version_number = sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM content_versions WHERE content_id = ?",
    )
    .bind(content.id)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO content_versions (
            content_id, version_number, title, slug, body_markdown, excerpt,
            featured_image, metadata, tags_json, created_by, created_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(content.id)
    .bind(version_number)
    .bind(&content.title)
    .bind(&content.slug)
    .bind(&content.body_markdown)
    .bind(&content.excerpt)
    .bind(&content.featured_image)
    .bind(metadata)
    .bind(tags_json)
    .bind(created_by)
    .bind(now_timestamp())
    .execute(&mut *conn)
    .await?;

    tracing::debug!(content_id = content.id, version_number, "Content version created");
    Ok(version_number)
}

/// Keep only the newest `retention` versions of one content row.
///
/// Runs in a savepoint. A failure is logged and counted but never fails
/// the write it is attached to; the maintenance job prunes again later.
pub async fn prune(conn: &mut SqliteConnection, content_id: i64, retention: usize) -> u64 {
    if retention == 0 {
        return 0;
    }

    let result: Result<u64, sqlx::Error> = async {
        let mut savepoint = conn.begin().await?;
        let deleted = sqlx::query(
            r#"
            DELETE FROM content_versions
            WHERE content_id = ?1
              AND version_number <= (
                  SELECT MAX(version_number) FROM content_versions WHERE content_id = ?1
              ) - ?2
            "#,
        )
        .bind(content_id)
        .bind(retention as i64)
        .execute(&mut *savepoint)
        .await?
        .rows_affected();
        savepoint.commit().await?;
        Ok(deleted)
    }
    .await;

    match result {
        Ok(deleted) => deleted,
        Err(error) => {
            RETENTION_PRUNE_FAILURES_TOTAL
                .with_label_values(&["content_versions"])
                .inc();
            tracing::warn!(content_id, %error, "Version pruning failed; will retry");
            0
        }
    }
}

/// Changed fields between two versions.
#[derive(Debug, Clone, Serialize)]
pub struct VersionDiff {
    pub old_version: ContentVersion,
    pub new_version: ContentVersion,
    pub title_changed: bool,
    pub slug_changed: bool,
    pub excerpt_changed: bool,
    pub tags_changed: bool,
    pub body_diff: Vec<DiffLine>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub line_type: DiffLineType,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffLineType {
    Same,
    Added,
    Removed,
}

/// Version history queries.
pub struct VersionStore {
    db: Arc<Database>,
}

impl VersionStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Versions of one content row, newest first.
    pub async fn list_versions(
        &self,
        content_id: i64,
    ) -> Result<Vec<ContentVersionSummary>, StoreError> {
        let versions = sqlx::query_as::<_, ContentVersionSummary>(
            r#"
            SELECT v.id, v.version_number, v.title, v.created_by,
                   u.username AS created_by_username, v.created_at
            FROM content_versions v
            LEFT JOIN users u ON u.id = v.created_by
            WHERE v.content_id = ?
            ORDER BY v.version_number DESC
            "#,
        )
        .bind(content_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(versions)
    }

    pub async fn get_version(
        &self,
        content_id: i64,
        version_number: i64,
    ) -> Result<Option<ContentVersion>, StoreError> {
        let version = sqlx::query_as::<_, ContentVersion>(
            "SELECT * FROM content_versions WHERE content_id = ? AND version_number = ?",
        )
        .bind(content_id)
        .bind(version_number)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(version)
    }

    pub async fn count_versions(&self, content_id: i64) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM content_versions WHERE content_id = ?",
        )
        .bind(content_id)
        .fetch_one(self.db.pool())
        .await?;
        Ok(count)
    }

    pub async fn diff_versions(
        &self,
        content_id: i64,
        old_number: i64,
        new_number: i64,
    ) -> Result<VersionDiff, StoreError> {
        let old_version = self
            .get_version(content_id, old_number)
            .await?
            .ok_or(StoreError::NotFound("content version"))?;
        let new_version = self
            .get_version(content_id, new_number)
            .await?
            .ok_or(StoreError::NotFound("content version"))?;

        let body_diff = line_diff(&old_version.body_markdown, &new_version.body_markdown);

        Ok(VersionDiff {
            title_changed: old_version.title != new_version.title,
            slug_changed: old_version.slug != new_version.slug,
            excerpt_changed: old_version.excerpt != new_version.excerpt,
            tags_changed: old_version.tags != new_version.tags,
            body_diff,
            old_version,
            new_version,
        })
    }

    /// Apply `retention` to every content row at once (maintenance job).
    pub async fn prune_all(&self, retention: usize) -> Result<u64, StoreError> {
        if retention == 0 {
            return Ok(0);
        }

        let mut tx = self.db.begin_write().await?;
        let deleted = sqlx::query(
            r#"
            DELETE FROM content_versions
            WHERE version_number <= (
                SELECT MAX(newest.version_number) FROM content_versions newest
                WHERE newest.content_id = content_versions.content_id
            ) - ?
            "#,
        )
        .bind(retention as i64)
        .execute(tx.conn())
        .await
        .map_err(|e| {
            RETENTION_PRUNE_FAILURES_TOTAL
                .with_label_values(&["content_versions"])
                .inc();
            StoreError::RetentionPrune(e.to_string())
        })?
        .rows_affected();
        tx.commit().await?;

        if deleted > 0 {
            tracing::info!(deleted, retention, "Pruned content versions");
        }
        Ok(deleted)
    }
}

/// Largest LCS table `line_diff` builds; past it the changed middle is
/// reported as one removed block followed by one added block.
const MAX_LCS_CELLS: usize = 4_000_000;

/// Line diff of two texts via longest common subsequence.
///
/// Shared leading and trailing lines are matched first, so the table only
/// covers the changed middle.
pub fn line_diff(old_text: &str, new_text: &str) -> Vec<DiffLine> {
    let old: Vec<&str> = old_text.lines().collect();
    let new: Vec<&str> = new_text.lines().collect();

    let prefix = old
        .iter()
        .zip(new.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = old[prefix..]
        .iter()
        .rev()
        .zip(new[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let old_mid = &old[prefix..old.len() - suffix];
    let new_mid = &new[prefix..new.len() - suffix];

    let line = |line_type, content: &str| DiffLine {
        line_type,
        content: content.to_string(),
    };

    let mut diff = Vec::with_capacity(old.len().max(new.len()));
    diff.extend(old[..prefix].iter().map(|l| line(DiffLineType::Same, l)));

    let (m, n) = (old_mid.len(), new_mid.len());
    let cells = (m + 1).saturating_mul(n + 1);
    if cells > MAX_LCS_CELLS {
        tracing::debug!(old_lines = m, new_lines = n, "Diff too large for LCS, using block diff");
        diff.extend(old_mid.iter().map(|l| line(DiffLineType::Removed, l)));
        diff.extend(new_mid.iter().map(|l| line(DiffLineType::Added, l)));
    } else {
        // lcs[i][j]: common length of old_mid[i..] and new_mid[j..]
        let mut lcs = vec![vec![0usize; n + 1]; m + 1];
        for i in (0..m).rev() {
            for j in (0..n).rev() {
                lcs[i][j] = if old_mid[i] == new_mid[j] {
                    lcs[i + 1][j + 1] + 1
                } else {
                    lcs[i + 1][j].max(lcs[i][j + 1])
                };
            }
        }

        let (mut i, mut j) = (0, 0);
        while i < m && j < n {
            if old_mid[i] == new_mid[j] {
                diff.push(line(DiffLineType::Same, old_mid[i]));
                i += 1;
                j += 1;
            } else if lcs[i + 1][j] >= lcs[i][j + 1] {
                diff.push(line(DiffLineType::Removed, old_mid[i]));
                i += 1;
            } else {
                diff.push(line(DiffLineType::Added, new_mid[j]));
                j += 1;
            }
        }
        diff.extend(old_mid[i..].iter().map(|l| line(DiffLineType::Removed, l)));
        diff.extend(new_mid[j..].iter().map(|l| line(DiffLineType::Added, l)));
    }

    diff.extend(old[old.len() - suffix..].iter().map(|l| line(DiffLineType::Same, l)));
    diff
}
