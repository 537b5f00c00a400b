//! Content lifecycle engine
//!
//! Every mutating write runs as one transaction in this order: snapshot
//! the prior row into `content_versions`, apply the change, re-index the
//! row, prune old versions, append the audit entry, commit. Events go out
//! on the [`EventBus`] only after the commit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sqlx::SqliteConnection;
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft, AuditLog};
use super::events::{ContentEvent, ContentEventKind, EventBus};
use super::lifecycle::{self, ReactivateTarget, Transition};
use super::search;
use super::slug::{generate_slug, validate_slug};
use super::tags::{normalize_tag_names, replace_content_tags, resolve_tag_names, tags_for};
use super::versions;
use crate::config::AppConfig;
use crate::data::{
    Content, ContentStatus, ContentType, ContentWithTags, Database, Metadata, timestamp,
};
use crate::error::{ConstraintViolation, StoreError};
use crate::metrics::{CONTENT_MUTATIONS_TOTAL, SCHEDULED_ACTIVATIONS_TOTAL};

// =============================================================================
// Rendering seam
// =============================================================================

/// Produces `body_html` from `body_markdown`.
///
/// The real Markdown pipeline lives outside the storage core; stored HTML
/// may lag behind until [`ContentService::rerender_all`] runs.
pub trait Renderer: Send + Sync {
    fn render(&self, markdown: &str) -> String;
}

/// Fallback renderer: escaped text, one `<p>` per blank-line block.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParagraphRenderer;

impl Renderer for ParagraphRenderer {
    fn render(&self, markdown: &str) -> String {
        markdown
            .replace("\r\n", "\n")
            .split("\n\n")
            .map(str::trim)
            .filter(|block| !block.is_empty())
            .map(|block| {
                let lines: Vec<String> = block
                    .lines()
                    .map(|line| html_escape::encode_text(line.trim()).into_owned())
                    .collect();
                format!("<p>{}</p>", lines.join("<br>\n"))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

// =============================================================================
// Inputs
// =============================================================================

/// Input for [`ContentService::create`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewContent {
    pub title: String,
    /// Generated from the title when absent
    pub slug: Option<String>,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub body_markdown: String,
    pub excerpt: Option<String>,
    pub featured_image: Option<String>,
    /// draft, scheduled or published
    #[serde(default)]
    pub status: ContentStatus,
    /// Required (and only accepted) for scheduled content
    pub scheduled_at: Option<DateTime<Utc>>,
    pub author_id: Option<i64>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Field edits for [`ContentService::update`]; `None` leaves a field alone.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentPatch {
    pub title: Option<String>,
    pub slug: Option<String>,
    pub content_type: Option<ContentType>,
    pub body_markdown: Option<String>,
    /// `Some(None)` clears the excerpt
    pub excerpt: Option<Option<String>>,
    pub featured_image: Option<Option<String>>,
    pub metadata: Option<Metadata>,
    /// Replaces the whole tag set
    pub tags: Option<Vec<String>>,
    /// Moves the publication time of already scheduled content
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// Listing filter; unset fields match everything.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentFilter {
    pub status: Option<ContentStatus>,
    pub content_type: Option<ContentType>,
    pub author_id: Option<i64>,
    /// Tag slug
    pub tag: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self {
            status: None,
            content_type: None,
            author_id: None,
            tag: None,
            limit: 50,
            offset: 0,
        }
    }
}

/// Outcome of a rerender pass.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RerenderSummary {
    pub scanned: u64,
    pub updated: u64,
}

const LIST_FILTER: &str = "(?1 IS NULL OR c.status = ?1) \
     AND (?2 IS NULL OR c.content_type = ?2) \
     AND (?3 IS NULL OR c.author_id = ?3) \
     AND (?4 IS NULL OR EXISTS ( \
         SELECT 1 FROM content_tags ct JOIN tags t ON t.id = ct.tag_id \
         WHERE ct.content_id = c.id AND t.slug = ?4))";

/// Accumulates `{field: {from, to}}` entries for the audit log.
#[derive(Default)]
struct Changes(Map<String, Value>);

impl Changes {
    fn record<T: Serialize + PartialEq>(&mut self, field: &str, from: &T, to: &T) -> bool {
        if from == to {
            return false;
        }
        self.0
            .insert(field.to_string(), json!({ "from": from, "to": to }));
        true
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

// =============================================================================
// Service
// =============================================================================

/// Content lifecycle service
pub struct ContentService {
    db: Arc<Database>,
    config: Arc<AppConfig>,
    renderer: Arc<dyn Renderer>,
    events: EventBus,
    audit: AuditLog,
}

impl ContentService {
    pub fn new(
        db: Arc<Database>,
        config: Arc<AppConfig>,
        renderer: Arc<dyn Renderer>,
        events: EventBus,
    ) -> Self {
        let audit = AuditLog::new(db.clone());
        Self {
            db,
            config,
            renderer,
            events,
            audit,
        }
    }

    /// Shared configuration; the maintenance job reads the same values.
    pub fn config(&self) -> &Arc<AppConfig> {
        &self.config
    }

    fn retention(&self) -> usize {
        self.config.content.version_retention
    }

    fn batch_size(&self) -> u32 {
        self.config.scheduler.sweep_batch_size.max(1)
    }

    // =========================================================================
    // Validation
    // =========================================================================

    fn validate_title(&self, title: &str) -> Result<(), StoreError> {
        if title.trim().is_empty() {
            return Err(StoreError::Validation("title cannot be empty".to_string()));
        }
        if title.chars().count() > self.config.content.max_title_length {
            return Err(StoreError::Validation(format!(
                "title must be {} characters or less",
                self.config.content.max_title_length
            )));
        }
        Ok(())
    }

    fn validate_body(&self, body: &str) -> Result<(), StoreError> {
        if body.len() > self.config.content.max_body_length {
            return Err(StoreError::Validation(format!(
                "body must be {} bytes or less",
                self.config.content.max_body_length
            )));
        }
        Ok(())
    }

    fn validate_excerpt(&self, excerpt: Option<&str>) -> Result<(), StoreError> {
        if excerpt.is_some_and(|e| e.chars().count() > self.config.content.max_excerpt_length) {
            return Err(StoreError::Validation(format!(
                "excerpt must be {} characters or less",
                self.config.content.max_excerpt_length
            )));
        }
        Ok(())
    }

    fn resolve_slug(slug: Option<&str>, title: &str) -> Result<String, StoreError> {
        let slug = match slug {
            Some(slug) => slug.trim().to_string(),
            None => generate_slug(title),
        };
        if !validate_slug(&slug) {
            return Err(StoreError::Validation(format!(
                "invalid slug '{slug}': use 1-200 lowercase letters, digits and hyphens"
            )));
        }
        Ok(slug)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Create a content item as draft, scheduled or published.
    pub async fn create(
        &self,
        actor: &Actor,
        input: NewContent,
    ) -> Result<ContentWithTags, StoreError> {
        let result = self.create_inner(actor, input).await;
        self.audit_rejection(actor, "create", None, result).await
    }

    async fn create_inner(
        &self,
        actor: &Actor,
        input: NewContent,
    ) -> Result<ContentWithTags, StoreError> {
        self.validate_title(&input.title)?;
        self.validate_body(&input.body_markdown)?;
        self.validate_excerpt(input.excerpt.as_deref())?;
        let slug = Self::resolve_slug(input.slug.as_deref(), &input.title)?;
        let tags = normalize_tag_names(&input.tags)?;

        let now = Utc::now();
        let (scheduled_at, published_at) = match input.status {
            ContentStatus::Draft => (None, None),
            ContentStatus::Published => (None, Some(now)),
            ContentStatus::Scheduled => match input.scheduled_at {
                Some(at) if at > now => (Some(at), None),
                Some(_) => return Err(ConstraintViolation::ScheduleInPast.into()),
                None => {
                    return Err(StoreError::Validation(
                        "scheduled content requires scheduled_at".to_string(),
                    ));
                }
            },
            ContentStatus::Archived => {
                return Err(StoreError::Validation(
                    "new content must be draft, scheduled or published".to_string(),
                ));
            }
        };
        if input.status != ContentStatus::Scheduled && input.scheduled_at.is_some() {
            return Err(ConstraintViolation::ScheduleRequiresTransition(input.status).into());
        }

        let body_html = self.renderer.render(&input.body_markdown);
        let metadata = encode_metadata(&input.metadata)?;

        let mut tx = self.db.begin_write().await?;
        ensure_slug_free(tx.conn(), &slug, None).await?;

        let id = sqlx::query(
            r#"
            INSERT INTO content (
                slug, title, content_type, body_markdown, body_html, excerpt,
                featured_image, status, scheduled_at, published_at, author_id,
                metadata, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&slug)
        .bind(input.title.trim())
        .bind(input.content_type.as_str())
        .bind(&input.body_markdown)
        .bind(&body_html)
        .bind(&input.excerpt)
        .bind(&input.featured_image)
        .bind(input.status.as_str())
        .bind(scheduled_at.map(timestamp))
        .bind(published_at.map(timestamp))
        .bind(input.author_id)
        .bind(metadata)
        .bind(timestamp(now))
        .bind(timestamp(now))
        .execute(tx.conn())
        .await
        .map_err(|e| slug_conflict(e, &slug))?
        .last_insert_rowid();

        replace_content_tags(tx.conn(), id, &tags).await?;
        search::sync_content(tx.conn(), id).await?;

        let content = load(tx.conn(), id).await?;
        let draft = AuditDraft::new("create", AuditCategory::Content)
            .entity("content", id, Some(&content.title))
            .metadata_value("status", json!(content.status))
            .metadata_value("slug", json!(content.slug));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        CONTENT_MUTATIONS_TOTAL.with_label_values(&["create"]).inc();
        tracing::info!(content_id = id, slug = %content.slug, status = %content.status, "Content created");

        if content.status == ContentStatus::Published {
            self.events
                .publish(ContentEvent::new(ContentEventKind::Published, &content));
        }
        Ok(ContentWithTags { content, tags })
    }

    /// Apply field edits.
    ///
    /// An empty or no-op patch writes nothing and creates no version.
    pub async fn update(
        &self,
        actor: &Actor,
        id: i64,
        patch: ContentPatch,
    ) -> Result<ContentWithTags, StoreError> {
        let result = self.update_inner(actor, id, patch).await;
        self.audit_rejection(actor, "update", Some(id), result).await
    }

    async fn update_inner(
        &self,
        actor: &Actor,
        id: i64,
        patch: ContentPatch,
    ) -> Result<ContentWithTags, StoreError> {
        if let Some(title) = &patch.title {
            self.validate_title(title)?;
        }
        if let Some(body) = &patch.body_markdown {
            self.validate_body(body)?;
        }
        if let Some(excerpt) = &patch.excerpt {
            self.validate_excerpt(excerpt.as_deref())?;
        }
        let new_slug = match &patch.slug {
            Some(slug) => Some(Self::resolve_slug(Some(slug), "")?),
            None => None,
        };
        let new_tags = patch.tags.as_deref().map(normalize_tag_names).transpose()?;

        let mut tx = self.db.begin_write().await?;
        let current = load(tx.conn(), id).await?;
        let current_tags = tags_for(tx.conn(), id).await?;
        let now = Utc::now();

        if let Some(at) = patch.scheduled_at {
            if current.status != ContentStatus::Scheduled {
                return Err(ConstraintViolation::ScheduleRequiresTransition(current.status).into());
            }
            if at <= now {
                return Err(ConstraintViolation::ScheduleInPast.into());
            }
        }

        let mut next = current.clone();
        let mut changes = Changes::default();

        if let Some(title) = patch.title {
            next.title = title.trim().to_string();
            changes.record("title", &current.title, &next.title);
        }
        if let Some(slug) = new_slug {
            next.slug = slug;
            changes.record("slug", &current.slug, &next.slug);
        }
        if let Some(content_type) = patch.content_type {
            next.content_type = content_type;
            changes.record("content_type", &current.content_type, &next.content_type);
        }
        let body_changed = match patch.body_markdown {
            Some(body) => {
                next.body_markdown = body;
                changes.record("body_markdown", &current.body_markdown, &next.body_markdown)
            }
            None => false,
        };
        if let Some(excerpt) = patch.excerpt {
            next.excerpt = excerpt;
            changes.record("excerpt", &current.excerpt, &next.excerpt);
        }
        if let Some(featured_image) = patch.featured_image {
            next.featured_image = featured_image;
            changes.record("featured_image", &current.featured_image, &next.featured_image);
        }
        if let Some(metadata) = patch.metadata {
            next.metadata = metadata;
            changes.record("metadata", &current.metadata, &next.metadata);
        }
        if let Some(at) = patch.scheduled_at {
            next.scheduled_at = Some(at);
            changes.record("scheduled_at", &current.scheduled_at, &next.scheduled_at);
        }
        // Names are compared as stored; "Rust" resolves to an existing "rust"
        let new_tags = match new_tags {
            Some(tags) => Some(resolve_tag_names(tx.conn(), &tags).await?),
            None => None,
        };
        let tags_changed = match &new_tags {
            Some(tags) => changes.record("tags", &current_tags, tags),
            None => false,
        };

        if changes.is_empty() {
            return Ok(ContentWithTags {
                content: current,
                tags: current_tags,
            });
        }

        if next.slug != current.slug {
            ensure_slug_free(tx.conn(), &next.slug, Some(id)).await?;
        }
        if body_changed {
            next.body_html = self.renderer.render(&next.body_markdown);
        }

        versions::snapshot(tx.conn(), &current, actor.user_id).await?;
        write_fields(tx.conn(), &next, now).await?;
        if tags_changed {
            if let Some(tags) = &new_tags {
                replace_content_tags(tx.conn(), id, tags).await?;
            }
        }
        search::sync_content(tx.conn(), id).await?;
        versions::prune(tx.conn(), id, self.retention()).await;

        let content = load(tx.conn(), id).await?;
        let tags = tags_for(tx.conn(), id).await?;
        let draft = AuditDraft::new("update", AuditCategory::Content)
            .entity("content", id, Some(&content.title))
            .changes(changes.into_value());
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        CONTENT_MUTATIONS_TOTAL.with_label_values(&["update"]).inc();
        tracing::info!(content_id = id, "Content updated");
        self.events
            .publish(ContentEvent::new(ContentEventKind::Updated, &content));
        Ok(ContentWithTags { content, tags })
    }

    pub async fn schedule(
        &self,
        actor: &Actor,
        id: i64,
        at: DateTime<Utc>,
    ) -> Result<Content, StoreError> {
        self.transition(actor, id, Transition::Schedule(at)).await
    }

    pub async fn publish(&self, actor: &Actor, id: i64) -> Result<Content, StoreError> {
        self.transition(actor, id, Transition::Publish).await
    }

    pub async fn archive(&self, actor: &Actor, id: i64) -> Result<Content, StoreError> {
        self.transition(actor, id, Transition::Archive).await
    }

    pub async fn unpublish(&self, actor: &Actor, id: i64) -> Result<Content, StoreError> {
        self.transition(actor, id, Transition::Unpublish).await
    }

    /// Bring archived content back as draft, published or scheduled.
    pub async fn reactivate(
        &self,
        actor: &Actor,
        id: i64,
        target: ReactivateTarget,
    ) -> Result<Content, StoreError> {
        self.transition(actor, id, Transition::Reactivate(target))
            .await
    }

    /// Apply one status transition; see [`lifecycle`] for the matrix.
    pub async fn transition(
        &self,
        actor: &Actor,
        id: i64,
        transition: Transition,
    ) -> Result<Content, StoreError> {
        let result = self
            .transition_inner(actor, id, transition, Utc::now())
            .await;
        self.audit_rejection(actor, transition.action(), Some(id), result)
            .await
    }

    async fn transition_inner(
        &self,
        actor: &Actor,
        id: i64,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<Content, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let current = load(tx.conn(), id).await?;
        let content = apply_transition(
            tx.conn(),
            actor,
            &current,
            transition,
            now,
            self.retention(),
        )
        .await?;
        tx.commit().await?;

        self.after_transition(&current, &content, transition);
        Ok(content)
    }

    fn after_transition(&self, before: &Content, after: &Content, transition: Transition) {
        CONTENT_MUTATIONS_TOTAL
            .with_label_values(&[transition.action()])
            .inc();
        tracing::info!(
            content_id = after.id,
            from = %before.status,
            to = %after.status,
            "Content status changed"
        );

        let kind = if after.status == ContentStatus::Published {
            ContentEventKind::Published
        } else {
            ContentEventKind::Updated
        };
        self.events.publish(ContentEvent::new(kind, after));
    }

    /// Publish every scheduled row due at `now`.
    ///
    /// Works in transactions of at most `batch_size` rows. Calling it
    /// again for the same instant finds nothing left to do.
    pub async fn activate_due_scheduled_content(
        &self,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let actor = Actor::system();
        let mut activated = 0;

        loop {
            let mut tx = self.db.begin_write().await?;
            let due = sqlx::query_as::<_, Content>(
                "SELECT * FROM content \
                 WHERE status = 'scheduled' AND scheduled_at <= ? \
                 ORDER BY scheduled_at, id LIMIT ?",
            )
            .bind(timestamp(now))
            .bind(self.batch_size() as i64)
            .fetch_all(tx.conn())
            .await?;

            let mut published = Vec::with_capacity(due.len());
            for current in &due {
                let content = apply_transition(
                    tx.conn(),
                    &actor,
                    current,
                    Transition::Activate,
                    now,
                    self.retention(),
                )
                .await?;
                published.push((current, content));
            }
            tx.commit().await?;

            for (before, after) in &published {
                SCHEDULED_ACTIVATIONS_TOTAL.inc();
                self.after_transition(before, after, Transition::Activate);
            }
            activated += published.len();

            if due.len() < self.batch_size() as usize {
                break;
            }
        }

        if activated > 0 {
            tracing::info!(activated, "Scheduled content published");
        }
        Ok(activated)
    }

    /// Delete a content item and everything it owns.
    ///
    /// Tags junction rows, versions, series items and preview tokens
    /// cascade; the index entry is removed in the same transaction.
    pub async fn delete(&self, actor: &Actor, id: i64, confirm: bool) -> Result<(), StoreError> {
        let result = self.delete_inner(actor, id, confirm).await;
        self.audit_rejection(actor, "delete", Some(id), result).await
    }

    async fn delete_inner(&self, actor: &Actor, id: i64, confirm: bool) -> Result<(), StoreError> {
        if !confirm {
            return Err(StoreError::ConfirmationRequired(format!(
                "deleting content {id} removes its versions and tags"
            )));
        }

        let mut tx = self.db.begin_write().await?;
        let content = load(tx.conn(), id).await?;

        search::remove_content(tx.conn(), id).await?;
        sqlx::query("DELETE FROM content WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft = AuditDraft::new("delete", AuditCategory::Content)
            .entity("content", id, Some(&content.title))
            .metadata_value("slug", json!(content.slug));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        CONTENT_MUTATIONS_TOTAL.with_label_values(&["delete"]).inc();
        tracing::info!(content_id = id, slug = %content.slug, "Content deleted");
        self.events
            .publish(ContentEvent::new(ContentEventKind::Deleted, &content));
        Ok(())
    }

    /// Restore the fields of version `version_number`.
    ///
    /// The current state is snapshotted first, so restoring never loses a
    /// version.
    pub async fn restore_version(
        &self,
        actor: &Actor,
        id: i64,
        version_number: i64,
    ) -> Result<ContentWithTags, StoreError> {
        let result = self.restore_inner(actor, id, version_number).await;
        self.audit_rejection(actor, "restore", Some(id), result)
            .await
    }

    async fn restore_inner(
        &self,
        actor: &Actor,
        id: i64,
        version_number: i64,
    ) -> Result<ContentWithTags, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let current = load(tx.conn(), id).await?;
        let version = sqlx::query_as::<_, crate::data::ContentVersion>(
            "SELECT * FROM content_versions WHERE content_id = ? AND version_number = ?",
        )
        .bind(id)
        .bind(version_number)
        .fetch_optional(tx.conn())
        .await?
        .ok_or(StoreError::NotFound("content version"))?;

        if version.slug != current.slug {
            ensure_slug_free(tx.conn(), &version.slug, Some(id)).await?;
        }

        let saved_as = versions::snapshot(tx.conn(), &current, actor.user_id).await?;

        let mut next = current.clone();
        next.title = version.title;
        next.slug = version.slug;
        next.body_markdown = version.body_markdown;
        next.body_html = self.renderer.render(&next.body_markdown);
        next.excerpt = version.excerpt;
        next.featured_image = version.featured_image;
        next.metadata = version.metadata;

        let now = Utc::now();
        write_fields(tx.conn(), &next, now).await?;
        replace_content_tags(tx.conn(), id, &version.tags).await?;
        search::sync_content(tx.conn(), id).await?;
        versions::prune(tx.conn(), id, self.retention()).await;

        let content = load(tx.conn(), id).await?;
        let tags = tags_for(tx.conn(), id).await?;
        let draft = AuditDraft::new("restore", AuditCategory::Content)
            .entity("content", id, Some(&content.title))
            .metadata_value("restored_version", json!(version_number))
            .metadata_value("saved_as_version", json!(saved_as));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        CONTENT_MUTATIONS_TOTAL.with_label_values(&["restore"]).inc();
        tracing::info!(content_id = id, version_number, saved_as, "Content version restored");
        self.events
            .publish(ContentEvent::new(ContentEventKind::Updated, &content));
        Ok(ContentWithTags { content, tags })
    }

    /// Recompute `body_html` for every row with the current renderer.
    ///
    /// Derived-field refresh only: no versions, no audit, no events.
    pub async fn rerender_all(&self) -> Result<RerenderSummary, StoreError> {
        let mut summary = RerenderSummary::default();
        let mut after_id = 0i64;

        loop {
            let mut tx = self.db.begin_write().await?;
            let rows = sqlx::query_as::<_, (i64, String, String)>(
                "SELECT id, body_markdown, body_html FROM content WHERE id > ? ORDER BY id LIMIT ?",
            )
            .bind(after_id)
            .bind(self.batch_size() as i64)
            .fetch_all(tx.conn())
            .await?;

            for (id, markdown, stored_html) in &rows {
                let html = self.renderer.render(markdown);
                if html != *stored_html {
                    sqlx::query("UPDATE content SET body_html = ? WHERE id = ?")
                        .bind(&html)
                        .bind(id)
                        .execute(tx.conn())
                        .await?;
                    summary.updated += 1;
                }
            }
            tx.commit().await?;

            summary.scanned += rows.len() as u64;
            match rows.last() {
                Some((id, _, _)) if rows.len() == self.batch_size() as usize => after_id = *id,
                _ => break,
            }
        }

        tracing::info!(scanned = summary.scanned, updated = summary.updated, "Content rerendered");
        Ok(summary)
    }

    /// Record a rejected operation as a failed audit entry, then hand the
    /// original result back. The audit write itself escalates.
    async fn audit_rejection<T>(
        &self,
        actor: &Actor,
        action: &str,
        id: Option<i64>,
        result: Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let error = match result {
            Err(
                error @ (StoreError::Constraint(_)
                | StoreError::Validation(_)
                | StoreError::ConfirmationRequired(_)),
            ) => error,
            other => return other,
        };

        let mut draft = AuditDraft::new(action, AuditCategory::Content).failure(&error.to_string());
        if let Some(id) = id {
            draft = draft.entity("content", id, None);
        }
        self.audit.record_standalone(actor, &draft).await?;
        Err(error)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Any status, archived included.
    pub async fn get(&self, id: i64) -> Result<Option<ContentWithTags>, StoreError> {
        let content = sqlx::query_as::<_, Content>("SELECT * FROM content WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        match content {
            Some(content) => Ok(Some(self.with_tags(content).await?)),
            None => Ok(None),
        }
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Option<ContentWithTags>, StoreError> {
        let content = sqlx::query_as::<_, Content>("SELECT * FROM content WHERE slug = ?")
            .bind(slug)
            .fetch_optional(self.db.pool())
            .await?;
        match content {
            Some(content) => Ok(Some(self.with_tags(content).await?)),
            None => Ok(None),
        }
    }

    /// Admin listing, most recently updated first.
    pub async fn list(&self, filter: &ContentFilter) -> Result<Vec<ContentWithTags>, StoreError> {
        let sql = format!(
            "SELECT c.* FROM content c WHERE {LIST_FILTER} \
             ORDER BY c.updated_at DESC, c.id DESC LIMIT ?5 OFFSET ?6"
        );
        let rows = sqlx::query_as::<_, Content>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.content_type.map(|t| t.as_str()))
            .bind(filter.author_id)
            .bind(filter.tag.as_deref())
            .bind(filter.limit)
            .bind(filter.offset)
            .fetch_all(self.db.pool())
            .await?;
        self.with_tags_all(rows).await
    }

    pub async fn count(&self, filter: &ContentFilter) -> Result<i64, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM content c WHERE {LIST_FILTER}");
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.content_type.map(|t| t.as_str()))
            .bind(filter.author_id)
            .bind(filter.tag.as_deref())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }

    /// Public listing: published only, newest publication first.
    pub async fn list_public(
        &self,
        content_type: Option<ContentType>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<ContentWithTags>, StoreError> {
        let rows = sqlx::query_as::<_, Content>(
            "SELECT * FROM content \
             WHERE status = 'published' AND (?1 IS NULL OR content_type = ?1) \
             ORDER BY published_at DESC, id DESC LIMIT ?2 OFFSET ?3",
        )
        .bind(content_type.map(|t| t.as_str()))
        .bind(limit)
        .bind(offset)
        .fetch_all(self.db.pool())
        .await?;
        self.with_tags_all(rows).await
    }

    async fn with_tags(&self, content: Content) -> Result<ContentWithTags, StoreError> {
        let mut conn = self.db.pool().acquire().await?;
        let tags = tags_for(&mut conn, content.id).await?;
        Ok(ContentWithTags { content, tags })
    }

    async fn with_tags_all(
        &self,
        rows: Vec<Content>,
    ) -> Result<Vec<ContentWithTags>, StoreError> {
        let mut conn = self.db.pool().acquire().await?;
        let mut items = Vec::with_capacity(rows.len());
        for content in rows {
            let tags = tags_for(&mut conn, content.id).await?;
            items.push(ContentWithTags { content, tags });
        }
        Ok(items)
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

async fn load(conn: &mut SqliteConnection, id: i64) -> Result<Content, StoreError> {
    sqlx::query_as::<_, Content>("SELECT * FROM content WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(StoreError::NotFound("content"))
}

async fn ensure_slug_free(
    conn: &mut SqliteConnection,
    slug: &str,
    except_id: Option<i64>,
) -> Result<(), StoreError> {
    let taken = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM content WHERE slug = ? AND (? IS NULL OR id != ?)",
    )
    .bind(slug)
    .bind(except_id)
    .bind(except_id)
    .fetch_one(&mut *conn)
    .await?;

    if taken > 0 {
        return Err(ConstraintViolation::SlugTaken(slug.to_string()).into());
    }
    Ok(())
}

fn slug_conflict(error: sqlx::Error, slug: &str) -> StoreError {
    match StoreError::from(error) {
        StoreError::Constraint(ConstraintViolation::Unique(message))
            if message.contains("content.slug") =>
        {
            ConstraintViolation::SlugTaken(slug.to_string()).into()
        }
        other => other,
    }
}

fn encode_metadata(metadata: &Metadata) -> Result<String, StoreError> {
    serde_json::to_string(metadata).map_err(|e| StoreError::Internal(e.into()))
}

/// Write every editable column of `next`.
async fn write_fields(
    conn: &mut SqliteConnection,
    next: &Content,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE content SET
            title = ?, slug = ?, content_type = ?, body_markdown = ?, body_html = ?,
            excerpt = ?, featured_image = ?, metadata = ?, scheduled_at = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&next.title)
    .bind(&next.slug)
    .bind(next.content_type.as_str())
    .bind(&next.body_markdown)
    .bind(&next.body_html)
    .bind(&next.excerpt)
    .bind(&next.featured_image)
    .bind(encode_metadata(&next.metadata)?)
    .bind(next.scheduled_at.map(timestamp))
    .bind(timestamp(now))
    .bind(next.id)
    .execute(&mut *conn)
    .await
    .map_err(|e| slug_conflict(e, &next.slug))?;
    Ok(())
}

/// Snapshot, move `current` through `transition`, re-index, prune and
/// audit, all on the caller's transaction.
async fn apply_transition(
    conn: &mut SqliteConnection,
    actor: &Actor,
    current: &Content,
    transition: Transition,
    now: DateTime<Utc>,
    retention: usize,
) -> Result<Content, StoreError> {
    let change = lifecycle::plan(current.status, transition, now)?;

    versions::snapshot(conn, current, actor.user_id).await?;
    sqlx::query(
        "UPDATE content SET status = ?, scheduled_at = ?, published_at = ?, updated_at = ? \
         WHERE id = ?",
    )
    .bind(change.status.as_str())
    .bind(change.scheduled_at.map(timestamp))
    .bind(change.published_at(current.published_at).map(timestamp))
    .bind(timestamp(now))
    .bind(current.id)
    .execute(&mut *conn)
    .await?;

    search::sync_content(conn, current.id).await?;
    versions::prune(conn, current.id, retention).await;

    let mut changes = Changes::default();
    changes.record("status", &current.status, &change.status);
    changes.record("scheduled_at", &current.scheduled_at, &change.scheduled_at);

    let mut draft = AuditDraft::new(transition.action(), AuditCategory::Content)
        .entity("content", current.id, Some(&current.title))
        .changes(changes.into_value());
    if transition == Transition::Activate {
        draft = draft.metadata_value("trigger", json!("schedule"));
    }
    audit::record(conn, actor, &draft).await?;

    load(conn, current.id).await
}
