//! Webhook registrations and delivery records
//!
//! Network delivery lives outside the storage core. This module stores
//! subscriptions, signs payloads and keeps one delivery row per attempt.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft};
use super::events::ContentEventKind;
use crate::data::{Database, Webhook, WebhookDelivery, now_timestamp};
use crate::error::StoreError;

type HmacSha256 = Hmac<Sha256>;

/// Event names a webhook may subscribe to; `*` matches all.
pub const WEBHOOK_EVENTS: [&str; 3] = [
    ContentEventKind::Published.as_str(),
    ContentEventKind::Updated.as_str(),
    ContentEventKind::Deleted.as_str(),
];

#[derive(Debug, Clone, Deserialize)]
pub struct NewWebhook {
    pub name: String,
    pub url: String,
    pub secret: Option<String>,
    pub events: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebhookPatch {
    pub name: Option<String>,
    pub url: Option<String>,
    pub secret: Option<Option<String>>,
    pub events: Option<Vec<String>>,
    pub active: Option<bool>,
}

/// Outcome of one delivery attempt, reported by the dispatcher.
#[derive(Debug, Clone)]
pub struct DeliveryRecord {
    pub webhook_id: i64,
    pub event: String,
    pub payload: String,
    pub response_status: Option<i64>,
    pub response_body: Option<String>,
    pub success: bool,
    pub attempts: i64,
}

/// `X-Signature` header value: `sha256=` and the lowercase hex HMAC.
pub fn sign_payload(secret: &str, payload: &str) -> Result<String, StoreError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| StoreError::Internal(anyhow::anyhow!(e.to_string())))?;
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256={hex}"))
}

fn validate_url(url: &str) -> Result<(), StoreError> {
    if url.starts_with("https://") || url.starts_with("http://") {
        Ok(())
    } else {
        Err(StoreError::Validation(
            "webhook url must start with http:// or https://".to_string(),
        ))
    }
}

fn encode_events(events: &[String]) -> Result<String, StoreError> {
    let mut names: Vec<&str> = Vec::with_capacity(events.len());
    for event in events.iter().map(|e| e.trim()).filter(|e| !e.is_empty()) {
        if event != "*" && !WEBHOOK_EVENTS.contains(&event) {
            return Err(StoreError::Validation(format!("unknown webhook event '{event}'")));
        }
        if !names.contains(&event) {
            names.push(event);
        }
    }
    if names.is_empty() {
        return Err(StoreError::Validation(
            "webhook must subscribe to at least one event".to_string(),
        ));
    }
    Ok(names.join(","))
}

/// Webhook service
pub struct WebhookService {
    db: Arc<Database>,
}

impl WebhookService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create(&self, actor: &Actor, input: NewWebhook) -> Result<Webhook, StoreError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("webhook name cannot be empty".to_string()));
        }
        validate_url(&input.url)?;
        let events = encode_events(&input.events)?;

        let now = now_timestamp();
        let mut tx = self.db.begin_write().await?;
        let id = sqlx::query(
            "INSERT INTO webhooks (name, url, secret, events, active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(name)
        .bind(&input.url)
        .bind(&input.secret)
        .bind(&events)
        .bind(&now)
        .bind(&now)
        .execute(tx.conn())
        .await?
        .last_insert_rowid();

        let draft = AuditDraft::new("webhook_create", AuditCategory::Webhook)
            .entity("webhook", id, Some(name))
            .metadata_value("events", serde_json::json!(events));
        audit::record(tx.conn(), actor, &draft).await?;
        let webhook = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_one(tx.conn())
            .await?;
        tx.commit().await?;

        tracing::info!(webhook_id = id, "Webhook created");
        Ok(webhook)
    }

    pub async fn update(
        &self,
        actor: &Actor,
        id: i64,
        patch: WebhookPatch,
    ) -> Result<Webhook, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let current = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("webhook"))?;

        if let Some(url) = &patch.url {
            validate_url(url)?;
        }
        let name = patch.name.map(|n| n.trim().to_string()).unwrap_or(current.name);
        if name.is_empty() {
            return Err(StoreError::Validation("webhook name cannot be empty".to_string()));
        }
        let url = patch.url.unwrap_or(current.url);
        let secret = patch.secret.unwrap_or(current.secret);
        let events = encode_events(patch.events.as_deref().unwrap_or(&current.events))?;
        let active = patch.active.unwrap_or(current.active);

        sqlx::query(
            "UPDATE webhooks SET name = ?, url = ?, secret = ?, events = ?, active = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&name)
        .bind(&url)
        .bind(&secret)
        .bind(&events)
        .bind(active)
        .bind(now_timestamp())
        .bind(id)
        .execute(tx.conn())
        .await?;

        let draft = AuditDraft::new("webhook_update", AuditCategory::Webhook)
            .entity("webhook", id, Some(&name))
            .metadata_value("active", serde_json::json!(active));
        audit::record(tx.conn(), actor, &draft).await?;
        let webhook = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_one(tx.conn())
            .await?;
        tx.commit().await?;
        Ok(webhook)
    }

    /// Delete a webhook and its delivery history.
    pub async fn delete(&self, actor: &Actor, id: i64) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("webhook"))?;

        sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft =
            AuditDraft::new("webhook_delete", AuditCategory::Webhook).entity("webhook", id, Some(&name));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        tracing::info!(webhook_id = id, "Webhook deleted");
        Ok(())
    }

    pub async fn get(&self, id: i64) -> Result<Option<Webhook>, StoreError> {
        let webhook = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(webhook)
    }

    pub async fn list(&self) -> Result<Vec<Webhook>, StoreError> {
        let webhooks = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks ORDER BY name, id")
            .fetch_all(self.db.pool())
            .await?;
        Ok(webhooks)
    }

    /// Active webhooks subscribed to `event`.
    pub async fn subscribed_to(&self, event: &str) -> Result<Vec<Webhook>, StoreError> {
        let webhooks = sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE active = 1")
            .fetch_all(self.db.pool())
            .await?;
        Ok(webhooks
            .into_iter()
            .filter(|webhook| webhook.handles_event(event))
            .collect())
    }

    /// Persist a delivery attempt, successful or not.
    pub async fn record_delivery(&self, record: DeliveryRecord) -> Result<i64, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let id = sqlx::query(
            "INSERT INTO webhook_deliveries \
             (webhook_id, event, payload, response_status, response_body, success, attempts, delivered_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(record.webhook_id)
        .bind(&record.event)
        .bind(&record.payload)
        .bind(record.response_status)
        .bind(&record.response_body)
        .bind(record.success)
        .bind(record.attempts.max(1))
        .bind(now_timestamp())
        .execute(tx.conn())
        .await?
        .last_insert_rowid();
        tx.commit().await?;

        if !record.success {
            tracing::warn!(
                webhook_id = record.webhook_id,
                event = %record.event,
                status = ?record.response_status,
                "Webhook delivery failed"
            );
        }
        Ok(id)
    }

    /// Most recent deliveries of one webhook.
    pub async fn deliveries(
        &self,
        webhook_id: i64,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let deliveries = sqlx::query_as::<_, WebhookDelivery>(
            "SELECT * FROM webhook_deliveries WHERE webhook_id = ? \
             ORDER BY delivered_at DESC, id DESC LIMIT ?",
        )
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;
        Ok(deliveries)
    }
}
