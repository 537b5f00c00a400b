//! Preview and API tokens
//!
//! Preview tokens are short-lived bearer strings stored as-is. API tokens
//! are shown once; only their SHA-256 hash and a display prefix persist.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft};
use crate::data::{ApiToken, Database, PreviewToken, timestamp};
use crate::error::StoreError;

const PREVIEW_TOKEN_BYTES: usize = 16;
const PREVIEW_TOKEN_TTL_HOURS: i64 = 1;
const API_TOKEN_BYTES: usize = 32;
const API_TOKEN_PREFIX: &str = "qs_";
const DISPLAY_PREFIX_CHARS: usize = 8;

fn random_token(len: usize) -> String {
    let mut bytes = vec![0_u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Stored form of an API token.
pub fn hash_api_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    format!("sha256:{}", general_purpose::URL_SAFE_NO_PAD.encode(digest))
}

fn display_prefix(raw: &str) -> String {
    let head: String = raw.chars().take(DISPLAY_PREFIX_CHARS).collect();
    format!("{head}...")
}

// =============================================================================
// Preview tokens
// =============================================================================

/// Preview token service
pub struct PreviewTokens {
    db: Arc<Database>,
}

impl PreviewTokens {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Issue a one-hour preview token for `content_id`.
    pub async fn create(&self, content_id: i64) -> Result<PreviewToken, StoreError> {
        let token = random_token(PREVIEW_TOKEN_BYTES);
        let now = Utc::now();
        let expires_at = now + Duration::hours(PREVIEW_TOKEN_TTL_HOURS);

        let mut tx = self.db.begin_write().await?;
        sqlx::query(
            "INSERT INTO preview_tokens (token, content_id, expires_at, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&token)
        .bind(content_id)
        .bind(timestamp(expires_at))
        .bind(timestamp(now))
        .execute(tx.conn())
        .await?;
        let preview = sqlx::query_as::<_, PreviewToken>(
            "SELECT * FROM preview_tokens WHERE token = ?",
        )
        .bind(&token)
        .fetch_one(tx.conn())
        .await?;
        tx.commit().await?;

        tracing::debug!(content_id, "Preview token issued");
        Ok(preview)
    }

    /// Content id the token grants access to, if it is still valid.
    pub async fn validate(&self, token: &str) -> Result<Option<i64>, StoreError> {
        let content_id = sqlx::query_scalar::<_, i64>(
            "SELECT content_id FROM preview_tokens WHERE token = ? AND expires_at > ?",
        )
        .bind(token)
        .bind(timestamp(Utc::now()))
        .fetch_optional(self.db.pool())
        .await?;
        Ok(content_id)
    }

    /// Delete tokens expired at `now`.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tx = self.db.begin_write().await?;
        let deleted = sqlx::query("DELETE FROM preview_tokens WHERE expires_at <= ?")
            .bind(timestamp(now))
            .execute(tx.conn())
            .await?
            .rows_affected();
        tx.commit().await?;

        if deleted > 0 {
            tracing::info!(deleted, "Expired preview tokens removed");
        }
        Ok(deleted)
    }
}

// =============================================================================
// API tokens
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct NewApiToken {
    pub name: String,
    /// Comma-separated scopes, e.g. `read` or `read,write`
    pub permissions: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Returned once by [`ApiTokens::create`]; `token` is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedApiToken {
    pub token: String,
    pub record: ApiToken,
}

/// API token service
pub struct ApiTokens {
    db: Arc<Database>,
}

impl ApiTokens {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        actor: &Actor,
        input: NewApiToken,
    ) -> Result<IssuedApiToken, StoreError> {
        let name = input.name.trim();
        if name.is_empty() {
            return Err(StoreError::Validation("token name cannot be empty".to_string()));
        }
        if input.expires_at.is_some_and(|at| at <= Utc::now()) {
            return Err(StoreError::Validation(
                "token expiry must be in the future".to_string(),
            ));
        }

        let raw = format!("{API_TOKEN_PREFIX}{}", random_token(API_TOKEN_BYTES));
        let mut tx = self.db.begin_write().await?;
        let id = sqlx::query(
            "INSERT INTO api_tokens (name, token_hash, prefix, permissions, created_by, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(hash_api_token(&raw))
        .bind(display_prefix(&raw))
        .bind(input.permissions.trim())
        .bind(actor.user_id)
        .bind(input.expires_at.map(timestamp))
        .bind(timestamp(Utc::now()))
        .execute(tx.conn())
        .await?
        .last_insert_rowid();

        let draft = AuditDraft::new("token_create", AuditCategory::Token)
            .entity("api_token", id, Some(name))
            .metadata_value("permissions", serde_json::json!(input.permissions.trim()));
        audit::record(tx.conn(), actor, &draft).await?;

        let record = sqlx::query_as::<_, ApiToken>("SELECT * FROM api_tokens WHERE id = ?")
            .bind(id)
            .fetch_one(tx.conn())
            .await?;
        tx.commit().await?;

        tracing::info!(token_id = id, prefix = %record.prefix, "API token created");
        Ok(IssuedApiToken { token: raw, record })
    }

    /// Look up a presented token and stamp its use.
    ///
    /// Unknown and expired tokens yield `None`.
    pub async fn validate(&self, raw: &str) -> Result<Option<ApiToken>, StoreError> {
        if !raw.starts_with(API_TOKEN_PREFIX) {
            return Ok(None);
        }
        let now = Utc::now();

        let token = sqlx::query_as::<_, ApiToken>(
            "SELECT * FROM api_tokens WHERE token_hash = ? AND (expires_at IS NULL OR expires_at > ?)",
        )
        .bind(hash_api_token(raw))
        .bind(timestamp(now))
        .fetch_optional(self.db.pool())
        .await?;

        let Some(mut token) = token else {
            return Ok(None);
        };

        let mut tx = self.db.begin_write().await?;
        sqlx::query("UPDATE api_tokens SET last_used_at = ? WHERE id = ?")
            .bind(timestamp(now))
            .bind(token.id)
            .execute(tx.conn())
            .await?;
        tx.commit().await?;

        token.last_used_at = Some(now);
        Ok(Some(token))
    }

    pub async fn list(&self) -> Result<Vec<ApiToken>, StoreError> {
        let tokens =
            sqlx::query_as::<_, ApiToken>("SELECT * FROM api_tokens ORDER BY created_at DESC, id DESC")
                .fetch_all(self.db.pool())
                .await?;
        Ok(tokens)
    }

    pub async fn revoke(&self, actor: &Actor, id: i64) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let name = sqlx::query_scalar::<_, String>("SELECT name FROM api_tokens WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("api token"))?;

        sqlx::query("DELETE FROM api_tokens WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft =
            AuditDraft::new("token_revoke", AuditCategory::Token).entity("api_token", id, Some(&name));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        tracing::info!(token_id = id, "API token revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_are_url_safe_and_distinct() {
        let a = random_token(PREVIEW_TOKEN_BYTES);
        let b = random_token(PREVIEW_TOKEN_BYTES);
        assert_ne!(a, b);
        // 16 bytes -> 22 base64 chars without padding
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn api_token_hash_is_stable_and_prefixed() {
        let hash = hash_api_token("qs_example");
        assert!(hash.starts_with("sha256:"));
        assert_eq!(hash, hash_api_token("qs_example"));
        assert_ne!(hash, hash_api_token("qs_other"));
    }

    #[test]
    fn display_prefix_keeps_eight_chars() {
        assert_eq!(display_prefix("qs_abcdefghij"), "qs_abcde...");
    }
}
