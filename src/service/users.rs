//! User identities
//!
//! Only the identity other tables point at lives here. Deleting a user
//! nulls `author_id`, `created_by` and audit `user_id`; the username and
//! role captured in audit rows stay.

use serde::Deserialize;
use std::sync::Arc;

use super::audit::{self, Actor, AuditCategory, AuditDraft};
use crate::data::{Database, User, UserRole, now_timestamp};
use crate::error::{ConstraintViolation, StoreError};

const MAX_USERNAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub username: String,
    pub email: Option<String>,
    pub role: UserRole,
}

fn validate_username(username: &str) -> Result<(), StoreError> {
    if username.is_empty() || username.len() > MAX_USERNAME_LENGTH {
        return Err(StoreError::Validation(format!(
            "username must be 1-{MAX_USERNAME_LENGTH} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        return Err(StoreError::Validation(
            "username may contain only letters, digits, '_', '-' and '.'".to_string(),
        ));
    }
    Ok(())
}

/// User service
pub struct UserService {
    db: Arc<Database>,
}

impl UserService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub async fn create(&self, actor: &Actor, input: NewUser) -> Result<User, StoreError> {
        let username = input.username.trim();
        validate_username(username)?;

        let now = now_timestamp();
        let mut tx = self.db.begin_write().await?;
        let id = sqlx::query(
            "INSERT INTO users (username, email, role, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(&input.email)
        .bind(input.role.as_str())
        .bind(&now)
        .bind(&now)
        .execute(tx.conn())
        .await
        .map_err(|e| match StoreError::from(e) {
            StoreError::Constraint(ConstraintViolation::Unique(_)) => {
                StoreError::Validation(format!("username '{username}' is already taken"))
            }
            other => other,
        })?
        .last_insert_rowid();

        let draft = AuditDraft::new("user_create", AuditCategory::User)
            .entity("user", id, Some(username))
            .metadata_value("role", serde_json::json!(input.role));
        audit::record(tx.conn(), actor, &draft).await?;

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_one(tx.conn())
            .await?;
        tx.commit().await?;

        tracing::info!(user_id = id, username, "User created");
        Ok(user)
    }

    pub async fn get(&self, id: i64) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(user)
    }

    pub async fn list(&self) -> Result<Vec<User>, StoreError> {
        let users = sqlx::query_as::<_, User>("SELECT * FROM users ORDER BY username")
            .fetch_all(self.db.pool())
            .await?;
        Ok(users)
    }

    pub async fn delete(&self, actor: &Actor, id: i64) -> Result<(), StoreError> {
        let mut tx = self.db.begin_write().await?;
        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(tx.conn())
            .await?
            .ok_or(StoreError::NotFound("user"))?;

        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(tx.conn())
            .await?;

        let draft = AuditDraft::new("user_delete", AuditCategory::User)
            .entity("user", id, Some(&user.username));
        audit::record(tx.conn(), actor, &draft).await?;
        tx.commit().await?;

        tracing::info!(user_id = id, username = %user.username, "User deleted");
        Ok(())
    }
}
