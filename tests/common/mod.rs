//! Common test utilities for integration tests

#![allow(dead_code)]

use chrono::{Duration, Utc};
use quillstore::data::{ContentStatus, ContentWithTags, User, UserRole};
use quillstore::service::{Actor, NewContent, NewUser};
use quillstore::{Store, config};
use std::sync::Arc;
use tempfile::TempDir;

/// Store on a fresh database in a temporary directory
pub struct TestStore {
    pub store: Arc<Store>,
    pub _temp_dir: TempDir,
}

impl TestStore {
    /// Open a store with default settings
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    /// Open a store after adjusting the default configuration
    pub async fn with_config(adjust: impl FnOnce(&mut config::AppConfig)) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config::AppConfig::for_database(temp_dir.path().join("test.db"));
        adjust(&mut config);

        let store = Store::open(config).await.unwrap();
        Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        }
    }

    /// Create an admin user and return it with its actor
    pub async fn admin(&self) -> (User, Actor) {
        let user = self
            .store
            .users
            .create(
                &Actor::system(),
                NewUser {
                    username: "admin".to_string(),
                    email: Some("admin@example.com".to_string()),
                    role: UserRole::Admin,
                },
            )
            .await
            .unwrap();
        let actor = Actor::user(&user);
        (user, actor)
    }

    /// Create a draft post with the given title and body
    pub async fn draft(&self, actor: &Actor, title: &str, body: &str) -> ContentWithTags {
        self.store
            .content
            .create(actor, post(title, body))
            .await
            .unwrap()
    }

    /// Count rows of a table
    pub async fn count(&self, table: &str) -> i64 {
        sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(self.store.db.pool())
            .await
            .unwrap()
    }
}

/// Draft post input
pub fn post(title: &str, body: &str) -> NewContent {
    NewContent {
        title: title.to_string(),
        body_markdown: body.to_string(),
        ..NewContent::default()
    }
}

/// Scheduled post input, due `seconds` from now
pub fn scheduled_post(title: &str, seconds: i64) -> NewContent {
    NewContent {
        title: title.to_string(),
        body_markdown: format!("{title} body"),
        status: ContentStatus::Scheduled,
        scheduled_at: Some(Utc::now() + Duration::seconds(seconds)),
        ..NewContent::default()
    }
}
