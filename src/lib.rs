//! Quillstore - storage core of a personal content-management system
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Callers (web layer, CLI, jobs)               │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Service Layer                            │
//! │  - Content lifecycle, versions, tags, series                │
//! │  - Search index sync, audit recorder, event bus             │
//! │  - Tokens, webhooks, media, analytics                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Data Layer                              │
//! │  - SQLite (sqlx), WAL, write gate                           │
//! │  - Versioned schema with catalog verification              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `schema`: migrations, index/trigger catalog, migrator
//! - `data`: database handle and row models
//! - `service`: business logic
//! - `scheduler`: periodic jobs
//! - `config`: configuration management
//! - `error`: error types
//! - `metrics`: Prometheus metrics

pub mod config;
pub mod data;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod schema;
pub mod service;

use std::sync::Arc;

use service::{
    AnalyticsService, ApiTokens, AuditLog, ContentService, EventBus, MediaStore,
    ParagraphRenderer, PreviewTokens, Renderer, SearchIndex, SeriesService, TagService,
    UserService, VersionStore, WebhookService,
};

/// Opened store: a migrated database and every service built on it.
///
/// Shared as `Arc<Store>` by the web layer and the scheduler.
pub struct Store {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Database connection pool
    pub db: Arc<data::Database>,

    /// Post-commit content events
    pub events: EventBus,

    pub content: ContentService,
    pub versions: VersionStore,
    pub search: SearchIndex,
    pub audit: AuditLog,
    pub tags: TagService,
    pub series: SeriesService,
    pub users: UserService,
    pub media: MediaStore,
    pub previews: PreviewTokens,
    pub api_tokens: ApiTokens,
    pub webhooks: WebhookService,
    pub analytics: AnalyticsService,
}

impl Store {
    /// Open with the fallback paragraph renderer.
    pub async fn open(config: config::AppConfig) -> Result<Self, error::StoreError> {
        Self::open_with_renderer(config, Arc::new(ParagraphRenderer)).await
    }

    /// Initialize the store
    ///
    /// # Steps
    /// 1. Validate configuration
    /// 2. Connect to SQLite and apply pending migrations
    /// 3. Heal a search index left stale by an earlier run
    /// 4. Build services
    ///
    /// # Errors
    /// Returns error if configuration is invalid or the schema cannot be
    /// brought to the latest version
    pub async fn open_with_renderer(
        config: config::AppConfig,
        renderer: Arc<dyn Renderer>,
    ) -> Result<Self, error::StoreError> {
        tracing::info!("Opening store...");
        config.validate()?;

        // 1. Connect and migrate
        let db = Arc::new(data::Database::connect(&config.database).await?);

        // 2. Search index
        let search = SearchIndex::new(db.clone());
        if search.heal_if_stale().await? {
            tracing::info!("Stale search index rebuilt at startup");
        }

        // 3. Services; one shared config drives inline pruning and the jobs
        let config = Arc::new(config);
        let events = EventBus::default();
        let content = ContentService::new(db.clone(), config.clone(), renderer, events.clone());

        tracing::info!("Store opened");

        Ok(Self {
            versions: VersionStore::new(db.clone()),
            audit: AuditLog::new(db.clone()),
            tags: TagService::new(db.clone()),
            series: SeriesService::new(db.clone()),
            users: UserService::new(db.clone()),
            media: MediaStore::new(db.clone()),
            previews: PreviewTokens::new(db.clone()),
            api_tokens: ApiTokens::new(db.clone()),
            webhooks: WebhookService::new(db.clone()),
            analytics: AnalyticsService::new(db.clone(), config.analytics.clone()),
            config,
            db,
            events,
            content,
            search,
        })
    }

    /// Close the pool; pending writers finish first.
    pub async fn close(&self) {
        self.db.close().await;
    }
}
