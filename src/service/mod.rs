//! Service layer
//!
//! Business logic on top of [`crate::data::Database`]. Write paths share
//! one transaction per operation; helpers that take a
//! `&mut SqliteConnection` run inside the caller's transaction.

pub mod analytics;
pub mod audit;
pub mod content;
pub mod events;
pub mod lifecycle;
pub mod media;
pub mod search;
pub mod series;
pub mod slug;
pub mod tags;
pub mod tokens;
pub mod users;
pub mod versions;
pub mod webhooks;

pub use analytics::{AnalyticsService, PageView, PurgeSummary};
pub use audit::{
    ActionCount, Actor, AuditCategory, AuditDraft, AuditFilter, AuditLog, AuditSummary,
    CategoryCount, ExportFormat,
};
pub use content::{
    ContentFilter, ContentPatch, ContentService, NewContent, ParagraphRenderer, Renderer,
    RerenderSummary,
};
pub use events::{ContentEvent, ContentEventKind, EventBus};
pub use lifecycle::{ReactivateTarget, Transition};
pub use media::{MediaStore, NewMedia};
pub use search::{RebuildSummary, SearchIndex};
pub use series::{NewSeries, SeriesPatch, SeriesService};
pub use tags::TagService;
pub use tokens::{ApiTokens, IssuedApiToken, NewApiToken, PreviewTokens};
pub use users::{NewUser, UserService};
pub use versions::{VersionDiff, VersionStore};
pub use webhooks::{DeliveryRecord, NewWebhook, WebhookPatch, WebhookService, sign_payload};
