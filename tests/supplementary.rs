//! Series, tokens, webhooks, analytics and scheduler tests

mod common;

use chrono::{Duration, Utc};
use common::{TestStore, scheduled_post};
use quillstore::data::{ContentStatus, DeviceType, SEARCH_INDEX_STALE_KEY};
use quillstore::error::StoreError;
use quillstore::scheduler;
use quillstore::service::analytics::{hour_floor, session_hash};
use quillstore::service::{
    Actor, AuditFilter, DeliveryRecord, ExportFormat, NewApiToken, NewMedia, NewSeries,
    NewWebhook, PageView, WebhookPatch, sign_payload,
};

// =============================================================================
// Series
// =============================================================================

#[tokio::test]
async fn test_series_ordering_and_navigation() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let series = store
        .series
        .create(
            &actor,
            NewSeries {
                title: "Building a Shed".to_string(),
                ..NewSeries::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(series.slug, "building-a-shed");

    let mut parts = Vec::new();
    for n in 1..=3 {
        let id = test.draft(&actor, &format!("Part {n}"), "").await.content.id;
        let position = store.series.add_item(&actor, series.id, id).await.unwrap();
        assert_eq!(position, n);
        parts.push(id);
    }

    let nav = store.series.navigation(parts[1]).await.unwrap().unwrap();
    assert_eq!(nav.position, 2);
    assert_eq!(nav.total, 3);
    assert_eq!(nav.previous.unwrap().content_id, parts[0]);
    assert_eq!(nav.next.unwrap().content_id, parts[2]);

    store
        .series
        .reorder(&actor, series.id, &[parts[2], parts[0], parts[1]])
        .await
        .unwrap();
    let order: Vec<i64> = store
        .series
        .items(series.id)
        .await
        .unwrap()
        .iter()
        .map(|item| item.content_id)
        .collect();
    assert_eq!(order, vec![parts[2], parts[0], parts[1]]);

    // Not a permutation of the items
    let bad = store.series.reorder(&actor, series.id, &[parts[0], parts[1]]).await;
    assert!(matches!(bad, Err(StoreError::Validation(_))));

    store.series.remove_item(&actor, series.id, parts[0]).await.unwrap();
    let positions: Vec<i64> = store
        .series
        .items(series.id)
        .await
        .unwrap()
        .iter()
        .map(|item| item.position)
        .collect();
    assert_eq!(positions, vec![1, 2]);

    let missing = store.series.remove_item(&actor, series.id, parts[0]).await;
    assert!(matches!(missing, Err(StoreError::NotFound(_))));
    assert!(store.series.navigation(parts[0]).await.unwrap().is_none());

    // Deleting content drops its membership
    store.content.delete(&actor, parts[2], true).await.unwrap();
    assert_eq!(store.series.items(series.id).await.unwrap().len(), 1);
}

// =============================================================================
// Tokens
// =============================================================================

#[tokio::test]
async fn test_preview_tokens() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Preview me", "").await.content.id;
    let preview = store.previews.create(id).await.unwrap();
    assert_eq!(store.previews.validate(&preview.token).await.unwrap(), Some(id));
    assert_eq!(store.previews.validate("not-a-token").await.unwrap(), None);

    // Still valid now, gone once its hour has passed
    assert_eq!(store.previews.cleanup_expired(Utc::now()).await.unwrap(), 0);
    let removed = store
        .previews
        .cleanup_expired(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.previews.validate(&preview.token).await.unwrap(), None);
}

#[tokio::test]
async fn test_api_token_lifecycle() {
    let test = TestStore::new().await;
    let (user, actor) = test.admin().await;
    let store = &test.store;

    let issued = store
        .api_tokens
        .create(
            &actor,
            NewApiToken {
                name: "deploy".to_string(),
                permissions: "read,write".to_string(),
                expires_at: None,
            },
        )
        .await
        .unwrap();
    assert!(issued.token.starts_with("qs_"));
    assert!(issued.record.prefix.ends_with("..."));
    assert_ne!(issued.record.token_hash, issued.token);
    assert_eq!(issued.record.created_by, Some(user.id));

    let found = store.api_tokens.validate(&issued.token).await.unwrap().unwrap();
    assert_eq!(found.id, issued.record.id);
    assert!(found.last_used_at.is_some());
    assert!(store.api_tokens.validate("qs_wrong").await.unwrap().is_none());
    assert!(store.api_tokens.validate("no-prefix").await.unwrap().is_none());

    let expired = store
        .api_tokens
        .create(
            &actor,
            NewApiToken {
                name: "old".to_string(),
                permissions: "read".to_string(),
                expires_at: Some(Utc::now() - Duration::minutes(1)),
            },
        )
        .await;
    assert!(matches!(expired, Err(StoreError::Validation(_))));

    store.api_tokens.revoke(&actor, issued.record.id).await.unwrap();
    assert!(store.api_tokens.validate(&issued.token).await.unwrap().is_none());
    assert!(store.api_tokens.list().await.unwrap().is_empty());
    assert!(matches!(
        store.api_tokens.revoke(&actor, issued.record.id).await,
        Err(StoreError::NotFound(_))
    ));
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_webhook_registry_and_deliveries() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let hook = store
        .webhooks
        .create(
            &actor,
            NewWebhook {
                name: "Rebuild site".to_string(),
                url: "https://ci.example.com/hook".to_string(),
                secret: Some("s3cret".to_string()),
                events: vec!["content.published".to_string()],
            },
        )
        .await
        .unwrap();
    let catch_all = store
        .webhooks
        .create(
            &actor,
            NewWebhook {
                name: "Everything".to_string(),
                url: "http://localhost:9000/".to_string(),
                secret: None,
                events: vec!["*".to_string()],
            },
        )
        .await
        .unwrap();

    let published = store.webhooks.subscribed_to("content.published").await.unwrap();
    assert_eq!(published.len(), 2);
    let deleted = store.webhooks.subscribed_to("content.deleted").await.unwrap();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].id, catch_all.id);

    store
        .webhooks
        .update(
            &actor,
            catch_all.id,
            WebhookPatch {
                active: Some(false),
                ..WebhookPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(store.webhooks.subscribed_to("content.deleted").await.unwrap().is_empty());

    let invalid = store
        .webhooks
        .create(
            &actor,
            NewWebhook {
                name: "Bad".to_string(),
                url: "ftp://example.com".to_string(),
                secret: None,
                events: vec!["content.published".to_string()],
            },
        )
        .await;
    assert!(matches!(invalid, Err(StoreError::Validation(_))));

    let payload = r#"{"event":"content.published"}"#;
    let signature = sign_payload("s3cret", payload).unwrap();
    assert!(signature.starts_with("sha256="));

    store
        .webhooks
        .record_delivery(DeliveryRecord {
            webhook_id: hook.id,
            event: "content.published".to_string(),
            payload: payload.to_string(),
            response_status: Some(502),
            response_body: Some("bad gateway".to_string()),
            success: false,
            attempts: 3,
        })
        .await
        .unwrap();
    let deliveries = store.webhooks.deliveries(hook.id, 10).await.unwrap();
    assert_eq!(deliveries.len(), 1);
    assert!(!deliveries[0].success);
    assert_eq!(deliveries[0].attempts, 3);

    store.webhooks.delete(&actor, hook.id).await.unwrap();
    assert_eq!(test.count("webhook_deliveries").await, 0);
    assert!(store.webhooks.get(hook.id).await.unwrap().is_none());
}

// =============================================================================
// Analytics
// =============================================================================

fn view(path: &str, session: &str, status_code: i64, at: chrono::DateTime<Utc>) -> PageView {
    PageView {
        path: path.to_string(),
        device_type: DeviceType::Desktop,
        session_hash: session.to_string(),
        response_time_ms: Some(20),
        status_code,
        timestamp: Some(at),
        ..PageView::default()
    }
}

#[tokio::test]
async fn test_analytics_aggregation_is_idempotent() {
    let test = TestStore::new().await;
    let store = &test.store;

    let now = Utc::now();
    let at = hour_floor(now) - Duration::hours(1) + Duration::minutes(10);
    let alice = session_hash("salt", "203.0.0.0", "Firefox");
    let bob = session_hash("salt", "198.51.0.0", "Safari");

    store.analytics.record_event(&view("/a", &alice, 200, at)).await.unwrap();
    store.analytics.record_event(&view("/a", &alice, 200, at)).await.unwrap();
    store.analytics.record_event(&view("/a", &bob, 500, at)).await.unwrap();
    store.analytics.record_event(&view("/b", &bob, 200, at)).await.unwrap();

    assert_eq!(store.analytics.aggregate_hourly(now).await.unwrap(), 2);
    let first = store.analytics.hourly_stats(at - Duration::hours(1)).await.unwrap();
    assert_eq!(store.analytics.aggregate_hourly(now).await.unwrap(), 2);
    let second = store.analytics.hourly_stats(at - Duration::hours(1)).await.unwrap();
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);

    let page_a = second.iter().find(|s| s.path == "/a").unwrap();
    assert_eq!(page_a.pageviews, 3);
    assert_eq!(page_a.unique_sessions, 2);
    assert_eq!(page_a.error_count, 1);
    assert_eq!(page_a.avg_response_time_ms, Some(20.0));

    let daily = store.analytics.aggregate_daily(at.date_naive()).await.unwrap();
    assert_eq!(daily.total_pageviews, 4);
    assert_eq!(daily.error_count, 1);
    assert_eq!(daily.top_pages[0].path, "/a");
    assert_eq!(daily.top_pages[0].views, 3);

    let stored = store.analytics.daily_stats(5).await.unwrap();
    assert_eq!(stored[0].total_pageviews, 4);
}

#[tokio::test]
async fn test_analytics_content_rollup_and_purge() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Counted", "").await.content.id;
    let now = Utc::now();
    let at = hour_floor(now) - Duration::hours(1);

    let mut counted = view("/counted", "s1", 200, at);
    counted.content_id = Some(id);
    counted.content_type = Some("post".to_string());
    store.analytics.record_event(&counted).await.unwrap();
    store.analytics.aggregate_hourly(now).await.unwrap();
    store.analytics.aggregate_daily(at.date_naive()).await.unwrap();

    let rows = store.analytics.content_daily(id, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].1, 1);

    // Raw events older than the retention window go
    let old = now - Duration::hours(72);
    store.analytics.record_event(&view("/old", "s2", 200, old)).await.unwrap();
    let summary = store.analytics.purge(now).await.unwrap();
    assert_eq!(summary.raw_events, 1);
    assert_eq!(test.count("analytics_events").await, 1);

    let missing_session = store.analytics.record_event(&view("/x", "", 200, now)).await;
    assert!(matches!(missing_session, Err(StoreError::Validation(_))));
}

#[tokio::test]
async fn test_daily_salt_is_stable_within_a_day() {
    let test = TestStore::new().await;
    let analytics = &test.store.analytics;

    let now = Utc::now();
    let first = analytics.daily_salt(now).await.unwrap();
    assert_eq!(analytics.daily_salt(now).await.unwrap(), first);

    let tomorrow = analytics.daily_salt(now + Duration::days(1)).await.unwrap();
    assert_ne!(tomorrow, first);
}

// =============================================================================
// Scheduler
// =============================================================================

#[tokio::test]
async fn test_publish_sweep_job() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = store
        .content
        .create(&actor, scheduled_post("Job", 1))
        .await
        .unwrap()
        .content
        .id;

    let later = Utc::now() + Duration::seconds(5);
    assert_eq!(scheduler::run_publish_sweep(store, later).await.unwrap(), 1);
    assert_eq!(scheduler::run_publish_sweep(store, later).await.unwrap(), 0);

    let content = store.content.get(id).await.unwrap().unwrap().content;
    assert_eq!(content.status, ContentStatus::Published);
}

#[tokio::test]
async fn test_maintenance_pass() {
    let test = TestStore::with_config(|config| config.content.version_retention = 2).await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Maintained", "v0").await.content.id;
    let preview = store.previews.create(id).await.unwrap();
    sqlx::query("UPDATE preview_tokens SET expires_at = '2000-01-01T00:00:00.000Z' WHERE token = ?")
        .bind(&preview.token)
        .execute(store.db.pool())
        .await
        .unwrap();
    store.db.set_setting(SEARCH_INDEX_STALE_KEY, "1").await.unwrap();

    let report = scheduler::run_maintenance(store, Utc::now()).await;
    assert!(report.failures.is_empty(), "{:?}", report.failures);
    assert_eq!(report.daily_rollups, 2);
    assert_eq!(report.preview_tokens_removed, 1);
    assert!(report.search_index_rebuilt);
    assert!(!store.search.is_stale().await.unwrap());
}

// =============================================================================
// Media
// =============================================================================

fn png(filename: &str) -> NewMedia {
    NewMedia {
        filename: filename.to_string(),
        original_name: "holiday.png".to_string(),
        mime_type: "image/png".to_string(),
        size_bytes: 2048,
        alt_text: None,
        width: Some(800),
        height: Some(600),
    }
}

#[tokio::test]
async fn test_media_rows() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let first = store.media.record(&actor, png("0001.png")).await.unwrap();
    let second = store.media.record(&actor, png("0002.png")).await.unwrap();
    assert_eq!(first.width, Some(800));
    assert!(!first.has_webp);

    let duplicate = store.media.record(&actor, png("0001.png")).await;
    assert!(matches!(duplicate, Err(StoreError::Validation(_))));

    let listed: Vec<i64> = store
        .media
        .list(10, 0)
        .await
        .unwrap()
        .iter()
        .map(|m| m.id)
        .collect();
    assert_eq!(listed, vec![second.id, first.id]);

    let updated = store
        .media
        .update_alt(&actor, first.id, "Beach at dusk")
        .await
        .unwrap();
    assert_eq!(updated.alt_text.as_deref(), Some("Beach at dusk"));
    let found = store.media.get_by_filename("0001.png").await.unwrap().unwrap();
    assert_eq!(found.alt_text.as_deref(), Some("Beach at dusk"));

    let removed = store.media.delete(&actor, first.id).await.unwrap();
    assert_eq!(removed.filename, "0001.png");
    assert!(store.media.get_by_filename("0001.png").await.unwrap().is_none());
    assert!(matches!(
        store.media.delete(&actor, first.id).await,
        Err(StoreError::NotFound(_))
    ));

    let media_actions = AuditFilter {
        category: Some(quillstore::service::AuditCategory::Media),
        ..AuditFilter::default()
    };
    assert_eq!(store.audit.count(&media_actions).await.unwrap(), 4);
}

// =============================================================================
// Audit queries
// =============================================================================

#[tokio::test]
async fn test_audit_summary_users_and_export() {
    let test = TestStore::new().await;
    let (user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Audited, with comma", "").await.content.id;
    store.content.publish(&actor, id).await.unwrap();
    // Rejected: published content cannot be published again
    assert!(store.content.publish(&actor, id).await.is_err());

    let summary = store.audit.summary(7, Utc::now()).await.unwrap();
    // user_create by system, create, publish, failed publish
    assert_eq!(summary.total_events, 4);
    assert_eq!(summary.events_today, 4);
    assert_eq!(summary.failed_events, 1);
    assert_eq!(summary.active_users_today, 1);
    assert_eq!(summary.recent_failures.len(), 1);
    assert_eq!(summary.actions[0].action, "publish");
    assert_eq!(summary.actions[0].count, 2);
    assert_eq!(summary.categories[0].category, "content");
    assert_eq!(summary.categories[0].count, 3);

    assert_eq!(store.audit.users().await.unwrap(), vec![(user.id, "admin".to_string())]);

    let content_only = AuditFilter {
        entity_type: Some("content".to_string()),
        ..AuditFilter::default()
    };
    let csv = store.audit.export(&content_only, ExportFormat::Csv).await.unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(
        lines[0],
        "timestamp,user,action,category,entity_type,entity_id,entity_title,status,ip_address"
    );
    assert_eq!(lines.len(), 4);
    assert!(lines[3].contains("\"Audited, with comma\""));
    assert!(lines[1].contains(",failure,"));

    let json = store.audit.export(&content_only, ExportFormat::Json).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.as_array().unwrap().len(), 3);

    // The system actor has no user id and is not listed
    store
        .users
        .create(
            &Actor::system(),
            quillstore::service::NewUser {
                username: "writer".to_string(),
                email: None,
                role: quillstore::data::UserRole::Author,
            },
        )
        .await
        .unwrap();
    assert_eq!(store.audit.users().await.unwrap().len(), 1);
}
