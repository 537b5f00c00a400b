//! Content lifecycle integration tests

mod common;

use chrono::{Duration, Utc};
use common::{TestStore, post, scheduled_post};
use quillstore::data::{AuditStatus, ContentStatus};
use quillstore::error::{ConstraintViolation, StoreError};
use quillstore::service::{
    Actor, AuditCategory, AuditFilter, ContentEventKind, ContentFilter, ContentPatch, NewContent,
    ReactivateTarget, Transition,
};

#[tokio::test]
async fn test_hello_scenario() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;
    let mut events = store.events.subscribe();

    // Create draft with slug "hello"
    let created = store
        .content
        .create(
            &actor,
            NewContent {
                slug: Some("hello".to_string()),
                tags: vec!["greeting".to_string()],
                ..post("Hello", "First body")
            },
        )
        .await
        .unwrap();
    let id = created.content.id;
    assert_eq!(created.content.status, ContentStatus::Draft);
    assert_eq!(created.tags, vec!["greeting"]);

    // Duplicate slug is rejected
    let duplicate = store
        .content
        .create(
            &actor,
            NewContent {
                slug: Some("hello".to_string()),
                ..post("Another", "")
            },
        )
        .await;
    assert!(matches!(
        duplicate,
        Err(StoreError::Constraint(ConstraintViolation::SlugTaken(_)))
    ));

    // Title update creates exactly one pre-update version
    store
        .content
        .update(
            &actor,
            id,
            ContentPatch {
                title: Some("Hello, world".to_string()),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    let versions = store.versions.list_versions(id).await.unwrap();
    assert_eq!(versions.len(), 1);
    assert_eq!(versions[0].version_number, 1);
    assert_eq!(versions[0].title, "Hello");

    // Schedule, then sweep once due
    let at = Utc::now() + Duration::seconds(1);
    store.content.schedule(&actor, id, at).await.unwrap();
    let activated = store
        .content
        .activate_due_scheduled_content(at + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(activated, 1);

    let published = store.content.get(id).await.unwrap().unwrap().content;
    assert_eq!(published.status, ContentStatus::Published);
    assert!(published.published_at.is_some());
    assert!(published.scheduled_at.is_none());

    let mut published_events = 0;
    while let Ok(event) = events.try_recv() {
        if event.event == ContentEventKind::Published && event.content_id == id {
            published_events += 1;
        }
    }
    assert_eq!(published_events, 1);

    // Delete cascades
    let unconfirmed = store.content.delete(&actor, id, false).await;
    assert!(matches!(unconfirmed, Err(StoreError::ConfirmationRequired(_))));

    store.content.delete(&actor, id, true).await.unwrap();
    assert!(store.content.get(id).await.unwrap().is_none());
    assert_eq!(test.count("content_tags").await, 0);
    assert_eq!(test.count("content_versions").await, 0);
    assert!(store.search.search_all("hello", 10).await.unwrap().is_empty());

    let deletes = store
        .audit
        .list(
            &AuditFilter {
                category: Some(AuditCategory::Content),
                action: Some("delete".to_string()),
                entity_id: Some(id),
                ..AuditFilter::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(deletes.len(), 2);
    assert!(deletes.iter().any(|e| e.error_message.is_none()));
}

#[tokio::test]
async fn test_restore_third_version_at_seventh() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Title 0", "Body 0").await.content.id;
    for n in 1..=7 {
        store
            .content
            .update(
                &actor,
                id,
                ContentPatch {
                    title: Some(format!("Title {n}")),
                    body_markdown: Some(format!("Body {n}")),
                    ..ContentPatch::default()
                },
            )
            .await
            .unwrap();
    }
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 7);

    let third = store.versions.get_version(id, 3).await.unwrap().unwrap();
    assert_eq!(third.title, "Title 2");

    let restored = store.content.restore_version(&actor, id, 3).await.unwrap();
    assert_eq!(restored.content.title, "Title 2");
    assert_eq!(restored.content.body_markdown, "Body 2");
    assert_eq!(restored.content.body_html, "<p>Body 2</p>");

    let eighth = store.versions.get_version(id, 8).await.unwrap().unwrap();
    assert_eq!(eighth.title, "Title 7");
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 8);

    let diff = store.versions.diff_versions(id, 3, 8).await.unwrap();
    assert!(diff.title_changed);
    assert!(!diff.slug_changed);
    assert!(!diff.body_diff.is_empty());
}

#[tokio::test]
async fn test_version_retention_is_bounded_and_gap_free() {
    let test = TestStore::with_config(|config| config.content.version_retention = 3).await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Retained", "v0").await.content.id;
    for n in 1..=6 {
        store
            .content
            .update(
                &actor,
                id,
                ContentPatch {
                    body_markdown: Some(format!("v{n}")),
                    ..ContentPatch::default()
                },
            )
            .await
            .unwrap();
        assert!(store.versions.count_versions(id).await.unwrap() <= 3);
    }

    let numbers: Vec<i64> = store
        .versions
        .list_versions(id)
        .await
        .unwrap()
        .iter()
        .map(|v| v.version_number)
        .collect();
    assert_eq!(numbers, vec![6, 5, 4]);
}

#[tokio::test]
async fn test_empty_patch_writes_nothing() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let created = test.draft(&actor, "Still", "Same").await;
    let id = created.content.id;

    let unchanged = store
        .content
        .update(
            &actor,
            id,
            ContentPatch {
                title: Some("Still".to_string()),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(unchanged.content.updated_at, created.content.updated_at);
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = store
        .content
        .create(&actor, scheduled_post("Soon", 1))
        .await
        .unwrap()
        .content
        .id;
    let later = Utc::now() + Duration::seconds(5);

    assert_eq!(
        store.content.activate_due_scheduled_content(later).await.unwrap(),
        1
    );
    assert_eq!(
        store.content.activate_due_scheduled_content(later).await.unwrap(),
        0
    );
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 1);

    let activations = store
        .audit
        .count(&AuditFilter {
            action: Some("scheduled_publish".to_string()),
            entity_id: Some(id),
            ..AuditFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(activations, 1);
}

#[tokio::test]
async fn test_sweep_processes_in_batches() {
    let test = TestStore::with_config(|config| config.scheduler.sweep_batch_size = 2).await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    for n in 0..5 {
        store
            .content
            .create(&actor, scheduled_post(&format!("Batch {n}"), 1))
            .await
            .unwrap();
    }
    let not_yet = store
        .content
        .create(&actor, scheduled_post("Later", 3600))
        .await
        .unwrap();

    let activated = store
        .content
        .activate_due_scheduled_content(Utc::now() + Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(activated, 5);

    let still_scheduled = store
        .content
        .get(not_yet.content.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_scheduled.content.status, ContentStatus::Scheduled);
}

#[tokio::test]
async fn test_transition_matrix_through_service() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;
    let future = || Utc::now() + Duration::hours(1);

    // Reach each starting status through allowed moves
    async fn at_status(
        test: &TestStore,
        actor: &Actor,
        status: ContentStatus,
        n: usize,
    ) -> i64 {
        let store = &test.store;
        let id = test.draft(actor, &format!("Matrix {status} {n}"), "").await.content.id;
        match status {
            ContentStatus::Draft => {}
            ContentStatus::Scheduled => {
                store
                    .content
                    .schedule(actor, id, Utc::now() + Duration::hours(1))
                    .await
                    .unwrap();
            }
            ContentStatus::Published => {
                store.content.publish(actor, id).await.unwrap();
            }
            ContentStatus::Archived => {
                store.content.archive(actor, id).await.unwrap();
            }
        }
        id
    }

    let cases: Vec<(&str, Transition, &[ContentStatus])> = vec![
        ("schedule", Transition::Schedule(future()), &[ContentStatus::Draft]),
        (
            "publish",
            Transition::Publish,
            &[ContentStatus::Draft, ContentStatus::Scheduled],
        ),
        (
            "archive",
            Transition::Archive,
            &[
                ContentStatus::Draft,
                ContentStatus::Scheduled,
                ContentStatus::Published,
            ],
        ),
        (
            "unpublish",
            Transition::Unpublish,
            &[
                ContentStatus::Scheduled,
                ContentStatus::Published,
                ContentStatus::Archived,
            ],
        ),
        (
            "reactivate",
            Transition::Reactivate(ReactivateTarget::Published),
            &[ContentStatus::Archived],
        ),
    ];

    let mut n = 0;
    for (name, transition, allowed) in cases {
        for from in ContentStatus::ALL {
            n += 1;
            let id = at_status(&test, &actor, from, n).await;
            let result = store.content.transition(&actor, id, transition).await;

            if allowed.contains(&from) {
                let content = result.unwrap_or_else(|e| panic!("{name} from {from}: {e}"));
                assert_eq!(content.status, transition.target(), "{name} from {from}");
            } else {
                assert!(
                    matches!(
                        result,
                        Err(StoreError::Constraint(ConstraintViolation::InvalidTransition { .. }))
                    ),
                    "{name} from {from} should be rejected"
                );
                let unchanged = store.content.get(id).await.unwrap().unwrap();
                assert_eq!(unchanged.content.status, from);
            }
        }
    }
}

#[tokio::test]
async fn test_rejected_transition_is_audited_as_failure() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Draft only", "").await.content.id;
    let result = store.content.unpublish(&actor, id).await;
    assert!(result.is_err());

    let failures = store
        .audit
        .list(
            &AuditFilter {
                action: Some("unpublish".to_string()),
                entity_id: Some(id),
                status: Some(AuditStatus::Failure),
                ..AuditFilter::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].error_message.is_some());
    assert_eq!(failures[0].username.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_scheduled_at_patch_rules() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let draft = test.draft(&actor, "Not scheduled", "").await.content.id;
    let result = store
        .content
        .update(
            &actor,
            draft,
            ContentPatch {
                scheduled_at: Some(Utc::now() + Duration::hours(2)),
                ..ContentPatch::default()
            },
        )
        .await;
    assert!(matches!(
        result,
        Err(StoreError::Constraint(
            ConstraintViolation::ScheduleRequiresTransition(ContentStatus::Draft)
        ))
    ));

    let scheduled = store
        .content
        .create(&actor, scheduled_post("Scheduled", 3600))
        .await
        .unwrap()
        .content
        .id;
    let moved_to = Utc::now() + Duration::hours(3);
    let moved = store
        .content
        .update(
            &actor,
            scheduled,
            ContentPatch {
                scheduled_at: Some(moved_to),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        moved.content.scheduled_at.map(|t| t.timestamp_millis()),
        Some(moved_to.timestamp_millis())
    );

    let past = store
        .content
        .update(
            &actor,
            scheduled,
            ContentPatch {
                scheduled_at: Some(Utc::now() - Duration::seconds(1)),
                ..ContentPatch::default()
            },
        )
        .await;
    assert!(matches!(
        past,
        Err(StoreError::Constraint(ConstraintViolation::ScheduleInPast))
    ));
}

#[tokio::test]
async fn test_listing_filters_and_public_view() {
    let test = TestStore::new().await;
    let (user, actor) = test.admin().await;
    let store = &test.store;

    let published = store
        .content
        .create(
            &actor,
            NewContent {
                status: ContentStatus::Published,
                author_id: Some(user.id),
                tags: vec!["rust".to_string()],
                ..post("Published post", "")
            },
        )
        .await
        .unwrap();
    let archived = test.draft(&actor, "Archived post", "").await.content.id;
    store.content.archive(&actor, archived).await.unwrap();
    test.draft(&actor, "Draft post", "").await;

    let public = store.content.list_public(None, 10, 0).await.unwrap();
    assert_eq!(public.len(), 1);
    assert_eq!(public[0].content.id, published.content.id);

    let by_tag = store
        .content
        .list(&ContentFilter {
            tag: Some("rust".to_string()),
            ..ContentFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(by_tag.len(), 1);

    let archived_count = store
        .content
        .count(&ContentFilter {
            status: Some(ContentStatus::Archived),
            ..ContentFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(archived_count, 1);

    // Archived content stays readable by id
    assert!(store.content.get(archived).await.unwrap().is_some());
    let by_slug = store.content.get_by_slug("published-post").await.unwrap();
    assert_eq!(by_slug.unwrap().tags, vec!["rust"]);
}

#[tokio::test]
async fn test_deleting_author_keeps_content_and_audit_identity() {
    let test = TestStore::new().await;
    let (user, actor) = test.admin().await;
    let store = &test.store;

    let id = store
        .content
        .create(
            &actor,
            NewContent {
                author_id: Some(user.id),
                ..post("Orphaned", "")
            },
        )
        .await
        .unwrap()
        .content
        .id;

    store.users.delete(&Actor::system(), user.id).await.unwrap();

    let content = store.content.get(id).await.unwrap().unwrap().content;
    assert_eq!(content.author_id, None);

    let entries = store
        .audit
        .list(
            &AuditFilter {
                action: Some("create".to_string()),
                entity_type: Some("content".to_string()),
                entity_id: Some(id),
                ..AuditFilter::default()
            },
            10,
            0,
        )
        .await
        .unwrap();
    assert_eq!(entries[0].user_id, None);
    assert_eq!(entries[0].username.as_deref(), Some("admin"));
}

#[tokio::test]
async fn test_rerender_updates_stale_html_only() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Render", "Some text").await.content.id;
    test.draft(&actor, "Fresh", "Fine").await;
    sqlx::query("UPDATE content SET body_html = 'stale' WHERE id = ?")
        .bind(id)
        .execute(store.db.pool())
        .await
        .unwrap();

    let summary = store.content.rerender_all().await.unwrap();
    assert_eq!(summary.scanned, 2);
    assert_eq!(summary.updated, 1);

    let content = store.content.get(id).await.unwrap().unwrap().content;
    assert_eq!(content.body_html, "<p>Some text</p>");
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_rerender_keeps_updated_at() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test.draft(&actor, "Old post", "Body").await.content.id;
    sqlx::query(
        "UPDATE content SET body_html = 'stale', updated_at = '2000-01-01T00:00:00.000Z' WHERE id = ?",
    )
    .bind(id)
    .execute(store.db.pool())
    .await
    .unwrap();

    assert_eq!(store.content.rerender_all().await.unwrap().updated, 1);
    let content = store.content.get(id).await.unwrap().unwrap().content;
    assert_eq!(content.body_html, "<p>Body</p>");
    assert_eq!(content.updated_at.to_rfc3339(), "2000-01-01T00:00:00+00:00");

    // Editing a real field still stamps updated_at
    sqlx::query("UPDATE content SET title = 'Renamed' WHERE id = ?")
        .bind(id)
        .execute(store.db.pool())
        .await
        .unwrap();
    let content = store.content.get(id).await.unwrap().unwrap().content;
    assert!(content.updated_at > Utc::now() - Duration::minutes(1));
}

#[tokio::test]
async fn test_tag_case_change_is_a_noop() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;
    let mut events = store.events.subscribe();

    let id = store
        .content
        .create(
            &actor,
            NewContent {
                tags: vec!["rust".to_string()],
                ..post("Tagged", "Body")
            },
        )
        .await
        .unwrap()
        .content
        .id;

    let unchanged = store
        .content
        .update(
            &actor,
            id,
            ContentPatch {
                tags: Some(vec!["Rust".to_string(), " rust ".to_string()]),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(unchanged.tags, vec!["rust"]);
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 0);
    let updates = AuditFilter {
        action: Some("update".to_string()),
        entity_id: Some(id),
        ..AuditFilter::default()
    };
    assert_eq!(store.audit.count(&updates).await.unwrap(), 0);
    assert!(events.try_recv().is_err());

    // A real addition still versions, keeping the stored spelling
    let changed = store
        .content
        .update(
            &actor,
            id,
            ContentPatch {
                tags: Some(vec!["RUST".to_string(), "SQLite".to_string()]),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(changed.tags, vec!["SQLite", "rust"]);
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 1);

    let entry = store.audit.list(&updates, 1, 0).await.unwrap().remove(0);
    let diff = entry.changes.unwrap();
    assert_eq!(diff["tags"]["from"], serde_json::json!(["rust"]));
    assert_eq!(diff["tags"]["to"], serde_json::json!(["SQLite", "rust"]));
}

#[tokio::test]
async fn test_failed_audit_write_rolls_back_update() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;
    let mut events = store.events.subscribe();

    let id = test.draft(&actor, "Orig", "Body").await.content.id;
    sqlx::query(
        "CREATE TRIGGER reject_audit BEFORE INSERT ON audit_logs \
         BEGIN SELECT RAISE(ABORT, 'audit storage unavailable'); END",
    )
    .execute(store.db.pool())
    .await
    .unwrap();

    let result = store
        .content
        .update(
            &actor,
            id,
            ContentPatch {
                title: Some("Changed".to_string()),
                ..ContentPatch::default()
            },
        )
        .await;
    assert!(matches!(result, Err(StoreError::AuditWrite(_))));

    let content = store.content.get(id).await.unwrap().unwrap().content;
    assert_eq!(content.title, "Orig");
    assert_eq!(store.versions.count_versions(id).await.unwrap(), 0);
    assert!(store.search.search_all("changed", 10).await.unwrap().is_empty());
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_reschedule_prunes_with_shared_retention() {
    let test = TestStore::with_config(|config| config.content.version_retention = 2).await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    // Inline pruning and the maintenance job read one configuration
    assert!(std::sync::Arc::ptr_eq(&store.config, store.content.config()));

    let id = store
        .content
        .create(&actor, scheduled_post("Launch", 3600))
        .await
        .unwrap()
        .content
        .id;
    for hours in 2..=5 {
        store
            .content
            .update(
                &actor,
                id,
                ContentPatch {
                    scheduled_at: Some(Utc::now() + Duration::hours(hours)),
                    ..ContentPatch::default()
                },
            )
            .await
            .unwrap();
    }

    let numbers: Vec<i64> = store
        .versions
        .list_versions(id)
        .await
        .unwrap()
        .iter()
        .map(|v| v.version_number)
        .collect();
    assert_eq!(numbers, vec![4, 3]);
    assert_eq!(
        store
            .versions
            .prune_all(store.config.content.version_retention)
            .await
            .unwrap(),
        0
    );
}
