//! Search index synchronization tests

mod common;

use common::{TestStore, post};
use quillstore::data::ContentStatus;
use quillstore::service::{ContentPatch, NewContent};

fn ids(rows: &[quillstore::data::Content]) -> Vec<i64> {
    rows.iter().map(|c| c.id).collect()
}

#[tokio::test]
async fn test_index_follows_content_writes() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = test
        .draft(&actor, "Airships", "Notes about the zeppelin hangar")
        .await
        .content
        .id;
    assert_eq!(ids(&store.search.search_all("zeppelin", 10).await.unwrap()), vec![id]);

    // Drafts stay out of the public search
    assert!(store.search.search("zeppelin", 10).await.unwrap().is_empty());
    store.content.publish(&actor, id).await.unwrap();
    assert_eq!(ids(&store.search.search("zeppelin", 10).await.unwrap()), vec![id]);

    store
        .content
        .update(
            &actor,
            id,
            ContentPatch {
                body_markdown: Some("Now about gliders".to_string()),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    assert!(store.search.search_all("zeppelin", 10).await.unwrap().is_empty());
    assert_eq!(ids(&store.search.search_all("gliders", 10).await.unwrap()), vec![id]);

    store.content.delete(&actor, id, true).await.unwrap();
    assert!(store.search.search_all("gliders", 10).await.unwrap().is_empty());
    assert_eq!(test.count("content_fts").await, 0);
}

#[tokio::test]
async fn test_index_follows_tag_changes() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let id = store
        .content
        .create(
            &actor,
            NewContent {
                status: ContentStatus::Published,
                tags: vec!["crustacean".to_string()],
                ..post("Tagged", "Plain body")
            },
        )
        .await
        .unwrap()
        .content
        .id;
    assert_eq!(ids(&store.search.search("crustacean", 10).await.unwrap()), vec![id]);

    let tag = store.tags.get_by_slug("crustacean").await.unwrap().unwrap();
    store.tags.rename(&actor, tag.id, "Ferris").await.unwrap();
    assert!(store.search.search("crustacean", 10).await.unwrap().is_empty());
    assert_eq!(ids(&store.search.search("ferris", 10).await.unwrap()), vec![id]);

    store.tags.delete(&actor, tag.id).await.unwrap();
    assert!(store.search.search("ferris", 10).await.unwrap().is_empty());
    assert_eq!(ids(&store.search.search("tagged", 10).await.unwrap()), vec![id]);
    assert_eq!(test.count("content_tags").await, 0);
}

#[tokio::test]
async fn test_empty_query_matches_nothing() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    test.draft(&actor, "Anything", "at all").await;

    assert!(test.store.search.search_all("   ", 10).await.unwrap().is_empty());
    assert!(test.store.search.search_all("\"\"", 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_sync_marks_stale_and_rebuild_heals() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    let first = test.draft(&actor, "Lighthouse", "Keeper log").await.content.id;
    let second = test.draft(&actor, "Harbour", "Tide tables").await.content.id;
    assert!(!store.search.is_stale().await.unwrap());

    sqlx::query("DROP TABLE content_fts")
        .execute(store.db.pool())
        .await
        .unwrap();

    // The content write still commits
    let updated = store
        .content
        .update(
            &actor,
            first,
            ContentPatch {
                title: Some("Lighthouse keeper".to_string()),
                ..ContentPatch::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.content.title, "Lighthouse keeper");
    assert!(store.search.is_stale().await.unwrap());

    let report = store.db.verify_integrity().await.unwrap();
    assert!(!report.search_index_present);
    assert!(report.search_index_stale);

    assert!(store.search.heal_if_stale().await.unwrap());
    assert!(!store.search.is_stale().await.unwrap());
    assert!(!store.search.heal_if_stale().await.unwrap());

    assert_eq!(ids(&store.search.search_all("keeper", 10).await.unwrap()), vec![first]);
    assert_eq!(ids(&store.search.search_all("tide", 10).await.unwrap()), vec![second]);
    assert!(store.db.verify_integrity().await.unwrap().is_healthy());
}

#[tokio::test]
async fn test_rebuild_reindexes_every_row() {
    let test = TestStore::new().await;
    let (_user, actor) = test.admin().await;
    let store = &test.store;

    for n in 0..4 {
        test.draft(&actor, &format!("Entry {n}"), "shared words").await;
    }
    sqlx::query("DELETE FROM content_fts")
        .execute(store.db.pool())
        .await
        .unwrap();
    assert!(store.search.search_all("shared", 10).await.unwrap().is_empty());

    let summary = store.search.rebuild().await.unwrap();
    assert_eq!(summary.indexed, 4);
    assert_eq!(store.search.search_all("shared", 10).await.unwrap().len(), 4);
}
