//! Database tests

use super::*;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::schema;
use std::time::Duration;
use tempfile::TempDir;

/// Helper to create a test database
async fn create_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    let db = Database::connect_path(&db_path).await.unwrap();
    (db, temp_dir)
}

#[tokio::test]
async fn test_database_connection() {
    let (db, _temp_dir) = create_test_db().await;
    assert!(db.health_check().await.unwrap());
}

#[tokio::test]
async fn test_connect_migrates_to_latest() {
    let (db, _temp_dir) = create_test_db().await;

    let version = db.migrator().current_version().await.unwrap();
    assert_eq!(version, schema::latest_version());

    let foreign_keys = sqlx::query_scalar::<_, i64>("PRAGMA foreign_keys")
        .fetch_one(db.pool())
        .await
        .unwrap();
    assert_eq!(foreign_keys, 1);
}

#[tokio::test]
async fn test_reconnect_is_idempotent() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");

    let db = Database::connect_path(&db_path).await.unwrap();
    db.set_setting("site_title", "Notes").await.unwrap();
    db.close().await;

    let db = Database::connect_path(&db_path).await.unwrap();
    assert_eq!(
        db.get_setting("site_title").await.unwrap().as_deref(),
        Some("Notes")
    );
    assert_eq!(
        db.migrator().current_version().await.unwrap(),
        schema::latest_version()
    );
}

#[tokio::test]
async fn test_settings_upsert() {
    let (db, _temp_dir) = create_test_db().await;

    assert_eq!(db.get_setting("theme").await.unwrap(), None);
    db.set_setting("theme", "light").await.unwrap();
    db.set_setting("theme", "dark").await.unwrap();
    assert_eq!(db.get_setting("theme").await.unwrap().as_deref(), Some("dark"));
}

#[tokio::test]
async fn test_dropped_write_tx_rolls_back() {
    let (db, _temp_dir) = create_test_db().await;

    {
        let mut tx = db.begin_write().await.unwrap();
        put_setting(tx.conn(), "draft_key", "value").await.unwrap();
    }

    assert_eq!(db.get_setting("draft_key").await.unwrap(), None);
}

#[tokio::test]
async fn test_write_gate_times_out_as_busy() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = DatabaseConfig::at(temp_dir.path().join("test.db"));
    config.acquire_timeout_seconds = 1;
    let db = Database::connect(&config).await.unwrap();

    let _held = db.begin_write().await.unwrap();
    let started = std::time::Instant::now();
    let result = db.begin_write().await;

    assert!(matches!(result, Err(StoreError::Busy(_))));
    assert!(result.err().unwrap().is_retryable());
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_integrity_report_on_fresh_database() {
    let (db, _temp_dir) = create_test_db().await;

    let report = db.verify_integrity().await.unwrap();
    assert_eq!(report.schema_version, schema::latest_version());
    assert_eq!(report.integrity_check, vec!["ok".to_string()]);
    assert!(report.catalog.is_clean());
    assert!(report.search_index_present);
    assert!(!report.search_index_stale);
    assert!(report.is_healthy());
}

#[tokio::test]
async fn test_integrity_report_flags_missing_index() {
    let (db, _temp_dir) = create_test_db().await;

    sqlx::query("DROP INDEX idx_content_type")
        .execute(db.pool())
        .await
        .unwrap();

    let report = db.verify_integrity().await.unwrap();
    assert!(!report.is_healthy());
    assert!(report.catalog.missing.iter().any(|name| name == "idx_content_type"));
}

#[tokio::test]
async fn test_checkpoint_and_snapshot() {
    let (db, temp_dir) = create_test_db().await;
    db.set_setting("site_title", "Backup me").await.unwrap();

    tokio_test::assert_ok!(db.checkpoint().await);

    let destination = temp_dir.path().join("snapshot.db");
    tokio_test::assert_ok!(db.snapshot_to(&destination).await);
    assert!(destination.exists());

    let copy = Database::connect_path(&destination).await.unwrap();
    assert_eq!(
        copy.get_setting("site_title").await.unwrap().as_deref(),
        Some("Backup me")
    );

    // Refuses to overwrite
    let again = tokio_test::assert_err!(db.snapshot_to(&destination).await);
    assert!(matches!(again, StoreError::Validation(_)));
}

#[tokio::test]
async fn test_settings_prefix_and_delete() {
    let (db, _temp_dir) = create_test_db().await;
    db.set_setting("homepage_title", "Notes").await.unwrap();
    db.set_setting("homepage_subtitle", "and more").await.unwrap();
    db.set_setting("homepageless", "x").await.unwrap();
    db.set_setting("Homepage_title", "other case").await.unwrap();

    let homepage = db.settings_with_prefix("homepage_").await.unwrap();
    assert_eq!(
        homepage,
        vec![
            ("homepage_subtitle".to_string(), "and more".to_string()),
            ("homepage_title".to_string(), "Notes".to_string()),
        ]
    );

    assert!(db.delete_setting("homepage_title").await.unwrap());
    assert!(!db.delete_setting("homepage_title").await.unwrap());
    assert_eq!(db.get_setting("homepage_title").await.unwrap(), None);
}

#[tokio::test]
async fn test_writers_on_separate_handles_wait_for_each_other() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("test.db");
    // Two pools with their own write gates, as two processes would have
    let first = Database::connect_path(&db_path).await.unwrap();
    let second = Database::connect_path(&db_path).await.unwrap();

    let mut held = first.begin_write().await.unwrap();
    put_setting(held.conn(), "owner", "first").await.unwrap();

    let waiter = tokio::spawn(async move {
        let mut tx = second.begin_write().await?;
        let seen = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = 'owner'")
            .fetch_optional(tx.conn())
            .await?;
        put_setting(tx.conn(), "owner", "second").await?;
        tx.commit().await?;
        Ok::<_, StoreError>(seen)
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    held.commit().await.unwrap();

    // The second writer started only after the first committed
    let seen = waiter.await.unwrap().unwrap();
    assert_eq!(seen.as_deref(), Some("first"));
    assert_eq!(first.get_setting("owner").await.unwrap().as_deref(), Some("second"));
}
