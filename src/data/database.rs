//! SQLite database operations
//!
//! All database access goes through this module. Readers use the pool
//! directly; every writer goes through [`Database::begin_write`], which
//! serialises writers in-process behind a bounded wait.

use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::models::now_timestamp;
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use crate::schema::{self, CatalogDrift, Migrator};

const JOURNAL_SIZE_LIMIT_BYTES: &str = "67108864";

/// Settings key set when an incremental index update failed.
pub const SEARCH_INDEX_STALE_KEY: &str = "search_index_stale";

/// Database connection pool wrapper.
pub struct Database {
    pool: Pool<Sqlite>,
    options: SqliteConnectOptions,
    path: PathBuf,
    write_gate: Arc<Mutex<()>>,
    acquire_timeout: Duration,
}

/// An open write transaction holding the in-process write lock.
///
/// Dropping it without [`WriteTx::commit`] rolls the transaction back.
pub struct WriteTx {
    tx: Transaction<'static, Sqlite>,
    _gate: OwnedMutexGuard<()>,
}

impl WriteTx {
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

/// Result of [`Database::verify_integrity`], consumed by the doctor command.
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub schema_version: i64,
    pub latest_version: i64,
    /// Rows of `PRAGMA integrity_check`; `["ok"]` when healthy
    pub integrity_check: Vec<String>,
    pub catalog: CatalogDrift,
    pub search_index_present: bool,
    pub search_index_stale: bool,
}

impl IntegrityReport {
    pub fn is_healthy(&self) -> bool {
        self.schema_version == self.latest_version
            && self.integrity_check == ["ok"]
            && self.catalog.is_clean()
            && self.search_index_present
            && !self.search_index_stale
    }
}

impl Database {
    // =========================================================================
    // Connection
    // =========================================================================

    /// Connect to SQLite database and run pending migrations
    ///
    /// Creates the database file if it doesn't exist. No caller receives a
    /// `Database` until the schema is at the latest version.
    ///
    /// # Errors
    /// Returns error if connection or migration fails
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let db = Self::open(config).await?;
        db.migrator().apply_pending().await?;

        let mut conn = db.pool.acquire().await?;
        let drift = schema::verify(&mut *conn, schema::latest_version()).await?;
        if !drift.is_clean() {
            tracing::warn!(
                missing = ?drift.missing,
                unexpected = ?drift.unexpected,
                changed = ?drift.changed,
                "Live schema differs from the catalog"
            );
        }

        tracing::info!(path = %db.path.display(), "Database connected and migrated successfully");
        Ok(db)
    }

    /// Open the pool without touching the schema.
    pub async fn open(config: &DatabaseConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout())
            .pragma("journal_size_limit", JOURNAL_SIZE_LIMIT_BYTES);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options.clone())
            .await?;

        Ok(Self {
            pool,
            options,
            path: config.path.clone(),
            write_gate: Arc::new(Mutex::new(())),
            acquire_timeout: config.acquire_timeout(),
        })
    }

    /// Convenience for tests and tools: default settings at `path`.
    pub async fn connect_path(path: &Path) -> Result<Self, StoreError> {
        Self::connect(&DatabaseConfig::at(path)).await
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn migrator(&self) -> Migrator {
        Migrator::new(&self.options)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Start a write transaction, waiting at most the acquire timeout for
    /// the write lock and for a pooled connection.
    pub async fn begin_write(&self) -> Result<WriteTx, StoreError> {
        let gate = self.acquire_gate().await?;
        let mut tx = self.pool.begin().await?;
        // Take the file's write lock before any read, like BEGIN IMMEDIATE.
        // A writer in another process is then waited out by busy_timeout
        // instead of failing later with SQLITE_BUSY_SNAPSHOT.
        sqlx::query("UPDATE settings SET value = value WHERE 0")
            .execute(&mut *tx)
            .await?;
        Ok(WriteTx { tx, _gate: gate })
    }

    async fn acquire_gate(&self) -> Result<OwnedMutexGuard<()>, StoreError> {
        tokio::time::timeout(self.acquire_timeout, self.write_gate.clone().lock_owned())
            .await
            .map_err(|_| StoreError::Busy("timed out waiting for the write lock".to_string()))
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Get setting value
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value)
    }

    /// Set setting value
    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut tx = self.begin_write().await?;
        put_setting(tx.conn(), key, value).await?;
        tx.commit().await
    }

    /// Settings whose key starts with `prefix`, ordered by key.
    pub async fn settings_with_prefix(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, String)>, StoreError> {
        // Exact, case-sensitive prefix; LIKE would fold ASCII case
        let settings = sqlx::query_as::<_, (String, String)>(
            "SELECT key, value FROM settings WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(settings)
    }

    /// Delete a setting; returns whether it existed.
    pub async fn delete_setting(&self, key: &str) -> Result<bool, StoreError> {
        let mut tx = self.begin_write().await?;
        let deleted = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(tx.conn())
            .await?
            .rows_affected();
        tx.commit().await?;

        Ok(deleted > 0)
    }

    // =========================================================================
    // Health and integrity
    // =========================================================================

    /// Check database connectivity.
    pub async fn health_check(&self) -> Result<bool, StoreError> {
        let value = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(value == 1)
    }

    /// Structural health report for the external doctor.
    pub async fn verify_integrity(&self) -> Result<IntegrityReport, StoreError> {
        let mut conn = self.pool.acquire().await?;

        let schema_version = sqlx::query_scalar::<_, i64>(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        )
        .fetch_one(&mut *conn)
        .await?;

        let integrity_check = sqlx::query_scalar::<_, String>("PRAGMA integrity_check")
            .fetch_all(&mut *conn)
            .await?;

        let catalog = schema::verify(&mut *conn, schema_version).await?;

        let search_index_present = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'content_fts'",
        )
        .fetch_one(&mut *conn)
        .await?
            > 0;

        let search_index_stale = sqlx::query_scalar::<_, String>(
            "SELECT value FROM settings WHERE key = ?",
        )
        .bind(SEARCH_INDEX_STALE_KEY)
        .fetch_optional(&mut *conn)
        .await?
        .is_some_and(|v| v == "1");

        Ok(IntegrityReport {
            schema_version,
            latest_version: schema::latest_version(),
            integrity_check,
            catalog,
            search_index_present,
            search_index_stale,
        })
    }

    // =========================================================================
    // Backup quiescing
    // =========================================================================

    /// Fold the WAL back into the main file so it can be copied as one blob.
    pub async fn checkpoint(&self) -> Result<(), StoreError> {
        let _gate = self.acquire_gate().await?;
        let (busy, log_frames, checkpointed) =
            sqlx::query_as::<_, (i64, i64, i64)>("PRAGMA wal_checkpoint(TRUNCATE)")
                .fetch_one(&self.pool)
                .await?;

        if busy != 0 {
            return Err(StoreError::Busy(
                "readers prevented a full WAL checkpoint".to_string(),
            ));
        }

        tracing::info!(log_frames, checkpointed, "WAL checkpoint completed");
        Ok(())
    }

    /// Write a consistent copy of the database to `destination`.
    pub async fn snapshot_to(&self, destination: &Path) -> Result<(), StoreError> {
        if destination.exists() {
            return Err(StoreError::Validation(format!(
                "snapshot destination already exists: {}",
                destination.display()
            )));
        }

        let escaped = destination.to_string_lossy().replace('\'', "''");
        let _gate = self.acquire_gate().await?;
        sqlx::query(&format!("VACUUM INTO '{}'", escaped))
            .execute(&self.pool)
            .await?;

        tracing::info!(destination = %destination.display(), "Database snapshot written");
        Ok(())
    }
}

/// Upsert a setting inside the caller's transaction.
pub async fn put_setting(
    conn: &mut SqliteConnection,
    key: &str,
    value: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
    )
    .bind(key)
    .bind(value)
    .bind(now_timestamp())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
