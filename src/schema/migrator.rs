//! Migration runner
//!
//! Applies and rolls back the units in [`MIGRATIONS`](super::migrations::MIGRATIONS),
//! recording each in `schema_migrations`. Every unit runs on a dedicated
//! connection with foreign key enforcement off (so rebuilds can drop and
//! rename referenced tables) inside a single transaction that also
//! reconciles the catalog, checks foreign keys and writes the record.

use serde::Serialize;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Executor, SqliteConnection};
use std::time::Instant;

use super::catalog;
use super::migrations::{MIGRATIONS, Migration, Step, find};
use crate::data::{MigrationRecord, now_timestamp};
use crate::error::MigrationError;

const CREATE_SCHEMA_MIGRATIONS: &str = r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
)
"#;

/// Applied/pending state of one migration, for status reports.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationState {
    pub version: i64,
    pub name: &'static str,
    pub description: &'static str,
    pub destructive: bool,
    pub applied_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

impl Direction {
    fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// Runs schema migrations against one database file.
pub struct Migrator {
    options: SqliteConnectOptions,
}

impl Migrator {
    /// `options` are the pool's connect options; foreign keys are forced off.
    pub fn new(options: &SqliteConnectOptions) -> Self {
        Self {
            options: options.clone().foreign_keys(false),
        }
    }

    async fn connect(&self) -> Result<SqliteConnection, MigrationError> {
        let mut conn = self.options.connect().await?;
        conn.execute(CREATE_SCHEMA_MIGRATIONS).await?;
        Ok(conn)
    }

    /// Apply every pending migration in ascending order.
    ///
    /// Returns the number of migrations applied. Recorded checksums,
    /// unknown versions and gaps are validated before anything runs.
    pub async fn apply_pending(&self) -> Result<usize, MigrationError> {
        let mut conn = self.connect().await?;
        let result: Result<usize, MigrationError> = async {
            let current = validate_history(&mut conn).await?;
            let mut applied = 0;
            for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
                run_unit(&mut conn, migration, Direction::Up).await?;
                applied += 1;
            }
            Ok(applied)
        }
        .await;
        close(conn).await;

        if let Ok(applied) = &result {
            if *applied > 0 {
                tracing::info!(applied, "Database migrations applied");
            } else {
                tracing::debug!("Database schema is up to date");
            }
        }
        result
    }

    /// Roll back every migration above `target`, newest first.
    ///
    /// Refuses before touching the database when a destructive
    /// migration is in range and `force` is false.
    pub async fn rollback_to(&self, target: i64, force: bool) -> Result<(), MigrationError> {
        if target < 0 {
            return Err(MigrationError::InvalidTarget { target });
        }

        let mut conn = self.connect().await?;
        let result: Result<(), MigrationError> = async {
            let current = validate_history(&mut conn).await?;
            if target >= current {
                tracing::info!(current, target, "Nothing to roll back");
                return Ok(());
            }

            let units: Vec<&Migration> = MIGRATIONS
                .iter()
                .rev()
                .filter(|m| m.version > target && m.version <= current)
                .collect();

            if !force {
                if let Some(destructive) = units.iter().find(|m| m.destructive) {
                    return Err(MigrationError::DestructiveRollback {
                        version: destructive.version,
                        name: destructive.name,
                    });
                }
            }

            for migration in units {
                run_unit(&mut conn, migration, Direction::Down).await?;
            }
            Ok(())
        }
        .await;
        close(conn).await;
        result
    }

    /// Highest applied version (0 when nothing is applied).
    pub async fn current_version(&self) -> Result<i64, MigrationError> {
        let mut conn = self.connect().await?;
        let version = applied_version(&mut conn).await;
        close(conn).await;
        version
    }

    /// State of every known migration.
    pub async fn status(&self) -> Result<Vec<MigrationState>, MigrationError> {
        let mut conn = self.connect().await?;
        let records = load_records(&mut conn).await;
        close(conn).await;
        let records = records?;

        Ok(MIGRATIONS
            .iter()
            .map(|m| MigrationState {
                version: m.version,
                name: m.name,
                description: m.description,
                destructive: m.destructive,
                applied_at: records
                    .iter()
                    .find(|r| r.version == m.version)
                    .map(|r| crate::data::timestamp(r.applied_at)),
            })
            .collect())
    }
}

async fn close(conn: SqliteConnection) {
    if let Err(error) = conn.close().await {
        tracing::warn!(%error, "Failed to close migration connection");
    }
}

async fn load_records(conn: &mut SqliteConnection) -> Result<Vec<MigrationRecord>, MigrationError> {
    let records = sqlx::query_as::<_, MigrationRecord>(
        "SELECT version, name, checksum, applied_at FROM schema_migrations ORDER BY version",
    )
    .fetch_all(&mut *conn)
    .await?;
    Ok(records)
}

async fn applied_version(conn: &mut SqliteConnection) -> Result<i64, MigrationError> {
    let version =
        sqlx::query_scalar::<_, i64>("SELECT COALESCE(MAX(version), 0) FROM schema_migrations")
            .fetch_one(&mut *conn)
            .await?;
    Ok(version)
}

/// Check recorded history against the binary; returns the current version.
async fn validate_history(conn: &mut SqliteConnection) -> Result<i64, MigrationError> {
    let records = load_records(conn).await?;

    for (index, record) in records.iter().enumerate() {
        let expected_version = index as i64 + 1;
        if record.version != expected_version {
            return Err(MigrationError::OutOfOrder {
                version: record.version,
                missing: expected_version,
            });
        }

        let migration = find(record.version).ok_or(MigrationError::UnknownVersion {
            version: record.version,
        })?;

        let current = migration.checksum();
        if record.checksum != current {
            return Err(MigrationError::ChecksumMismatch {
                version: migration.version,
                name: migration.name,
                stored: record.checksum.clone(),
                current,
            });
        }
    }

    Ok(records.last().map(|r| r.version).unwrap_or(0))
}

async fn run_unit(
    conn: &mut SqliteConnection,
    migration: &'static Migration,
    direction: Direction,
) -> Result<(), MigrationError> {
    let started = Instant::now();
    let failed = |source: sqlx::Error| MigrationError::ExecutionFailed {
        version: migration.version,
        name: migration.name,
        source,
    };

    let (steps, resulting_version) = match direction {
        Direction::Up => (migration.up, migration.version),
        Direction::Down => (migration.down, migration.version - 1),
    };

    let mut tx = conn.begin().await.map_err(failed)?;

    for step in steps {
        match step {
            Step::Sql(sql) => {
                (&mut *tx).execute(*sql).await.map_err(failed)?;
            }
            Step::Rebuild(rebuild) => {
                (&mut *tx).execute(rebuild.create_sql).await.map_err(failed)?;
                for statement in rebuild.swap_statements() {
                    (&mut *tx).execute(statement.as_str()).await.map_err(failed)?;
                }
                tracing::debug!(
                    version = migration.version,
                    table = rebuild.table,
                    restored = catalog::objects_for_table(rebuild.table, resulting_version).len(),
                    "Rebuilt table"
                );
            }
        }
    }

    catalog::reconcile(&mut *tx, resulting_version)
        .await
        .map_err(failed)?;

    let violation = sqlx::query_scalar::<_, String>(
        "SELECT \"table\" FROM pragma_foreign_key_check() LIMIT 1",
    )
    .fetch_optional(&mut *tx)
    .await
    .map_err(failed)?;
    if let Some(table) = violation {
        return Err(MigrationError::ForeignKeyViolation {
            version: migration.version,
            table,
        });
    }

    match direction {
        Direction::Up => {
            sqlx::query(
                "INSERT INTO schema_migrations (version, name, checksum, applied_at) VALUES (?, ?, ?, ?)",
            )
            .bind(migration.version)
            .bind(migration.name)
            .bind(migration.checksum())
            .bind(now_timestamp())
            .execute(&mut *tx)
            .await
            .map_err(failed)?;
        }
        Direction::Down => {
            sqlx::query("DELETE FROM schema_migrations WHERE version = ?")
                .bind(migration.version)
                .execute(&mut *tx)
                .await
                .map_err(failed)?;
        }
    }

    tx.commit().await.map_err(failed)?;

    crate::metrics::MIGRATIONS_TOTAL
        .with_label_values(&[direction.as_str()])
        .inc();
    tracing::info!(
        version = migration.version,
        name = migration.name,
        direction = direction.as_str(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Migration unit committed"
    );

    Ok(())
}
