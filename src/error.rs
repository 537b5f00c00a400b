//! Error types for Quillstore
//!
//! Every fallible storage operation returns [`StoreError`]. Schema
//! problems raised by the migration runner are kept in their own
//! [`MigrationError`] enum so start-up code can report them precisely,
//! and recoverable rejections live in [`ConstraintViolation`].

use thiserror::Error;

use crate::data::ContentStatus;

/// Storage-wide error type
#[derive(Debug, Error)]
pub enum StoreError {
    /// Entity does not exist
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Caller supplied input that fails validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation rejected by a storage constraint (recoverable)
    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    /// Schema could not be brought to or verified at the expected version (fatal)
    #[error("Schema error: {0}")]
    Schema(#[from] MigrationError),

    /// Audit entry could not be written; the enclosing operation fails
    #[error("Audit write failed: {0}")]
    AuditWrite(String),

    /// Explicit search index rebuild failed
    #[error("Search index error: {0}")]
    IndexSync(String),

    /// Explicit retention job failed
    #[error("Retention prune failed: {0}")]
    RetentionPrune(String),

    /// Connection pool or write lock not acquired in time (retryable)
    #[error("Database busy: {0}")]
    Busy(String),

    /// Destructive operation attempted without explicit confirmation
    #[error("Confirmation required: {0}")]
    ConfirmationRequired(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(sqlx::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl StoreError {
    /// Whether the caller may retry the same operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Busy(_))
    }

    /// Stable label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Validation(_) => "validation",
            StoreError::Constraint(_) => "constraint",
            StoreError::Schema(_) => "schema",
            StoreError::AuditWrite(_) => "audit_write",
            StoreError::IndexSync(_) => "index_sync",
            StoreError::RetentionPrune(_) => "retention_prune",
            StoreError::Busy(_) => "busy",
            StoreError::ConfirmationRequired(_) => "confirmation_required",
            StoreError::Database(_) => "database",
            StoreError::Config(_) => "config",
            StoreError::Internal(_) => "internal",
        }
    }
}

/// Rejections surfaced to the caller as a refused operation.
#[derive(Debug, Error)]
pub enum ConstraintViolation {
    #[error("slug '{0}' is already in use")]
    SlugTaken(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        from: ContentStatus,
        to: ContentStatus,
    },

    /// A `scheduled_at` edit arrived for a row that is not scheduled.
    #[error("cannot set scheduled_at on {0} content without an explicit schedule transition")]
    ScheduleRequiresTransition(ContentStatus),

    #[error("scheduled_at must be in the future")]
    ScheduleInPast,

    #[error("foreign key violation: {0}")]
    ForeignKey(String),

    #[error("unique constraint violation: {0}")]
    Unique(String),

    #[error("check constraint violation: {0}")]
    Check(String),
}

/// Errors raised while applying, rolling back or validating migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration {version} ({name}) failed: {source}")]
    ExecutionFailed {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error(
        "checksum mismatch for migration {version} ({name}): recorded {stored}, binary has {current}"
    )]
    ChecksumMismatch {
        version: i64,
        name: &'static str,
        stored: String,
        current: String,
    },

    #[error("database records migration {version}, which this binary does not know")]
    UnknownVersion { version: i64 },

    #[error("migration {version} is recorded as applied but migration {missing} is not")]
    OutOfOrder { version: i64, missing: i64 },

    #[error("migration {version} ({name}) drops user data; rerun with force to roll it back")]
    DestructiveRollback { version: i64, name: &'static str },

    #[error("invalid rollback target {target}")]
    InvalidTarget { target: i64 },

    #[error("migration {version} left dangling foreign keys in table {table}")]
    ForeignKeyViolation { version: i64, table: String },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;

        if matches!(err, sqlx::Error::PoolTimedOut) {
            return StoreError::Busy("timed out waiting for a database connection".to_string());
        }

        if let Some(db_err) = err.as_database_error() {
            if is_busy_code(db_err.code().as_deref()) {
                return StoreError::Busy(db_err.message().to_string());
            }

            let message = db_err.message().to_string();
            match db_err.kind() {
                ErrorKind::UniqueViolation => {
                    return StoreError::Constraint(ConstraintViolation::Unique(message));
                }
                ErrorKind::ForeignKeyViolation => {
                    return StoreError::Constraint(ConstraintViolation::ForeignKey(message));
                }
                ErrorKind::CheckViolation => {
                    return StoreError::Constraint(ConstraintViolation::Check(message));
                }
                _ => {}
            }
        }

        StoreError::Database(err)
    }
}

impl From<config::ConfigError> for StoreError {
    fn from(err: config::ConfigError) -> Self {
        StoreError::Config(err.to_string())
    }
}

/// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    code.and_then(|code| code.parse::<i32>().ok())
        .map(|code| matches!(code & 0xff, 5 | 6))
        .unwrap_or(false)
}

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_codes_include_extended_variants() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("19")));
        assert!(!is_busy_code(None));
    }

    #[test]
    fn pool_timeout_is_retryable() {
        let error = StoreError::from(sqlx::Error::PoolTimedOut);
        assert!(error.is_retryable());
        assert_eq!(error.kind(), "busy");
    }

    #[test]
    fn constraint_errors_are_not_retryable() {
        let error = StoreError::from(ConstraintViolation::SlugTaken("hello".to_string()));
        assert!(!error.is_retryable());
        assert!(error.to_string().contains("hello"));
    }
}
