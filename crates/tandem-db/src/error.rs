//! # Database Errors
//!
//! `sqlx` failures are folded into [`DbError`] here. The sync crate turns
//! every `DbError` into `SyncError::DatabaseError`, which pauses sync until
//! the next trigger instead of aborting the daemon.

use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("no {entity} with id {id}")]
    NotFound { entity: String, id: String },

    /// A UNIQUE constraint fired, e.g. a pending change queued twice.
    #[error("{column} must be unique")]
    Duplicate { column: String },

    /// The file could not be opened, or the pool was already closed.
    #[error("cannot reach the database: {0}")]
    ConnectionFailed(String),

    #[error("schema upgrade failed: {0}")]
    MigrationFailed(String),

    #[error("statement failed: {0}")]
    QueryFailed(String),

    /// A stored row no longer decodes, usually JSON from an incompatible
    /// build or a hand-edited file.
    #[error("unreadable row {key} in {table}: {reason}")]
    Corrupt {
        table: String,
        key: String,
        reason: String,
    },

    /// Every pooled connection stayed busy past the acquire timeout.
    #[error("timed out waiting for a pooled connection")]
    PoolTimedOut,

    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        DbError::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn corrupt(
        table: impl Into<String>,
        key: impl Into<String>,
        reason: impl ToString,
    ) -> Self {
        DbError::Corrupt {
            table: table.into(),
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

const UNIQUE_PREFIX: &str = "UNIQUE constraint failed: ";

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => DbError::not_found("row", "?"),
            sqlx::Error::PoolTimedOut => DbError::PoolTimedOut,
            sqlx::Error::PoolClosed => DbError::ConnectionFailed("pool closed".into()),
            sqlx::Error::Database(db) => match db.message().strip_prefix(UNIQUE_PREFIX) {
                // SQLite names the column as `<table>.<column>`.
                Some(column) => DbError::Duplicate {
                    column: column.to_string(),
                },
                None => DbError::QueryFailed(db.message().to_string()),
            },
            other => DbError::Other(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DbError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        DbError::MigrationFailed(err.to_string())
    }
}
