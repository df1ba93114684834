//! Typed store errors.
//!
//! Query functions return [`StoreError`] so callers can distinguish missing
//! rows, optimistic-lock conflicts, schema problems, and pool exhaustion.

use thiserror::Error;

/// Errors produced by the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An optimistic state transition matched zero rows.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Schema initialization or evolution failed.
    #[error("schema error: {0}")]
    Schema(String),

    /// The connection pool was exhausted within the acquire timeout.
    #[error("connection pool exhausted")]
    PoolExhausted,

    /// Underlying database I/O failure.
    #[error("database error: {0}")]
    Io(#[source] sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound("row not found".into()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => StoreError::PoolExhausted,
            sqlx::Error::Migrate(m) => StoreError::Schema(m.to_string()),
            other => StoreError::Io(other),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for StoreError {
    fn from(e: sqlx::migrate::MigrateError) -> Self {
        StoreError::Schema(e.to_string())
    }
}
