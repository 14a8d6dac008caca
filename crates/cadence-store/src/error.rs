//! Error types for the store.

use thiserror::Error;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A persisted column held a value the domain model does not know.
    #[error("invalid {column} value in row: {value}")]
    InvalidColumn {
        column: &'static str,
        value: String,
    },
}
