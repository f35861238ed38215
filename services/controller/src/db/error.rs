//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    #[error("no migrations directory at any of: {tried}")]
    MigrationDirNotFound { tried: String },

    /// A stored value could not be decoded.
    #[error("invalid {column} in stored row: {message}")]
    InvalidRow {
        column: &'static str,
        message: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub(crate) fn invalid(column: &'static str, message: impl std::fmt::Display) -> Self {
        Self::InvalidRow {
            column,
            message: message.to_string(),
        }
    }
}
