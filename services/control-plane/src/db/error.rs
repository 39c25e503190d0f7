//! Database error types.

use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// None of the configured endpoints accepted a connection.
    #[error("no reachable database endpoint; tried {tried}")]
    NoReachableEndpoint { tried: String },

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// A stored value no longer parses into its domain type.
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    pub(crate) fn corrupt(table: &'static str, message: impl std::fmt::Display) -> Self {
        DbError::Corrupt {
            table,
            message: message.to_string(),
        }
    }
}
