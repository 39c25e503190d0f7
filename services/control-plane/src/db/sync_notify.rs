//! Sync-notify timestamp.
//!
//! A single row recording when the sync engine last finished pushing
//! boot configuration.

use sqlx::SqlitePool;
use tracing::instrument;

use super::DbError;

#[derive(Debug, Clone)]
pub struct SyncNotifyStore {
    pool: SqlitePool,
}

impl SyncNotifyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record `at` (epoch seconds) as the last sync completion.
    #[instrument(skip(self))]
    pub async fn notify(&self, at: f64) -> Result<(), DbError> {
        sqlx::query(
            r#"
            INSERT INTO sync_notify (id, notified_at) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET notified_at = excluded.notified_at
            "#,
        )
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(DbError::Query)?;
        Ok(())
    }

    /// Last recorded sync completion, if any.
    pub async fn last(&self) -> Result<Option<f64>, DbError> {
        sqlx::query_scalar("SELECT notified_at FROM sync_notify WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::Query)
    }
}
