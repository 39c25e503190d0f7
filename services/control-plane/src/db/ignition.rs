//! Ignition versions reported by the sync engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use metalcast_reconcile::ContentHash;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::{from_millis, now_millis, DbError};

/// Outcome of recording an ignition version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IgnitionVersion {
    pub name: String,
    pub hash: String,
    pub changed: bool,
    pub updated_date: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct IgnitionVersionStore {
    pool: SqlitePool,
}

impl IgnitionVersionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store the content of an ignition template, keeping the previous
    /// timestamp when the content hash is unchanged.
    #[instrument(skip(self, content))]
    pub async fn record(&self, name: &str, content: &str) -> Result<IgnitionVersion, DbError> {
        let hash = ContentHash::from_bytes(content.as_bytes()).to_string();
        let now = now_millis();

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        let previous: Option<(String, i64)> = sqlx::query_as(
            "SELECT content_hash, updated_at FROM ignition_versions WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::Query)?;

        let (changed, updated_at) = match previous {
            Some((old_hash, updated_at)) if old_hash == hash => (false, updated_at),
            _ => {
                sqlx::query(
                    r#"
                    INSERT INTO ignition_versions (name, content_hash, content, updated_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ON CONFLICT(name) DO UPDATE SET
                        content_hash = excluded.content_hash,
                        content = excluded.content,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(name)
                .bind(&hash)
                .bind(content)
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(DbError::Query)?;
                (true, now)
            }
        };

        tx.commit().await.map_err(DbError::Query)?;

        if changed {
            info!(name, hash = %hash, "Ignition version recorded");
        }

        Ok(IgnitionVersion {
            name: name.to_string(),
            hash,
            changed,
            updated_date: from_millis(updated_at),
        })
    }

    /// Current hash per ignition name.
    pub async fn hashes(&self) -> Result<BTreeMap<String, String>, DbError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, content_hash FROM ignition_versions ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .map_err(DbError::Query)?;
        Ok(rows.into_iter().collect())
    }
}
