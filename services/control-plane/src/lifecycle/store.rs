//! Lifecycle records.
//!
//! Each table holds one row per MAC. Updates keep `created_at` and replace
//! everything else, so the latest report always wins.

use metalcast_id::MacAddress;
use metalcast_model::{
    CoreosInstallStatus, IgnitionStatus, LifecycleQuery, RollingEntry, RollingStatus,
    RollingStrategy,
};
use sqlx::SqlitePool;
use tracing::{info, instrument};

use super::LifecycleResult;
use crate::db::{from_millis, now_millis, DbError};

#[derive(Debug, Clone)]
pub struct LifecycleStore {
    pool: SqlitePool,
}

impl LifecycleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Record whether the ignition the machine applied is current.
    #[instrument(skip(self, query), fields(mac = %query.mac))]
    pub async fn refresh_ignition(
        &self,
        query: &LifecycleQuery,
        up_to_date: bool,
    ) -> LifecycleResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_ignition (mac, up_to_date, request_raw_query, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(mac) DO UPDATE SET
                up_to_date = excluded.up_to_date,
                request_raw_query = excluded.request_raw_query,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(query.mac.to_string())
        .bind(up_to_date)
        .bind(&query.raw)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        info!(up_to_date, "Ignition status recorded");
        Ok(())
    }

    /// Record the outcome of an install attempt.
    #[instrument(skip(self, query), fields(mac = %query.mac))]
    pub async fn refresh_coreos_install(
        &self,
        query: &LifecycleQuery,
        success: bool,
    ) -> LifecycleResult<()> {
        sqlx::query(
            r#"
            INSERT INTO lifecycle_coreos_install (mac, success, request_raw_query, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(mac) DO UPDATE SET
                success = excluded.success,
                request_raw_query = excluded.request_raw_query,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(query.mac.to_string())
        .bind(success)
        .bind(&query.raw)
        .bind(now_millis())
        .execute(&self.pool)
        .await?;

        info!(success, "Install outcome recorded");
        Ok(())
    }

    /// Enable or disable rolling updates for a machine.
    ///
    /// The strategy is parsed before anything is written; an unknown one
    /// leaves the stored record untouched. Disabling keeps the stored
    /// strategy.
    #[instrument(skip(self, query), fields(mac = %query.mac))]
    pub async fn apply_rolling(
        &self,
        query: &LifecycleQuery,
        enable: bool,
        strategy: Option<&str>,
    ) -> LifecycleResult<RollingStatus> {
        let strategy = strategy
            .map(RollingStrategy::parse)
            .transpose()?
            .unwrap_or_default();

        let sql = if enable {
            r#"
            INSERT INTO lifecycle_rolling (mac, enable, strategy, request_raw_query, created_at, updated_at)
            VALUES (?1, 1, ?2, ?3, ?4, ?4)
            ON CONFLICT(mac) DO UPDATE SET
                enable = 1,
                strategy = excluded.strategy,
                request_raw_query = excluded.request_raw_query,
                updated_at = excluded.updated_at
            "#
        } else {
            r#"
            INSERT INTO lifecycle_rolling (mac, enable, strategy, request_raw_query, created_at, updated_at)
            VALUES (?1, 0, ?2, ?3, ?4, ?4)
            ON CONFLICT(mac) DO UPDATE SET
                enable = 0,
                request_raw_query = excluded.request_raw_query,
                updated_at = excluded.updated_at
            "#
        };

        sqlx::query(sql)
            .bind(query.mac.to_string())
            .bind(strategy.as_str())
            .bind(&query.raw)
            .bind(now_millis())
            .execute(&self.pool)
            .await?;

        info!(enable, strategy = %strategy, "Rolling status updated");
        Ok(RollingStatus {
            enable,
            strategy: enable.then_some(strategy),
            request_raw_query: query.raw.clone(),
        })
    }

    pub async fn get_ignition_uptodate_status(
        &self,
        mac: &MacAddress,
    ) -> LifecycleResult<Option<bool>> {
        Ok(
            sqlx::query_scalar("SELECT up_to_date FROM lifecycle_ignition WHERE mac = ?1")
                .bind(mac.to_string())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    pub async fn get_coreos_install_status(
        &self,
        mac: &MacAddress,
    ) -> LifecycleResult<Option<bool>> {
        Ok(
            sqlx::query_scalar("SELECT success FROM lifecycle_coreos_install WHERE mac = ?1")
                .bind(mac.to_string())
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    /// `(enable, strategy)` of a machine; both `None` if never recorded.
    pub async fn get_rolling_status(
        &self,
        mac: &MacAddress,
    ) -> LifecycleResult<(Option<bool>, Option<RollingStrategy>)> {
        let row: Option<(bool, String)> =
            sqlx::query_as("SELECT enable, strategy FROM lifecycle_rolling WHERE mac = ?1")
                .bind(mac.to_string())
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((enable, strategy)) => {
                let strategy = RollingStrategy::parse(&strategy)
                    .map_err(|e| DbError::corrupt("lifecycle_rolling", e))?;
                Ok((Some(enable), Some(strategy)))
            }
            None => Ok((None, None)),
        }
    }

    pub async fn get_all_ignition_status(&self) -> LifecycleResult<Vec<IgnitionStatus>> {
        let rows: Vec<(String, bool, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT mac, up_to_date, request_raw_query, created_at, updated_at
            FROM lifecycle_ignition
            ORDER BY created_at, rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(mac, up_to_date, raw, created_at, updated_at)| -> LifecycleResult<_> {
                Ok(IgnitionStatus {
                    mac: parse_mac("lifecycle_ignition", &mac)?,
                    up_to_date,
                    request_raw_query: raw,
                    created_date: from_millis(created_at),
                    updated_date: from_millis(updated_at),
                })
            })
            .collect()
    }

    /// Install outcomes, in the order machines first reported.
    pub async fn get_all_coreos_install_status(
        &self,
    ) -> LifecycleResult<Vec<CoreosInstallStatus>> {
        let rows: Vec<(String, bool, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT mac, success, request_raw_query, created_at, updated_at
            FROM lifecycle_coreos_install
            ORDER BY created_at, rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(mac, success, raw, created_at, updated_at)| -> LifecycleResult<_> {
                Ok(CoreosInstallStatus {
                    mac: parse_mac("lifecycle_coreos_install", &mac)?,
                    success,
                    request_raw_query: raw,
                    created_date: from_millis(created_at),
                    updated_date: from_millis(updated_at),
                })
            })
            .collect()
    }

    pub async fn get_all_rolling_status(&self) -> LifecycleResult<Vec<RollingEntry>> {
        let rows: Vec<(String, bool, String, String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT mac, enable, strategy, request_raw_query, created_at, updated_at
            FROM lifecycle_rolling
            ORDER BY created_at, rowid
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(mac, enable, strategy, raw, created_at, updated_at)| -> LifecycleResult<_> {
                Ok(RollingEntry {
                    mac: parse_mac("lifecycle_rolling", &mac)?,
                    enable,
                    strategy: RollingStrategy::parse(&strategy)
                        .map_err(|e| DbError::corrupt("lifecycle_rolling", e))?,
                    request_raw_query: raw,
                    created_date: from_millis(created_at),
                    updated_date: from_millis(updated_at),
                })
            })
            .collect()
    }
}

fn parse_mac(table: &'static str, value: &str) -> Result<MacAddress, DbError> {
    MacAddress::parse(value).map_err(|e| DbError::corrupt(table, e))
}
