//! Install authorization lock.
//!
//! A grant takes a lock row for `ttl`. Acquisition is one upsert that only
//! replaces an expired row, so concurrent callers cannot both win.

use std::time::Duration;

use chrono::{DateTime, Utc};
use metalcast_id::MacAddress;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

use super::LifecycleResult;
use crate::db::{from_millis, to_millis};

const GLOBAL_LOCK_KEY: &str = "global";

/// What an install lock is keyed by.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockScope {
    /// One lock per MAC.
    #[default]
    Machine,
    /// A single lock shared by every machine.
    Global,
}

#[derive(Debug, Clone)]
pub struct InstallLockSettings {
    pub ttl: Duration,
    pub scope: LockScope,
    /// When non-empty, only these MACs may be authorized.
    pub allowed_macs: Vec<MacAddress>,
    /// Refuse machines that never reported discovery.
    pub require_discovered: bool,
}

impl Default for InstallLockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(29),
            scope: LockScope::Machine,
            allowed_macs: Vec::new(),
            require_discovered: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallDecision {
    Granted { expires_at: DateTime<Utc> },
    Locked { holder: String, expires_at: DateTime<Utc> },
    NotAllowed,
}

impl InstallDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, InstallDecision::Granted { .. })
    }
}

#[derive(Debug, Clone)]
pub struct InstallLock {
    pool: SqlitePool,
    settings: InstallLockSettings,
}

impl InstallLock {
    pub fn new(pool: SqlitePool, settings: InstallLockSettings) -> Self {
        Self { pool, settings }
    }

    fn lock_key(&self, mac: &MacAddress) -> String {
        match self.settings.scope {
            LockScope::Machine => mac.to_string(),
            LockScope::Global => GLOBAL_LOCK_KEY.to_string(),
        }
    }

    /// Try to authorize an install for `mac` at `now`.
    #[instrument(skip(self, now), fields(mac = %mac, scope = ?self.settings.scope))]
    pub async fn authorize(
        &self,
        mac: &MacAddress,
        now: DateTime<Utc>,
    ) -> LifecycleResult<InstallDecision> {
        if !self.settings.allowed_macs.is_empty() && !self.settings.allowed_macs.contains(mac) {
            warn!("Install refused: MAC not in allow-list");
            return Ok(InstallDecision::NotAllowed);
        }

        if self.settings.require_discovered {
            let known: Option<i64> = sqlx::query_scalar("SELECT 1 FROM machines WHERE mac = ?1")
                .bind(mac.to_string())
                .fetch_optional(&self.pool)
                .await?;
            if known.is_none() {
                warn!("Install refused: machine not discovered");
                return Ok(InstallDecision::NotAllowed);
            }
        }

        let key = self.lock_key(mac);
        let acquired_at = to_millis(now);
        let ttl_ms = i64::try_from(self.settings.ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = acquired_at.saturating_add(ttl_ms);

        let result = sqlx::query(
            r#"
            INSERT INTO install_locks (lock_key, holder, acquired_at, expires_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(lock_key) DO UPDATE SET
                holder = excluded.holder,
                acquired_at = excluded.acquired_at,
                expires_at = excluded.expires_at
            WHERE install_locks.expires_at <= excluded.acquired_at
            "#,
        )
        .bind(&key)
        .bind(mac.to_string())
        .bind(acquired_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            info!(ttl_secs = self.settings.ttl.as_secs(), "Install authorized");
            return Ok(InstallDecision::Granted {
                expires_at: from_millis(expires_at),
            });
        }

        let (holder, held_until): (String, i64) =
            sqlx::query_as("SELECT holder, expires_at FROM install_locks WHERE lock_key = ?1")
                .bind(&key)
                .fetch_one(&self.pool)
                .await?;
        warn!(holder = %holder, "Install refused: lock held");
        Ok(InstallDecision::Locked {
            holder,
            expires_at: from_millis(held_until),
        })
    }
}
