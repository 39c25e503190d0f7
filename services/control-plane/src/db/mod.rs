//! Database layer for the control plane.
//!
//! This module provides:
//! - Connection pool management over one or more SQLite endpoints
//! - Discovery storage (machines, interfaces, disks, neighbors)
//! - Ignition version and sync-notify records
//!
//! Scheduler and lifecycle tables are owned by their own modules
//! (`crate::scheduler`, `crate::lifecycle`), which share this pool.

mod discovery;
mod error;
mod ignition;
mod sync_notify;

pub use discovery::DiscoveryStore;
pub(crate) use discovery::{DiskRow, InterfaceRow};
pub use error::DbError;
pub use ignition::{IgnitionVersion, IgnitionVersionStore};
pub use sync_notify::SyncNotifyStore;

use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{info, warn};

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL. Several endpoints may be given, comma separated.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Option<Duration>,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,

    /// How long an endpoint order is kept before being reshuffled.
    pub shuffle_interval: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://metalcast.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            shuffle_interval: Duration::from_secs(60),
        }
    }
}

impl DbConfig {
    /// A private in-memory database.
    ///
    /// The pool is pinned to a single connection that never expires, since
    /// every SQLite in-memory connection is its own database.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout: None,
            max_lifetime: None,
            ..Default::default()
        }
    }

    /// Configured endpoints, in declaration order.
    pub fn endpoints(&self) -> Vec<String> {
        self.database_url
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

// ============================================================================
// Endpoint selection
// ============================================================================

/// Ordered list of database endpoints.
///
/// The order is reshuffled when it is older than the shuffle interval so
/// that several control planes sharing the same list spread their first
/// connection attempts. A single endpoint is never shuffled.
#[derive(Debug)]
pub struct EndpointSet {
    interval: Duration,
    state: Mutex<EndpointState>,
}

#[derive(Debug)]
struct EndpointState {
    endpoints: Vec<String>,
    shuffled_at: Option<Instant>,
}

impl EndpointSet {
    pub fn new(endpoints: Vec<String>, interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(EndpointState {
                endpoints,
                shuffled_at: None,
            }),
        }
    }

    /// Endpoints in the order they should be tried.
    pub fn ordered(&self) -> Vec<String> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.endpoints.len() > 1 {
            let stale = state
                .shuffled_at
                .map_or(true, |at| at.elapsed() >= self.interval);
            if stale {
                state.endpoints.shuffle(&mut rand::rng());
                state.shuffled_at = Some(Instant::now());
            }
        }
        state.endpoints.clone()
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .endpoints
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    endpoint: String,
}

impl Database {
    /// Connect to the first reachable configured endpoint.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let endpoints = EndpointSet::new(config.endpoints(), config.shuffle_interval);
        Self::connect_any(&endpoints, config).await
    }

    /// Connect to the first reachable endpoint of `endpoints`.
    pub async fn connect_any(endpoints: &EndpointSet, config: &DbConfig) -> Result<Self, DbError> {
        info!(
            endpoints = endpoints.len(),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let ordered = endpoints.ordered();
        let mut last_error = None;

        for endpoint in &ordered {
            match connect_one(endpoint, config).await {
                Ok(pool) => {
                    info!(endpoint = %redact(endpoint), "Database connection pool established");
                    return Ok(Self {
                        pool,
                        endpoint: endpoint.clone(),
                    });
                }
                Err(e) => {
                    warn!(endpoint = %redact(endpoint), error = %e, "Database endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }

        match (ordered.len(), last_error) {
            (1, Some(e)) => Err(DbError::Connect(e)),
            _ => Err(DbError::NoReachableEndpoint {
                tried: ordered.iter().map(|e| redact(e)).collect::<Vec<_>>().join(", "),
            }),
        }
    }

    /// Create a migrated in-memory database.
    pub async fn in_memory() -> Result<Self, DbError> {
        let db = Self::connect(&DbConfig::in_memory()).await?;
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The endpoint this pool is connected to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), DbError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(DbError::Query)?;
        Ok(())
    }

    /// Apply the migrations embedded from `services/control-plane/migrations`.
    pub async fn run_migrations(&self) -> Result<(), DbError> {
        let migrator = sqlx::migrate!("./migrations");
        info!(migrations = migrator.iter().count(), "Running database migrations");
        migrator.run(&self.pool).await.map_err(DbError::Migration)?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Get a discovery store handle.
    pub fn discovery_store(&self) -> DiscoveryStore {
        DiscoveryStore::new(self.pool.clone())
    }

    /// Get an ignition version store handle.
    pub fn ignition_store(&self) -> IgnitionVersionStore {
        IgnitionVersionStore::new(self.pool.clone())
    }

    /// Get a sync-notify store handle.
    pub fn sync_notify_store(&self) -> SyncNotifyStore {
        SyncNotifyStore::new(self.pool.clone())
    }
}

async fn connect_one(url: &str, config: &DbConfig) -> Result<SqlitePool, sqlx::Error> {
    let mut options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true);
    if !is_memory(url) {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect_with(options)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}

fn is_memory(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

/// Strip query parameters, which may carry credentials for remote drivers.
fn redact(url: &str) -> String {
    url.split('?').next().unwrap_or(url).to_string()
}

// ============================================================================
// Time helpers
// ============================================================================

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
