//! Application state shared across request handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::db::Database;
use crate::lifecycle::{InstallLock, InstallLockSettings, LifecycleStore};
use crate::scheduler::MachineScheduleStore;

/// Settings the HTTP layer needs beyond the database.
#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub matchbox_uri: String,
    pub matchbox_health_paths: Vec<String>,
    pub matchbox_timeout: Duration,
    pub install_lock: InstallLockSettings,
}

impl Default for ApiSettings {
    fn default() -> Self {
        let config = Config::default();
        Self {
            matchbox_uri: config.matchbox_uri,
            matchbox_health_paths: config.matchbox_health_paths,
            matchbox_timeout: Duration::from_secs(config.matchbox_timeout_secs),
            install_lock: InstallLockSettings::default(),
        }
    }
}

impl ApiSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            matchbox_uri: config.matchbox_uri.clone(),
            matchbox_health_paths: config.matchbox_health_paths.clone(),
            matchbox_timeout: config.matchbox_timeout(),
            install_lock: config.install_lock()?,
        })
    }
}

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Database,
    http: reqwest::Client,
    matchbox_uri: String,
    matchbox_health_paths: Vec<String>,
    install_lock: InstallLock,
}

impl AppState {
    /// Create a new application state.
    pub fn new(db: Database, settings: ApiSettings) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(settings.matchbox_timeout)
            .build()?;
        let install_lock = InstallLock::new(db.pool().clone(), settings.install_lock);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                db,
                http,
                matchbox_uri: settings.matchbox_uri.trim_end_matches('/').to_string(),
                matchbox_health_paths: settings.matchbox_health_paths,
                install_lock,
            }),
        })
    }

    /// Get a reference to the database.
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn schedules(&self) -> MachineScheduleStore {
        MachineScheduleStore::new(self.inner.db.pool().clone())
    }

    pub fn lifecycle(&self) -> LifecycleStore {
        LifecycleStore::new(self.inner.db.pool().clone())
    }

    pub fn install_lock(&self) -> &InstallLock {
        &self.inner.install_lock
    }

    /// Client for calls to the boot-config service.
    pub fn http(&self) -> &reqwest::Client {
        &self.inner.http
    }

    /// Base URI of the boot-config service, without trailing slash.
    pub fn matchbox_uri(&self) -> &str {
        &self.inner.matchbox_uri
    }

    pub fn matchbox_health_paths(&self) -> &[String] {
        &self.inner.matchbox_health_paths
    }
}
