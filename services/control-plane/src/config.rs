//! Control-plane configuration.
//!
//! Sources, lowest precedence first: built-in defaults, the optional file
//! named by `METALCAST_CONFIG`, then `METALCAST_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use metalcast_id::MacAddress;
use serde::Deserialize;

use crate::db::DbConfig;
use crate::lifecycle::{InstallLockSettings, LockScope};
use crate::scheduler::PolicySettings;

pub const CONFIG_PATH_ENV: &str = "METALCAST_CONFIG";
const ENV_PREFIX: &str = "METALCAST";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,

    pub database_url: String,
    pub db_max_connections: u32,
    pub run_migrations: bool,

    /// Boot-config service, used for ignition comparison and health.
    pub matchbox_uri: String,
    pub matchbox_health_paths: Vec<String>,
    pub matchbox_timeout_secs: u64,

    pub etcd_member_kubernetes_control_plane_expected_nb: usize,
    pub kubernetes_node_expected_nb: Option<usize>,
    /// Promotion interval; 0 disables the in-process scheduler.
    pub scheduler_interval_secs: u64,

    pub install_lock_seconds: u64,
    pub install_lock_scope: LockScope,
    pub install_allowed_macs: Vec<String>,
    pub install_require_discovered: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 5000)),
            log_level: "info".to_string(),
            database_url: DbConfig::default().database_url,
            db_max_connections: DbConfig::default().max_connections,
            run_migrations: true,
            matchbox_uri: "http://127.0.0.1:8080".to_string(),
            matchbox_health_paths: ["/", "/boot.ipxe", "/boot.ipxe.0", "/assets", "/metadata"]
                .iter()
                .map(|p| p.to_string())
                .collect(),
            matchbox_timeout_secs: 5,
            etcd_member_kubernetes_control_plane_expected_nb: 3,
            kubernetes_node_expected_nb: None,
            scheduler_interval_secs: 0,
            install_lock_seconds: 29,
            install_lock_scope: LockScope::Machine,
            install_allowed_macs: Vec::new(),
            install_require_discovered: false,
        }
    }
}

impl Config {
    /// Load from the file named by `METALCAST_CONFIG` (if set) and the
    /// process environment.
    pub fn load() -> Result<Self> {
        let file = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(file, None)
    }

    /// Load from an optional file and an explicit environment map
    /// (`None` reads the process environment).
    pub fn load_from(
        file: Option<PathBuf>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = &file {
            builder = builder.add_source(config::File::from(path.as_path()).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("matchbox_health_paths")
                .with_list_parse_key("install_allowed_macs")
                .source(env),
        );

        let config: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match &file {
                Some(path) => format!("invalid configuration in {}", path.display()),
                None => "invalid configuration".to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.etcd_member_kubernetes_control_plane_expected_nb == 0 {
            anyhow::bail!("etcd_member_kubernetes_control_plane_expected_nb must be at least 1");
        }
        self.allowed_macs()?;
        Ok(())
    }

    pub fn database(&self) -> DbConfig {
        DbConfig {
            database_url: self.database_url.clone(),
            max_connections: self.db_max_connections,
            ..Default::default()
        }
    }

    pub fn policy(&self) -> PolicySettings {
        PolicySettings {
            control_plane_expected_nb: self.etcd_member_kubernetes_control_plane_expected_nb,
            node_expected_nb: self.kubernetes_node_expected_nb,
            apply_dependencies: true,
        }
    }

    pub fn install_lock(&self) -> Result<InstallLockSettings> {
        Ok(InstallLockSettings {
            ttl: Duration::from_secs(self.install_lock_seconds),
            scope: self.install_lock_scope,
            allowed_macs: self.allowed_macs()?,
            require_discovered: self.install_require_discovered,
        })
    }

    pub fn scheduler_interval(&self) -> Option<Duration> {
        (self.scheduler_interval_secs > 0).then(|| Duration::from_secs(self.scheduler_interval_secs))
    }

    pub fn matchbox_timeout(&self) -> Duration {
        Duration::from_secs(self.matchbox_timeout_secs)
    }

    fn allowed_macs(&self) -> Result<Vec<MacAddress>> {
        self.install_allowed_macs
            .iter()
            .map(|s| MacAddress::parse(s).with_context(|| format!("invalid install_allowed_macs entry {s:?}")))
            .collect()
    }
}
