//! Sync engine configuration.
//!
//! Same layering as the control plane: defaults, then the file named by
//! `METALCAST_CONFIG`, then `METALCAST_*` variables. Map-valued keys take
//! nested variables such as `METALCAST_EXTRA_SELECTORS__OS=installed`.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use metalcast_networking::CniIpamSettings;
use metalcast_reconcile::FixedRetry;
use serde::Deserialize;

const ENV_PREFIX: &str = "METALCAST";

/// Marker of the control-plane profile; also its key in `ignition_dict`.
pub const CONTROL_PLANE_MARKER: &str = "etcd_member_kubernetes_control_plane";
/// Marker of the worker profile.
pub const NODES_MARKER: &str = "kubernetes_nodes";

const LIST_KEYS: [&str; 4] = ["etc_hosts", "nameservers", "ntp", "fallbackntp"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub log_level: String,

    /// Control-plane API queried for schedules and notified after a pass.
    pub api_uri: String,
    pub http_timeout_secs: u64,

    /// Boot-config service, referenced from rendered kernel arguments.
    pub matchbox_uri: String,
    /// Boot-config data directory (`profiles/`, `groups/`, `ignition/`).
    pub matchbox_path: PathBuf,
    /// Profile marker to ignition template name, without `.yaml`.
    pub ignition_dict: BTreeMap<String, String>,
    pub extra_selectors: BTreeMap<String, String>,

    pub kernel: String,
    pub initrd: String,
    /// Prefix for kernel/initrd paths; the boot-config service itself when unset.
    pub assets_server_uri: Option<String>,

    pub sub_ips: u32,
    pub skip_ips: u32,
    pub range_nb_ips: u32,
    pub perennial_local_host_ip: Ipv4Addr,

    /// Seconds a scheduler answer stays cached; 0 disables the cache.
    pub sync_cache_ttl: u64,
    pub nb_try: u32,
    pub retry_delay_secs: u64,

    pub kubernetes_apiserver_insecure_port: u16,
    pub kubernetes_apiserver_insecure_bind_address: String,
    pub kubernetes_service_cluster_ip_range: String,
    pub kubelet_healthz_port: u16,

    pub kubernetes_etcd_data_dir: String,
    pub kubernetes_etcd_client_port: u16,
    pub kubernetes_etcd_peer_port: u16,
    pub fleet_etcd_data_dir: String,
    pub fleet_etcd_client_port: u16,
    pub fleet_etcd_peer_port: u16,
    pub vault_etcd_data_dir: String,
    pub vault_etcd_client_port: u16,
    pub vault_etcd_peer_port: u16,
    pub vault_port: u16,

    pub hyperkube_image_url: String,
    pub cephtools_image_url: String,

    pub etc_hosts: Vec<String>,
    pub nameservers: Vec<String>,
    pub ntp: Vec<String>,
    pub fallbackntp: Vec<String>,
    pub vault_polling_sec: u64,
    pub lifecycle_update_polling_sec: u64,

    /// Disk profile label to upper bound in GiB.
    pub disks_ladder_gb: BTreeMap<String, u64>,
    pub sync_replace_ip_by_fqdn: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            log_level: "info".to_string(),
            api_uri: "http://127.0.0.1:5000".to_string(),
            http_timeout_secs: 10,
            matchbox_uri: "http://127.0.0.1:8080".to_string(),
            matchbox_path: PathBuf::from("/usr/local/matchbox"),
            ignition_dict: BTreeMap::from([
                ("discovery".to_string(), "discovery".to_string()),
                (
                    CONTROL_PLANE_MARKER.to_string(),
                    "etcd-member-control-plane".to_string(),
                ),
                (NODES_MARKER.to_string(), "k8s-node".to_string()),
            ]),
            extra_selectors: BTreeMap::from([("os".to_string(), "installed".to_string())]),
            kernel: "/assets/coreos/serve/coreos_production_pxe.vmlinuz".to_string(),
            initrd: "/assets/coreos/serve/coreos_production_pxe_image.cpio.gz".to_string(),
            assets_server_uri: None,
            sub_ips: 256,
            skip_ips: 1,
            range_nb_ips: 253,
            perennial_local_host_ip: Ipv4Addr::new(172, 31, 255, 255),
            sync_cache_ttl: 0,
            nb_try: 2,
            retry_delay_secs: 0,
            kubernetes_apiserver_insecure_port: 8080,
            kubernetes_apiserver_insecure_bind_address: "127.0.0.1".to_string(),
            kubernetes_service_cluster_ip_range: "172.30.0.0/24".to_string(),
            kubelet_healthz_port: 10248,
            kubernetes_etcd_data_dir: "/var/lib/etcd3/kubernetes".to_string(),
            kubernetes_etcd_client_port: 2379,
            kubernetes_etcd_peer_port: 2380,
            fleet_etcd_data_dir: "/var/lib/etcd3/fleet".to_string(),
            fleet_etcd_client_port: 4001,
            fleet_etcd_peer_port: 7001,
            vault_etcd_data_dir: "/var/lib/etcd3/vault".to_string(),
            vault_etcd_client_port: 4001,
            vault_etcd_peer_port: 7001,
            vault_port: 8200,
            hyperkube_image_url: "enjoliver.local/hyperkube:1.7.7".to_string(),
            cephtools_image_url: "enjoliver.local/ceph-tools:latest".to_string(),
            etc_hosts: strings(&["172.20.0.1 enjoliver.local"]),
            nameservers: strings(&["8.8.8.8", "8.8.4.4"]),
            ntp: strings(&[
                "0.arch.pool.ntp.org",
                "1.arch.pool.ntp.org",
                "2.arch.pool.ntp.org",
                "3.arch.pool.ntp.org",
            ]),
            fallbackntp: strings(&["0.pool.ntp.org", "1.pool.ntp.org", "0.fr.pool.ntp.org"]),
            vault_polling_sec: 30,
            lifecycle_update_polling_sec: 30,
            disks_ladder_gb: BTreeMap::from([
                ("S".to_string(), 10),
                ("M".to_string(), 20),
                ("L".to_string(), 30),
            ]),
            sync_replace_ip_by_fqdn: false,
        }
    }
}

impl SyncConfig {
    /// Load from `file` (usually `METALCAST_CONFIG`) and the process environment.
    pub fn load(file: Option<PathBuf>) -> Result<Self> {
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
        let mut environment = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }
        builder = builder.add_source(environment.source(env));

        let config: SyncConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .with_context(|| match &file {
                Some(path) => format!("invalid sync configuration in {}", path.display()),
                None => "invalid sync configuration".to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        url::Url::parse(&self.api_uri).with_context(|| format!("api_uri {:?}", self.api_uri))?;
        url::Url::parse(&self.matchbox_uri)
            .with_context(|| format!("matchbox_uri {:?}", self.matchbox_uri))?;
        if let Some(assets) = &self.assets_server_uri {
            url::Url::parse(assets).with_context(|| format!("assets_server_uri {assets:?}"))?;
        }
        self.cni().validate()?;
        for marker in [CONTROL_PLANE_MARKER, NODES_MARKER] {
            if !self.ignition_dict.contains_key(marker) {
                anyhow::bail!("ignition_dict has no entry for {marker}");
            }
        }
        if self.disks_ladder_gb.is_empty() {
            anyhow::bail!("disks_ladder_gb must have at least one label");
        }
        Ok(())
    }

    pub fn cni(&self) -> CniIpamSettings {
        CniIpamSettings {
            sub_ips: self.sub_ips,
            skip_ips: self.skip_ips,
            range_nb_ips: self.range_nb_ips,
            perennial_local_host_ip: self.perennial_local_host_ip,
        }
    }

    pub fn retry(&self) -> FixedRetry {
        FixedRetry::new(self.nb_try, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.sync_cache_ttl)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(pairs: &[(&str, &str)]) -> Option<config::Map<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config.sub_ips, 256);
        assert_eq!(config.ignition_dict[NODES_MARKER], "k8s-node");
        assert_eq!(config.extra_selectors["os"], "installed");
        assert_eq!(config.retry(), FixedRetry::new(2, Duration::ZERO));
        assert!(config.cache_ttl().is_zero());
    }

    #[test]
    fn env_overrides_scalars_lists_and_maps() {
        let config = SyncConfig::load_from(
            None,
            env(&[
                ("METALCAST_SUB_IPS", "128"),
                ("METALCAST_SYNC_CACHE_TTL", "30"),
                ("METALCAST_NAMESERVERS", "1.1.1.1,9.9.9.9"),
                ("METALCAST_EXTRA_SELECTORS__RACK", "r1"),
            ]),
        )
        .unwrap();
        assert_eq!(config.sub_ips, 128);
        assert_eq!(config.cache_ttl(), Duration::from_secs(30));
        assert_eq!(config.nameservers, vec!["1.1.1.1", "9.9.9.9"]);
        assert_eq!(config.extra_selectors.get("rack").map(String::as_str), Some("r1"));
    }

    #[test]
    fn file_is_layered_under_env() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"api_uri": "http://api.local:5000", "nb_try": 5, "disks_ladder_gb": {{"XS": 5}}}}"#
        )
        .unwrap();

        let config = SyncConfig::load_from(
            Some(file.path().to_path_buf()),
            env(&[("METALCAST_NB_TRY", "3")]),
        )
        .unwrap();
        assert_eq!(config.api_uri, "http://api.local:5000");
        assert_eq!(config.nb_try, 3);
        assert_eq!(config.disks_ladder_gb.len(), 1);
    }

    #[test]
    fn rejects_bad_sub_ips() {
        let err = SyncConfig::load_from(None, env(&[("METALCAST_SUB_IPS", "100")])).unwrap_err();
        assert!(err.to_string().contains("sub_ips"));
    }

    #[test]
    fn rejects_relative_api_uri() {
        assert!(SyncConfig::load_from(None, env(&[("METALCAST_API_URI", "not a uri")])).is_err());
    }
}
