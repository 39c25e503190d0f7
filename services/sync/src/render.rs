//! Per-machine parameter bundles rendered into group metadata.

use std::collections::BTreeMap;

use metalcast_model::{join_roles, ReportedDisk, ScheduleRole, ScheduledMachine};
use metalcast_networking::{cni_ipam, order_etcd_named, order_http_uri, Scheme};
use serde::Serialize;
use tracing::{error, warn};

use crate::config::SyncConfig;
use crate::error::SyncResult;

/// Host naming attributes derived from an FQDN such as `r13-srv3.dc1.example`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DnsAttr {
    pub shortname: String,
    pub dc: String,
    pub domain: String,
    pub rack: String,
    pub pos: String,
}

/// Split an FQDN into shortname, datacenter, domain, rack and position.
///
/// Missing parts are left empty and logged.
pub fn get_dns_attr(fqdn: &str) -> DnsAttr {
    let parts: Vec<&str> = fqdn.split('.').collect();
    let mut attr = DnsAttr {
        shortname: parts[0].to_string(),
        ..Default::default()
    };
    if parts.len() < 2 {
        error!(%fqdn, "no datacenter component in fqdn");
        return attr;
    }
    attr.dc = parts[1].to_string();
    attr.domain = parts[1..].join(".");

    let digits = |s: &str| s.chars().filter(char::is_ascii_digit).collect::<String>();
    match parts[0].split('-').collect::<Vec<_>>().as_slice() {
        [rack, pos] => {
            attr.rack = digits(rack);
            attr.pos = digits(pos);
        }
        _ => error!(shortname = parts[0], "cannot split rack/pos"),
    }
    attr
}

/// Disk profile label for the summed disk size in GiB.
///
/// The first label whose bound exceeds the total wins; past the largest
/// bound the largest label is used. No disks means `inMemory`.
pub fn compute_disks_size(disks: &[ReportedDisk], ladder: &BTreeMap<String, u64>) -> String {
    if disks.is_empty() {
        return "inMemory".to_string();
    }
    let total_gb: u64 = disks.iter().map(|d| d.size_bytes >> 30).sum();

    let mut steps: Vec<(&String, &u64)> = ladder.iter().collect();
    steps.sort_by_key(|(_, bound)| **bound);
    steps
        .iter()
        .find(|(_, bound)| total_gb < **bound)
        .or_else(|| steps.last())
        .map(|(label, _)| label.to_string())
        .unwrap_or_default()
}

/// `<prefix>-<i>-<ip with dashes>`, used when a machine reported no FQDN.
pub fn automatic_name(prefix: &str, index: usize, machine: &ScheduledMachine) -> String {
    format!(
        "{}-{}-{}",
        prefix,
        index,
        machine.ipv4.to_string().replace('.', "-")
    )
}

/// Cluster-wide facts shared by every bundle of a pass.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    /// Sorted IPv4 addresses of the etcd members.
    pub etcd_member_ips: Vec<String>,
    /// Sorted IPv4 addresses of the Kubernetes control plane.
    pub control_plane_ips: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkAttr {
    pub cidrv4: String,
    pub gateway: String,
    pub ip: String,
    pub subnet: String,
    pub perennial_host_ip: String,
    pub ip_or_fqdn: String,
}

/// Metadata every scheduled machine receives.
#[derive(Debug, Clone, Serialize)]
pub struct MachineMetadata {
    pub etc_hosts: Vec<String>,
    pub etcd_name: String,

    pub kubernetes_etcd_initial_cluster: String,
    pub vault_etcd_initial_cluster: String,
    pub fleet_etcd_initial_cluster: String,

    pub kubernetes_etcd_initial_advertise_peer_urls: String,
    pub vault_etcd_initial_advertise_peer_urls: String,
    pub fleet_etcd_initial_advertise_peer_urls: String,

    pub kubernetes_etcd_member_client_uri_list: String,
    pub vault_etcd_member_client_uri_list: String,
    pub fleet_etcd_member_client_uri_list: String,

    pub kubernetes_etcd_data_dir: String,
    pub vault_etcd_data_dir: String,
    pub fleet_etcd_data_dir: String,

    pub kubernetes_etcd_client_port: u16,
    pub vault_etcd_client_port: u16,
    pub fleet_etcd_client_port: u16,

    pub kubernetes_etcd_advertise_client_urls: String,
    pub vault_etcd_advertise_client_urls: String,
    pub fleet_etcd_advertise_client_urls: String,

    pub kubernetes_apiserver_insecure_port: u16,
    pub kubernetes_control_plane_uri_list: String,
    pub kubernetes_node_ip: String,
    pub kubernetes_node_name: String,
    pub kubernetes_service_cluster_ip_range: String,

    pub vault_ip_list: String,
    pub vault_port: u16,
    pub kubelet_healthz_port: u16,

    pub etcd_member_kubernetes_control_plane_ip_list: String,
    pub etcd_member_kubernetes_control_plane_ip: Vec<String>,

    pub hyperkube_image_url: String,
    pub cephtools_image_url: String,

    /// Host-local IPAM block as JSON text with sorted keys.
    pub cni: String,
    pub network: NetworkAttr,

    pub hostname: String,
    pub dns_attr: DnsAttr,
    pub nameservers: String,
    pub ntp: String,
    pub fallbackntp: String,
    pub vault_polling_sec: u64,
    pub lifecycle_update_polling_sec: u64,
    pub disk_profile: String,

    /// Comma-joined roles of the profile the machine is rendered into.
    pub roles: String,

    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<ControlPlaneMetadata>,
}

/// Extra metadata for etcd members running the Kubernetes control plane.
#[derive(Debug, Clone, Serialize)]
pub struct ControlPlaneMetadata {
    pub kubernetes_etcd_member_peer_uri_list: String,
    pub vault_etcd_member_peer_uri_list: String,
    pub fleet_etcd_member_peer_uri_list: String,

    pub kubernetes_etcd_peer_port: u16,
    pub vault_etcd_peer_port: u16,
    pub fleet_etcd_peer_port: u16,

    pub kubernetes_apiserver_count: usize,
    pub kubernetes_apiserver_insecure_bind_address: String,
}

impl ControlPlaneMetadata {
    pub fn new(config: &SyncConfig, cluster: &ClusterView, apiserver_count: usize) -> Self {
        let peers = |port: u16| order_http_uri(&cluster.etcd_member_ips, port, Scheme::Https).join(",");
        Self {
            kubernetes_etcd_member_peer_uri_list: peers(config.kubernetes_etcd_peer_port),
            vault_etcd_member_peer_uri_list: peers(config.vault_etcd_peer_port),
            fleet_etcd_member_peer_uri_list: peers(config.fleet_etcd_peer_port),
            kubernetes_etcd_peer_port: config.kubernetes_etcd_peer_port,
            vault_etcd_peer_port: config.vault_etcd_peer_port,
            fleet_etcd_peer_port: config.fleet_etcd_peer_port,
            kubernetes_apiserver_count: apiserver_count,
            kubernetes_apiserver_insecure_bind_address: config
                .kubernetes_apiserver_insecure_bind_address
                .clone(),
        }
    }
}

/// Build the bundle for one machine rendered into a profile holding `roles`.
pub fn machine_metadata(
    config: &SyncConfig,
    cluster: &ClusterView,
    machine: &ScheduledMachine,
    automatic_name: &str,
    roles: &[ScheduleRole],
) -> SyncResult<MachineMetadata> {
    let fqdn = match machine.fqdn.as_deref() {
        Some(fqdn) if !fqdn.is_empty() => fqdn.to_string(),
        _ => {
            warn!(mac = %machine.mac, name = automatic_name, "no fqdn reported, using automatic name");
            automatic_name.to_string()
        }
    };
    let ip = machine.ipv4.to_string();
    let dns_attr = get_dns_attr(&fqdn);

    let mut etc_hosts = config.etc_hosts.clone();
    etc_hosts.push(format!("127.0.1.1 {} {}", fqdn, dns_attr.shortname));

    let ipam = cni_ipam(&machine.cidrv4, machine.gateway, &config.cni())?;

    let etcd = &cluster.etcd_member_ips;
    let initial_cluster = |port: u16| order_etcd_named(etcd, port, Scheme::Https);
    let client_uris = |port: u16| order_http_uri(etcd, port, Scheme::Https).join(",");
    let own_uri = |port: u16| format!("https://{ip}:{port}");

    Ok(MachineMetadata {
        etc_hosts,
        etcd_name: ip.clone(),

        kubernetes_etcd_initial_cluster: initial_cluster(config.kubernetes_etcd_peer_port),
        vault_etcd_initial_cluster: initial_cluster(config.vault_etcd_peer_port),
        fleet_etcd_initial_cluster: initial_cluster(config.fleet_etcd_peer_port),

        kubernetes_etcd_initial_advertise_peer_urls: own_uri(config.kubernetes_etcd_peer_port),
        vault_etcd_initial_advertise_peer_urls: own_uri(config.vault_etcd_peer_port),
        fleet_etcd_initial_advertise_peer_urls: own_uri(config.fleet_etcd_peer_port),

        kubernetes_etcd_member_client_uri_list: client_uris(config.kubernetes_etcd_client_port),
        vault_etcd_member_client_uri_list: client_uris(config.vault_etcd_client_port),
        fleet_etcd_member_client_uri_list: client_uris(config.fleet_etcd_client_port),

        kubernetes_etcd_data_dir: config.kubernetes_etcd_data_dir.clone(),
        vault_etcd_data_dir: config.vault_etcd_data_dir.clone(),
        fleet_etcd_data_dir: config.fleet_etcd_data_dir.clone(),

        kubernetes_etcd_client_port: config.kubernetes_etcd_client_port,
        vault_etcd_client_port: config.vault_etcd_client_port,
        fleet_etcd_client_port: config.fleet_etcd_client_port,

        kubernetes_etcd_advertise_client_urls: own_uri(config.kubernetes_etcd_client_port),
        vault_etcd_advertise_client_urls: own_uri(config.vault_etcd_client_port),
        fleet_etcd_advertise_client_urls: own_uri(config.fleet_etcd_client_port),

        kubernetes_apiserver_insecure_port: config.kubernetes_apiserver_insecure_port,
        kubernetes_control_plane_uri_list: order_http_uri(
            &cluster.control_plane_ips,
            config.kubernetes_apiserver_insecure_port,
            Scheme::Http,
        )
        .join(","),
        kubernetes_node_ip: ip.clone(),
        kubernetes_node_name: if fqdn == automatic_name {
            ip.clone()
        } else {
            fqdn.clone()
        },
        kubernetes_service_cluster_ip_range: config.kubernetes_service_cluster_ip_range.clone(),

        vault_ip_list: etcd.join(","),
        vault_port: config.vault_port,
        kubelet_healthz_port: config.kubelet_healthz_port,

        etcd_member_kubernetes_control_plane_ip_list: etcd.join(","),
        etcd_member_kubernetes_control_plane_ip: etcd.clone(),

        hyperkube_image_url: config.hyperkube_image_url.clone(),
        cephtools_image_url: config.cephtools_image_url.clone(),

        cni: ipam.to_sorted_json()?,
        network: NetworkAttr {
            cidrv4: machine.cidrv4.clone(),
            gateway: machine.gateway.to_string(),
            ip: ip.clone(),
            subnet: ipam.subnet.clone(),
            perennial_host_ip: config.perennial_local_host_ip.to_string(),
            ip_or_fqdn: if config.sync_replace_ip_by_fqdn {
                fqdn.clone()
            } else {
                ip.clone()
            },
        },

        hostname: dns_attr.shortname.clone(),
        dns_attr,
        nameservers: config.nameservers.join(" "),
        ntp: config.ntp.join(" "),
        fallbackntp: config.fallbackntp.join(" "),
        vault_polling_sec: config.vault_polling_sec,
        lifecycle_update_polling_sec: config.lifecycle_update_polling_sec,
        disk_profile: compute_disks_size(&machine.disks, &config.disks_ladder_gb),

        roles: join_roles(roles),
        control_plane: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn disk(gib: u64) -> ReportedDisk {
        ReportedDisk {
            path: "/dev/sda".to_string(),
            size_bytes: gib << 30,
        }
    }

    fn machine(fqdn: Option<&str>) -> ScheduledMachine {
        serde_json::from_value(serde_json::json!({
            "mac": "52:54:00:e8:32:5b",
            "name": "eth0",
            "ipv4": "172.20.0.65",
            "cidrv4": "172.20.0.65/21",
            "netmask": 21,
            "gateway": "172.20.0.1",
            "as_boot": true,
            "fqdn": fqdn,
            "roles": "etcd-member,kubernetes-control-plane",
            "disks": [{"path": "/dev/sda", "size-bytes": 21474836480u64}],
            "created_date": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    fn cluster() -> ClusterView {
        ClusterView {
            etcd_member_ips: vec!["172.20.0.65".into(), "172.20.0.66".into()],
            control_plane_ips: vec!["172.20.0.65".into()],
        }
    }

    #[test]
    fn dns_attr_full() {
        assert_eq!(
            get_dns_attr("r13-srv3.dc1.example.com"),
            DnsAttr {
                shortname: "r13-srv3".into(),
                dc: "dc1".into(),
                domain: "dc1.example.com".into(),
                rack: "13".into(),
                pos: "3".into(),
            }
        );
    }

    #[rstest]
    #[case("host", "host", "", "")]
    #[case("host.dc1", "host", "dc1", "")]
    #[case("a-b-c.dc1", "a-b-c", "dc1", "")]
    fn dns_attr_degrades(
        #[case] fqdn: &str,
        #[case] shortname: &str,
        #[case] dc: &str,
        #[case] rack: &str,
    ) {
        let attr = get_dns_attr(fqdn);
        assert_eq!(attr.shortname, shortname);
        assert_eq!(attr.dc, dc);
        assert_eq!(attr.rack, rack);
        assert_eq!(attr.pos, "");
    }

    #[rstest]
    #[case(vec![], "inMemory")]
    #[case(vec![disk(5)], "S")]
    #[case(vec![disk(10)], "M")]
    #[case(vec![disk(20)], "L")]
    #[case(vec![disk(20), disk(20)], "L")]
    fn disk_profile_ladder(#[case] disks: Vec<ReportedDisk>, #[case] expected: &str) {
        let ladder = SyncConfig::default().disks_ladder_gb;
        assert_eq!(compute_disks_size(&disks, &ladder), expected);
    }

    #[test]
    fn sizes_are_truncated_per_disk() {
        let ladder = BTreeMap::from([("small".to_string(), 3), ("big".to_string(), 100)]);
        let just_under = ReportedDisk {
            path: "/dev/sdb".into(),
            size_bytes: (2 << 30) - 1,
        };
        assert_eq!(compute_disks_size(&[just_under.clone(), just_under], &ladder), "small");
    }

    #[test]
    fn automatic_name_uses_dashed_ip() {
        assert_eq!(automatic_name("cp", 0, &machine(None)), "cp-0-172-20-0-65");
    }

    #[test]
    fn bundle_without_fqdn_uses_ip_as_node_name() {
        let config = SyncConfig::default();
        let m = machine(None);
        let name = automatic_name("cp", 0, &m);
        let md = machine_metadata(&config, &cluster(), &m, &name, &[ScheduleRole::EtcdMember])
            .unwrap();

        assert_eq!(md.kubernetes_node_name, "172.20.0.65");
        assert_eq!(md.hostname, "cp-0-172-20-0-65");
        assert_eq!(md.etc_hosts.last().unwrap(), "127.0.1.1 cp-0-172-20-0-65 cp-0-172-20-0-65");
        assert_eq!(md.network.ip_or_fqdn, "172.20.0.65");
        assert_eq!(md.disk_profile, "L");
        assert_eq!(md.roles, "etcd-member");
    }

    #[test]
    fn bundle_golden_fields() {
        let config = SyncConfig {
            sync_replace_ip_by_fqdn: true,
            ..Default::default()
        };
        let m = machine(Some("r1-p2.dc1.example"));
        let md = machine_metadata(&config, &cluster(), &m, "cp-0-172-20-0-65", &[]).unwrap();

        assert_eq!(md.kubernetes_node_name, "r1-p2.dc1.example");
        assert_eq!(md.network.ip_or_fqdn, "r1-p2.dc1.example");
        assert_eq!(md.network.subnet, "172.20.0.0/21");
        assert_eq!(
            md.kubernetes_etcd_initial_cluster,
            "172.20.0.65=https://172.20.0.65:2380,172.20.0.66=https://172.20.0.66:2380"
        );
        assert_eq!(
            md.fleet_etcd_member_client_uri_list,
            "https://172.20.0.65:4001,https://172.20.0.66:4001"
        );
        assert_eq!(md.kubernetes_etcd_advertise_client_urls, "https://172.20.0.65:2379");
        assert_eq!(md.kubernetes_control_plane_uri_list, "http://172.20.0.65:8080");
        assert_eq!(md.vault_ip_list, "172.20.0.65,172.20.0.66");
        assert_eq!(md.nameservers, "8.8.8.8 8.8.4.4");
        assert!(md.cni.contains("\"rangeStart\":\"172.20.65.1\""));

        let value = serde_json::to_value(&md).unwrap();
        assert!(value.get("kubernetes_apiserver_count").is_none());
        assert_eq!(value["dns_attr"]["rack"], "1");
    }

    #[test]
    fn control_plane_fields_are_flattened() {
        let config = SyncConfig::default();
        let m = machine(None);
        let mut md = machine_metadata(&config, &cluster(), &m, "cp-0-172-20-0-65", &[]).unwrap();
        md.control_plane = Some(ControlPlaneMetadata::new(&config, &cluster(), 3));

        let value = serde_json::to_value(&md).unwrap();
        assert_eq!(value["kubernetes_apiserver_count"], 3);
        assert_eq!(
            value["kubernetes_etcd_member_peer_uri_list"],
            "https://172.20.0.65:2380,https://172.20.0.66:2380"
        );
        assert_eq!(value["kubernetes_apiserver_insecure_bind_address"], "127.0.0.1");
    }

    proptest! {
        #[test]
        fn disk_profile_is_a_ladder_label(sizes in proptest::collection::vec(0u64..(1 << 40), 1..6)) {
            let ladder = SyncConfig::default().disks_ladder_gb;
            let disks: Vec<ReportedDisk> = sizes
                .iter()
                .map(|size| ReportedDisk { path: "/dev/sda".into(), size_bytes: *size })
                .collect();
            let label = compute_disks_size(&disks, &ladder);
            prop_assert!(ladder.contains_key(&label));
        }
    }
}
