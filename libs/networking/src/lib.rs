//! Networking helpers for rendering machine boot configuration.
//!
//! This library provides:
//! - IPv4 interface parsing (`a.b.c.d/len`) and network arithmetic
//! - Static CNI host-local IPAM derivation per host
//! - Deterministically ordered endpoint lists for etcd and API clusters

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::Serialize;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// `sub_ips` is not a power of two in `[0, 256]`.
    #[error("sub_ips must be a power of two, in [0, 256] interval: got {0}")]
    InvalidSubIps(u32),

    /// Address arithmetic left the IPv4 space.
    #[error("address arithmetic overflow: {0}")]
    AddressOverflow(String),
}

// ============================================================================
// IPv4 interfaces
// ============================================================================

/// An IPv4 host address together with its prefix length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Interface {
    /// Host address (not masked).
    pub address: Ipv4Addr,

    /// Prefix length (e.g., 21 for /21).
    pub prefix_len: u8,
}

impl Ipv4Interface {
    /// Create a new interface.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, NetworkError> {
        if prefix_len > 32 {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds 32",
                prefix_len
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "172.20.0.65/21").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = Ipv4Addr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Network address of the interface.
    pub fn network_address(&self) -> Ipv4Addr {
        mask_ipv4(self.address, self.prefix_len)
    }

    /// Network in CIDR notation (e.g., "172.20.0.0/21").
    pub fn network(&self) -> String {
        format!("{}/{}", self.network_address(), self.prefix_len)
    }

    /// Last dotted-decimal field of the host address.
    pub fn last_octet(&self) -> u8 {
        self.address.octets()[3]
    }
}

impl std::fmt::Display for Ipv4Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

/// Mask an IPv4 address to a prefix length.
fn mask_ipv4(addr: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let bits = u32::from(addr);
    let mask = if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from(bits & mask)
}

/// Add an offset to an address, failing past 255.255.255.255.
pub fn add_offset(addr: Ipv4Addr, offset: u32) -> Result<Ipv4Addr, NetworkError> {
    u32::from(addr)
        .checked_add(offset)
        .map(Ipv4Addr::from)
        .ok_or_else(|| NetworkError::AddressOverflow(format!("{} + {}", addr, offset)))
}

// ============================================================================
// CNI host-local IPAM
// ============================================================================

/// Parameters for carving a per-host pod address range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CniIpamSettings {
    /// Size of the block reserved per host; 0 starts the range at the host IP.
    pub sub_ips: u32,

    /// Addresses skipped at the start of the block.
    pub skip_ips: u32,

    /// Number of addresses after `rangeStart`.
    pub range_nb_ips: u32,

    /// Address routed through the host itself (/32).
    pub perennial_local_host_ip: Ipv4Addr,
}

impl Default for CniIpamSettings {
    fn default() -> Self {
        Self {
            sub_ips: 256,
            skip_ips: 1,
            range_nb_ips: 253,
            perennial_local_host_ip: Ipv4Addr::new(172, 31, 255, 255),
        }
    }
}

impl CniIpamSettings {
    /// Checks `sub_ips` is a power of two (or zero) no larger than 256.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.sub_ips > 256 || self.sub_ips & self.sub_ips.wrapping_sub(1) != 0 {
            return Err(NetworkError::InvalidSubIps(self.sub_ips));
        }
        Ok(())
    }
}

/// A host-local IPAM block, serialized with CNI key names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostLocalIpam {
    #[serde(rename = "type")]
    pub kind: String,
    pub subnet: String,
    #[serde(rename = "rangeStart")]
    pub range_start: Ipv4Addr,
    #[serde(rename = "rangeEnd")]
    pub range_end: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub routes: Vec<CniRoute>,
    #[serde(rename = "dataDir")]
    pub data_dir: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CniRoute {
    pub dst: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<Ipv4Addr>,
}

/// Data directory used by the host-local plugin.
pub const CNI_DATA_DIR: &str = "/var/lib/cni/networks";

impl HostLocalIpam {
    /// JSON text with keys in sorted order, as embedded in rendered metadata.
    pub fn to_sorted_json(&self) -> Result<String, serde_json::Error> {
        let value = serde_json::to_value(self)?;
        Ok(metalcast_reconcile::canonical_json(&value))
    }
}

/// Derive the static host-local IPAM block for a host.
///
/// With `sub_ips > 0` the block starts at `network + last_octet * sub_ips`,
/// otherwise at the host address. The multiplication is not range-checked
/// against the host's network; only leaving the IPv4 space is an error.
pub fn cni_ipam(
    host_cidrv4: &str,
    host_gateway: Ipv4Addr,
    settings: &CniIpamSettings,
) -> Result<HostLocalIpam, NetworkError> {
    let interface = Ipv4Interface::from_cidr(host_cidrv4)?;
    settings.validate()?;

    let base = if settings.sub_ips > 0 {
        let offset = u32::from(interface.last_octet()) * settings.sub_ips;
        add_offset(interface.network_address(), offset)?
    } else {
        interface.address
    };

    let range_start = add_offset(base, settings.skip_ips)?;
    let range_end = add_offset(range_start, settings.range_nb_ips)?;

    Ok(HostLocalIpam {
        kind: "host-local".to_string(),
        subnet: interface.network(),
        range_start,
        range_end,
        gateway: host_gateway,
        routes: vec![
            CniRoute {
                dst: format!("{}/32", settings.perennial_local_host_ip),
                gw: Some(interface.address),
            },
            CniRoute {
                dst: "0.0.0.0/0".to_string(),
                gw: None,
            },
        ],
        data_dir: CNI_DATA_DIR.to_string(),
    })
}

// ============================================================================
// Ordered endpoint lists
// ============================================================================

/// URI scheme for rendered endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Sort addresses on their dotted-decimal text.
///
/// The order is lexicographic, not numeric: `10.0.0.10` sorts before
/// `10.0.0.9`. Every rendered cluster string depends on this order.
pub fn sort_ip_list<S: AsRef<str>>(ips: &[S]) -> Vec<String> {
    let mut sorted: Vec<String> = ips.iter().map(|ip| ip.as_ref().to_string()).collect();
    sorted.sort();
    sorted
}

/// `scheme://ip:port` for each address, in sorted order.
pub fn order_http_uri<S: AsRef<str>>(ips: &[S], port: u16, scheme: Scheme) -> Vec<String> {
    sort_ip_list(ips)
        .into_iter()
        .map(|ip| format!("{}://{}:{}", scheme.as_str(), ip, port))
        .collect()
}

/// `ip=scheme://ip:port` for each address, sorted and comma-joined.
///
/// This is the format of etcd's `initial-cluster` flag with members named
/// after their address.
pub fn order_etcd_named<S: AsRef<str>>(ips: &[S], port: u16, scheme: Scheme) -> String {
    sort_ip_list(ips)
        .into_iter()
        .map(|ip| format!("{}={}://{}:{}", ip, scheme.as_str(), ip, port))
        .collect::<Vec<_>>()
        .join(",")
}
