//! Discovery reports posted by booting machines.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use metalcast_id::{MacAddress, MachineUuid};
use serde::{Deserialize, Serialize};

use crate::ModelError;

/// Hardware facts reported by a machine during PXE boot.
///
/// Unknown top-level keys (for example the ignition journal some agents
/// attach) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryReport {
    #[serde(rename = "boot-info")]
    pub boot_info: BootInfo,

    #[serde(default)]
    pub interfaces: Vec<ReportedInterface>,

    #[serde(default)]
    pub disks: Vec<ReportedDisk>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lldp: Option<LldpReport>,
}

/// Identity of the machine and the interface it booted from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BootInfo {
    pub uuid: MachineUuid,
    pub mac: MacAddress,

    #[serde(
        rename = "created-date",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub created_date: Option<DateTime<Utc>>,

    #[serde(
        rename = "updated-date",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_date: Option<DateTime<Utc>>,
}

/// A network interface as seen by the discovery agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedInterface {
    pub name: String,
    pub mac: MacAddress,
    pub ipv4: Ipv4Addr,
    pub cidrv4: String,
    pub netmask: u8,
    pub gateway: Ipv4Addr,

    #[serde(default)]
    pub fqdn: Option<String>,

    /// Derived on ingestion; any value sent by the agent is overwritten.
    #[serde(default)]
    pub as_boot: bool,
}

/// A block device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportedDisk {
    pub path: String,

    #[serde(rename = "size-bytes")]
    pub size_bytes: u64,
}

/// Neighbor discovery data collected by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpReport {
    pub is_file: bool,

    #[serde(default)]
    pub data: Option<LldpData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpData {
    #[serde(default)]
    pub interfaces: Vec<LldpNeighbor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpNeighbor {
    pub chassis: LldpChassis,
    pub port: LldpPort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpChassis {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LldpPort {
    pub id: String,
}

impl DiscoveryReport {
    /// Marks the boot interface and checks there is exactly one.
    pub fn normalized(mut self) -> Result<Self, ModelError> {
        let boot_mac = self.boot_info.mac;
        let mut boot_count = 0;
        for interface in &mut self.interfaces {
            interface.as_boot = interface.mac == boot_mac;
            if interface.as_boot {
                boot_count += 1;
            }
        }

        match boot_count {
            1 => Ok(self),
            0 => Err(ModelError::InvalidReport(format!(
                "no interface matches boot mac {boot_mac}"
            ))),
            n => Err(ModelError::InvalidReport(format!(
                "{n} interfaces match boot mac {boot_mac}"
            ))),
        }
    }

    /// The interface the machine booted from.
    pub fn boot_interface(&self) -> Option<&ReportedInterface> {
        self.interfaces.iter().find(|i| i.as_boot)
    }
}
