//! Schedule requests and scheduled machine records.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use metalcast_id::MacAddress;
use serde::{Deserialize, Serialize};

use crate::{ReportedDisk, ScheduleRole};

/// Body of `POST /scheduler`.
///
/// Role names stay as raw strings here so the scheduler can report the
/// first unknown one as a lookup failure before touching the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleRequest {
    #[serde(default)]
    pub roles: Vec<String>,

    #[serde(default)]
    pub selector: Selector,
}

/// Machine selector; only MAC selection is supported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Selector {
    #[serde(default)]
    pub mac: String,
}

impl ScheduleRequest {
    /// Builds a request from typed values.
    pub fn new(mac: MacAddress, roles: &[ScheduleRole]) -> Self {
        Self {
            roles: roles.iter().map(|r| r.as_str().to_string()).collect(),
            selector: Selector {
                mac: mac.to_string(),
            },
        }
    }

    /// The example body returned to callers that sent an unusable request.
    pub fn template() -> Self {
        Self {
            roles: ScheduleRole::ALL
                .iter()
                .map(|r| r.as_str().to_string())
                .collect(),
            selector: Selector::default(),
        }
    }
}

/// A machine holding one or more roles, flattened onto its boot interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledMachine {
    pub mac: MacAddress,
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub cidrv4: String,
    pub netmask: u8,
    pub gateway: Ipv4Addr,
    pub as_boot: bool,

    #[serde(default)]
    pub fqdn: Option<String>,

    /// Comma-joined role names, in schedule order.
    pub roles: String,

    #[serde(default)]
    pub disks: Vec<ReportedDisk>,

    pub created_date: DateTime<Utc>,
}

impl ScheduledMachine {
    /// Roles as a typed list; unknown names are skipped.
    pub fn role_list(&self) -> Vec<ScheduleRole> {
        self.roles
            .split(',')
            .filter_map(|r| ScheduleRole::parse(r).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_lists_every_role_with_empty_selector() {
        let value = serde_json::to_value(ScheduleRequest::template()).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "roles": ["etcd-member", "kubernetes-control-plane", "kubernetes-node"],
                "selector": {"mac": ""}
            })
        );
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let req: ScheduleRequest = serde_json::from_str("{}").unwrap();
        assert!(req.roles.is_empty());
        assert!(req.selector.mac.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let extra = r#"{"roles": ["etcd-member"], "selector": {"mac": "52:54:00:00:00:01"}, "force": true}"#;
        assert!(serde_json::from_str::<ScheduleRequest>(extra).is_err());

        let by_uuid = r#"{"roles": ["etcd-member"], "selector": {"uuid": "b7f5f93a"}}"#;
        assert!(serde_json::from_str::<ScheduleRequest>(by_uuid).is_err());
    }

    #[test]
    fn role_list_parses_joined_roles() {
        let machine: ScheduledMachine = serde_json::from_value(serde_json::json!({
            "mac": "52:54:00:00:00:01",
            "name": "eth0",
            "ipv4": "172.20.0.10",
            "cidrv4": "172.20.0.10/21",
            "netmask": 21,
            "gateway": "172.20.0.1",
            "as_boot": true,
            "roles": "etcd-member,kubernetes-control-plane",
            "created_date": "2026-01-01T00:00:00Z"
        }))
        .unwrap();
        assert_eq!(
            machine.role_list(),
            vec![ScheduleRole::EtcdMember, ScheduleRole::KubernetesControlPlane]
        );
        assert!(machine.fqdn.is_none());
        assert!(machine.disks.is_empty());
    }
}
