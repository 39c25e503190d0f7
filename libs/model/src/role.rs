//! Schedulable cluster roles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ModelError;

/// A cluster role a machine can be scheduled into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScheduleRole {
    EtcdMember,
    KubernetesControlPlane,
    KubernetesNode,
}

impl ScheduleRole {
    /// Every known role, in the order advertised to API callers.
    pub const ALL: [ScheduleRole; 3] = [
        ScheduleRole::EtcdMember,
        ScheduleRole::KubernetesControlPlane,
        ScheduleRole::KubernetesNode,
    ];

    /// Wire name of the role.
    pub const fn as_str(&self) -> &'static str {
        match self {
            ScheduleRole::EtcdMember => "etcd-member",
            ScheduleRole::KubernetesControlPlane => "kubernetes-control-plane",
            ScheduleRole::KubernetesNode => "kubernetes-node",
        }
    }

    /// Looks up a role by wire name.
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        Self::ALL
            .into_iter()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| ModelError::UnknownRole(s.to_string()))
    }
}

/// Parses a list of role names, failing on the first unknown one.
pub fn parse_roles<I, S>(names: I) -> Result<Vec<ScheduleRole>, ModelError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| ScheduleRole::parse(name.as_ref()))
        .collect()
}

/// Joins roles with `,`, the format stored alongside scheduled machines.
pub fn join_roles(roles: &[ScheduleRole]) -> String {
    roles
        .iter()
        .map(ScheduleRole::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

impl fmt::Display for ScheduleRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleRole {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ScheduleRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ScheduleRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
