//! Lifecycle queries and status records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use metalcast_id::{MacAddress, MachineUuid};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ModelError;

/// How a machine applies a new configuration during a rolling update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RollingStrategy {
    #[default]
    Kexec,
    Reboot,
    Poweroff,
}

impl RollingStrategy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            RollingStrategy::Kexec => "kexec",
            RollingStrategy::Reboot => "reboot",
            RollingStrategy::Poweroff => "poweroff",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "kexec" => Ok(RollingStrategy::Kexec),
            "reboot" => Ok(RollingStrategy::Reboot),
            "poweroff" => Ok(RollingStrategy::Poweroff),
            other => Err(ModelError::UnknownStrategy(other.to_string())),
        }
    }
}

impl fmt::Display for RollingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RollingStrategy {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RollingStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RollingStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// A machine identified by the raw query string it sent, e.g.
/// `mac=52-54-00-e8-32-5b&uuid=b7f5f93a-...&os=installed`.
///
/// The raw string is kept verbatim so it can be echoed back and replayed
/// against the boot-config service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleQuery {
    pub mac: MacAddress,
    pub uuid: MachineUuid,
    pub raw: String,
}

impl LifecycleQuery {
    /// Parses a raw query; `mac` and `uuid` are both required.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let mut mac = None;
        let mut uuid = None;

        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            match key.as_ref() {
                "mac" => mac = Some(value.into_owned()),
                "uuid" => uuid = Some(value.into_owned()),
                _ => {}
            }
        }

        let mac = mac.ok_or(ModelError::MissingAttribute("mac"))?;
        let uuid = uuid.ok_or(ModelError::MissingAttribute("uuid"))?;

        Ok(Self {
            mac: MacAddress::parse(&mac)
                .map_err(|source| ModelError::InvalidAttribute { field: "mac", source })?,
            uuid: MachineUuid::parse(&uuid)
                .map_err(|source| ModelError::InvalidAttribute { field: "uuid", source })?,
            raw: raw.to_string(),
        })
    }

    /// Extracts only the MAC, for callers (install authorization) that
    /// do not send a UUID.
    pub fn parse_mac(raw: &str) -> Result<MacAddress, ModelError> {
        let value = url::form_urlencoded::parse(raw.as_bytes())
            .find(|(key, _)| key == "mac")
            .map(|(_, value)| value.into_owned())
            .ok_or(ModelError::MissingAttribute("mac"))?;
        MacAddress::parse(&value)
            .map_err(|source| ModelError::InvalidAttribute { field: "mac", source })
    }
}

/// Response of `GET /lifecycle/rolling/<raw_query>` and list entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingStatus {
    pub enable: bool,
    pub strategy: Option<RollingStrategy>,
    pub request_raw_query: String,
}

/// Latest install outcome of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreosInstallStatus {
    pub mac: MacAddress,
    pub success: bool,
    pub request_raw_query: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

/// Whether the ignition a machine last applied matched the served one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IgnitionStatus {
    pub mac: MacAddress,
    pub up_to_date: bool,
    pub request_raw_query: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}

/// Entry of `GET /lifecycle/rolling`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingEntry {
    pub mac: MacAddress,
    pub enable: bool,
    pub strategy: RollingStrategy,
    pub request_raw_query: String,
    pub created_date: DateTime<Utc>,
    pub updated_date: DateTime<Utc>,
}
