//! MAC address identity.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::IdError;

/// A 48-bit hardware address.
///
/// Ordering follows the octets, which is also the lexicographic order of the
/// canonical string form. Stores and APIs rely on that to return machines
/// "ordered by MAC".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Creates a MAC address from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Returns the raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Parses a MAC address in colon (`aa:bb:..`) or hyphen (`aa-bb-..`) form.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(IdError::Empty);
        }

        let separator = match (trimmed.contains(':'), trimmed.contains('-')) {
            (true, false) => ':',
            (false, true) => '-',
            _ => return Err(IdError::InvalidSeparator(s.to_string())),
        };

        let parts: Vec<&str> = trimmed.split(separator).collect();
        if parts.len() != 6 {
            return Err(IdError::WrongOctetCount {
                value: s.to_string(),
                octets: parts.len(),
            });
        }

        let mut octets = [0u8; 6];
        for (slot, part) in octets.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(IdError::InvalidOctet {
                    value: s.to_string(),
                    octet: part.to_string(),
                });
            }
            *slot = u8::from_str_radix(part, 16).map_err(|_| IdError::InvalidOctet {
                value: s.to_string(),
                octet: part.to_string(),
            })?;
        }

        Ok(Self(octets))
    }

    /// Hyphenated form, as iPXE renders `${net0/mac:hexhyp}`.
    #[must_use]
    pub fn to_hexhyp(&self) -> String {
        self.join('-')
    }

    fn join(&self, separator: char) -> String {
        let mut out = String::with_capacity(17);
        for (i, octet) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(separator);
            }
            out.push_str(&format!("{octet:02x}"));
        }
        out
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.join(':'))
    }
}

impl FromStr for MacAddress {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for MacAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
