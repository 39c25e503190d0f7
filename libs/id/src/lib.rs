//! # metalcast-id
//!
//! Identity types for machines taking part in a bare-metal bootstrap.
//!
//! ## Design Principles
//!
//! - A machine is keyed by the MAC address of its boot interface
//! - Every identifier has a single canonical string form with strict parsing
//! - Identifiers roundtrip through serde (parse → format → parse)
//!
//! ## Formats
//!
//! - [`MacAddress`]: canonical form is lower-case and colon separated
//!   (`52:54:00:a1:b2:c3`). The hyphenated form produced by iPXE's
//!   `${net0/mac:hexhyp}` (`52-54-00-a1-b2-c3`) is accepted on input.
//! - [`MachineUuid`]: SMBIOS system UUID, hyphenated lower-case.

mod error;
mod mac;
mod machine;

pub use error::IdError;
pub use mac::MacAddress;
pub use machine::MachineUuid;
