//! metalcast sync engine
//!
//! Reads the role scheduler over HTTP and renders one boot-config profile per
//! role set and one group per scheduled machine.

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod matchbox;
pub mod render;

pub use engine::ConfigSyncSchedules;
pub use error::{SyncError, SyncResult};
