//! # metalcast-model
//!
//! Records exchanged between the control plane, the sync engine and booting
//! machines.
//!
//! ## Contents
//!
//! - Discovery reports (`POST /discovery`) and their validation
//! - The closed set of schedulable roles
//! - Schedule requests and the scheduled-machine wire shape
//! - Lifecycle queries, rolling strategies and status records
//!
//! Field names follow the HTTP wire format, which uses kebab-case keys for
//! discovery data (`boot-info`, `size-bytes`) and snake_case elsewhere.

mod discovery;
mod error;
mod lifecycle;
mod role;
mod schedule;

pub use discovery::*;
pub use error::ModelError;
pub use lifecycle::*;
pub use role::*;
pub use schedule::*;
