//! Lifecycle tracker.
//!
//! Records, per machine MAC, the latest install outcome, whether the applied
//! ignition matched the served one, and whether a rolling update is
//! authorized. Also grants time-boxed install authorizations.

mod install_lock;
mod store;

pub use install_lock::{InstallDecision, InstallLock, InstallLockSettings, LockScope};
pub use store::LifecycleStore;

use metalcast_model::ModelError;

use crate::db::DbError;

pub type LifecycleResult<T> = Result<T, LifecycleError>;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    /// The raw query or strategy did not parse.
    #[error(transparent)]
    Invalid(#[from] ModelError),
}

impl LifecycleError {
    /// Returns true for caller mistakes, as opposed to storage failures.
    pub fn is_validation(&self) -> bool {
        matches!(self, LifecycleError::Invalid(_))
    }
}
