//! Role scheduler.
//!
//! The scheduler is responsible for:
//! - Recording which roles each discovered machine holds
//! - Answering role queries (machines by role, IP lists, unassigned machines)
//! - Promoting unassigned machines into roles under capacity rules
//!
//! Control-plane promotion (etcd member + Kubernetes control plane) is
//! all-or-nothing up to the expected member count. Node promotion waits
//! until the control plane is complete.

mod policy;
mod schedule;
mod worker;

pub use policy::{
    EtcdMemberKubernetesControlPlane, KubernetesNode, PolicySettings, PromotionOutcome,
    SchedulerPolicy, ScheduleStats,
};
pub use schedule::MachineScheduleStore;
pub use worker::SchedulerWorker;

use crate::db::DbError;

/// Result type for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors that can occur during scheduling.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] DbError),

    /// A role name outside the known enumeration.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// The selector is empty or malformed.
    #[error("invalid selector: {0}")]
    InvalidSelector(String),

    /// The selector names a machine that was never discovered.
    #[error("unknown machine: {0}")]
    UnknownMachine(String),
}

impl SchedulerError {
    /// Returns true for caller mistakes, as opposed to storage failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownRole(_)
                | SchedulerError::InvalidSelector(_)
                | SchedulerError::UnknownMachine(_)
        )
    }
}
