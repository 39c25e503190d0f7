//! Error types for model validation.

use metalcast_id::IdError;
use thiserror::Error;

/// Errors raised while validating wire records.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// A role name outside the known enumeration.
    #[error("unknown role: {0}")]
    UnknownRole(String),

    /// A rolling strategy outside the known enumeration.
    #[error("unknown rolling strategy: {0}")]
    UnknownStrategy(String),

    /// A required attribute is missing from a raw query.
    #[error("missing required attribute '{0}'")]
    MissingAttribute(&'static str),

    /// An attribute is present but cannot be parsed.
    #[error("invalid attribute '{field}': {source}")]
    InvalidAttribute {
        field: &'static str,
        #[source]
        source: IdError,
    },

    /// A discovery report is structurally invalid.
    #[error("invalid discovery report: {0}")]
    InvalidReport(String),
}

impl ModelError {
    /// Returns true for errors caused by looking up an unknown enumeration value.
    pub fn is_lookup(&self) -> bool {
        matches!(self, ModelError::UnknownRole(_) | ModelError::UnknownStrategy(_))
    }
}
