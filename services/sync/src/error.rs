//! Sync engine errors.

use std::path::PathBuf;

use metalcast_networking::NetworkError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} answered {status}")]
    Status { url: String, status: u16 },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("no ignition configured for {0}")]
    MissingIgnition(String),
}

impl SyncError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Failures that a later attempt may not hit: transport errors and 5xx.
    /// A 4xx or a local failure repeats identically, so it is not retried.
    pub fn is_transient(&self) -> bool {
        match self {
            SyncError::Http { .. } => true,
            SyncError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
