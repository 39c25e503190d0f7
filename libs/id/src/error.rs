//! Error types for identifier parsing.

use thiserror::Error;

/// Errors that can occur when parsing machine identifiers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The identifier string is empty.
    #[error("identifier cannot be empty")]
    Empty,

    /// The MAC address does not have six octets.
    #[error("invalid MAC address '{value}': expected 6 octets, got {octets}")]
    WrongOctetCount { value: String, octets: usize },

    /// The MAC address mixes or uses unsupported separators.
    #[error("invalid MAC address '{0}': octets must be separated by ':' or '-'")]
    InvalidSeparator(String),

    /// An octet is not two hexadecimal digits.
    #[error("invalid MAC address '{value}': bad octet '{octet}'")]
    InvalidOctet { value: String, octet: String },

    /// The UUID portion is invalid.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
