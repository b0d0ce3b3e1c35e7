//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID is not in the 36 character hyphenated form.
    #[error("invalid ID format: expected 36 character hyphenated UUID, got {len} characters")]
    InvalidLength { len: usize },

    /// The ID is not a parseable UUID.
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),

    /// The UUID parsed but is not a random (v4) UUID.
    #[error("invalid UUID version: expected 4, got {0}")]
    InvalidVersion(usize),

    /// The UUID does not carry the RFC 4122 variant bits.
    #[error("invalid UUID variant")]
    InvalidVariant,
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// Returns true if the input was a syntactically valid UUID of the wrong kind.
    pub fn is_wrong_kind(&self) -> bool {
        matches!(self, IdError::InvalidVersion(_) | IdError::InvalidVariant)
    }
}
