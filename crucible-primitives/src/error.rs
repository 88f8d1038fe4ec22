//! Shared error definitions for the primitive types.

use thiserror::Error;

/// Result alias used throughout the primitive types.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while constructing primitive values.
#[derive(Debug, Error)]
pub enum Error {
    /// Tool identifier failed validation.
    #[error("invalid tool id `{id}`: {reason}")]
    InvalidToolId {
        /// The offending identifier string.
        id: String,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Execution spec failed validation.
    #[error("invalid execution spec: {reason}")]
    InvalidSpec {
        /// Human-readable reason for rejection.
        reason: String,
    },
}
