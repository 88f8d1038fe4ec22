//! Error definitions shared by every backend.

use std::time::Duration;

use crucible_primitives::BackendKind;
use thiserror::Error;

/// Result alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Errors surfaced by sandbox backends.
///
/// Backend-level failures are never swallowed; the execution engine wraps
/// them with the originating operation and backend kind before they reach
/// the error classifier.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend's external dependency is missing or unreachable.
    #[error("{kind} backend unavailable: {reason}")]
    Unavailable {
        /// Kind of the affected backend.
        kind: BackendKind,
        /// Human-readable reason.
        reason: String,
    },

    /// Supplied module bytes are empty or failed validation. Raised before
    /// any sandbox resources are allocated.
    #[error("invalid module: {reason}")]
    InvalidModule {
        /// Human-readable validation failure.
        reason: String,
    },

    /// The sandboxed program could not be launched.
    #[error("failed to launch sandboxed program: {reason}")]
    Spawn {
        /// Human-readable launch failure.
        reason: String,
    },

    /// The sandboxed program failed while running (trap, daemon error,
    /// memory-limit violation).
    #[error("execution failed: {reason}")]
    Execution {
        /// Human-readable execution failure.
        reason: String,
    },

    /// The invocation exceeded its deadline and was torn down.
    #[error("execution timed out after {elapsed:?}")]
    Timeout {
        /// Wall time elapsed when the deadline fired.
        elapsed: Duration,
    },

    /// The invocation was cancelled by the caller before completion.
    #[error("execution cancelled")]
    Cancelled,

    /// The backend does not implement streaming invocations.
    #[error("{kind} backend does not support streaming")]
    StreamNotSupported {
        /// Kind of the affected backend.
        kind: BackendKind,
    },

    /// A streaming invocation failed on the producer side.
    #[error("stream failed: {reason}")]
    Stream {
        /// Human-readable stream failure.
        reason: String,
    },

    /// I/O error while talking to the sandbox.
    #[error("sandbox i/o error: {source}")]
    Io {
        /// Underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

impl From<crate::invocation::InvocationError> for BackendError {
    fn from(source: crate::invocation::InvocationError) -> Self {
        Self::Execution {
            reason: source.to_string(),
        }
    }
}

impl BackendError {
    /// Creates an execution error from the supplied reason.
    #[must_use]
    pub fn execution(reason: impl Into<String>) -> Self {
        Self::Execution {
            reason: reason.into(),
        }
    }

    /// Creates an unavailable error for the given backend kind.
    #[must_use]
    pub fn unavailable(kind: BackendKind, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            kind,
            reason: reason.into(),
        }
    }
}
