//! Error definitions for the execution engine.

use crucible_backends::BackendError;
use crucible_primitives::{BackendKind, SecurityProfile, ToolId};
use thiserror::Error;

/// Result alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the execution engine and chain runner.
///
/// These are internal shapes: every error reaching a caller first passes
/// through [`crate::classify`], which maps it to a stable code string and a
/// retryable flag.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested tool is not registered in the catalog.
    #[error("tool `{id}` not found")]
    ToolNotFound {
        /// Identifier of the missing tool.
        id: ToolId,
    },

    /// The active profile has no bound backend.
    #[error("no backend bound for profile `{profile}`")]
    NoBackends {
        /// Profile the invocation was made against.
        profile: SecurityProfile,
    },

    /// Caller input failed validation (bad spec, exhausted budget, rejected
    /// chain).
    #[error("input validation failed: {reason}")]
    InputValidation {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// Sandbox output failed validation.
    #[error("output validation failed: {reason}")]
    OutputValidation {
        /// Human-readable rejection reason.
        reason: String,
    },

    /// The caller requested a specific backend kind that is not the one
    /// bound for the active profile.
    #[error("requested backend `{requested}` but profile binds {bound:?}")]
    BackendOverride {
        /// Backend kind the caller asked for.
        requested: BackendKind,
        /// Backend kind actually bound, if any.
        bound: Option<BackendKind>,
    },

    /// A backend operation failed.
    #[error("backend operation `{operation}` failed on {kind}")]
    Backend {
        /// Name of the failing operation (`execute`, `execute_stream`, ...).
        operation: &'static str,
        /// Kind of the serving backend.
        kind: BackendKind,
        /// Underlying backend failure.
        #[source]
        source: BackendError,
    },

    /// A chain step failed; wraps the step's underlying error.
    #[error("chain step {index} failed")]
    ChainStep {
        /// Zero-based index of the failing step.
        index: usize,
        /// The step's underlying failure.
        #[source]
        source: Box<EngineError>,
    },

    /// Unexpected internal failure.
    #[error("internal error: {reason}")]
    Internal {
        /// Human-readable description.
        reason: String,
    },
}

impl EngineError {
    /// Creates an input-validation error from the supplied reason.
    #[must_use]
    pub fn input(reason: impl Into<String>) -> Self {
        Self::InputValidation {
            reason: reason.into(),
        }
    }

    /// Creates an internal error from the supplied reason.
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }
}
