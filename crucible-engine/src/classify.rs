//! The single classifier every failure passes through before reaching a
//! caller.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use crucible_backends::BackendError;
use crucible_primitives::{BackendKind, ToolId};
use serde::Serialize;

use crate::error::EngineError;

/// Stable failure taxonomy exposed to callers.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Requested tool is not registered.
    ToolNotFound,
    /// The active profile has no bound backend.
    NoBackends,
    /// A requested backend override could not be satisfied.
    BackendOverride,
    /// Caller input was rejected before execution.
    InputValidation,
    /// Sandbox output was rejected after execution.
    OutputValidation,
    /// The serving backend cannot stream.
    StreamNotSupported,
    /// The sandbox failed while executing.
    ExecutionFailed,
    /// A streaming invocation failed on the producer side.
    StreamFailed,
    /// A chain step failed.
    ChainStepFailed,
    /// The invocation was cancelled by the caller.
    Cancelled,
    /// The invocation exceeded its deadline.
    Timeout,
    /// Unrecognized failure; the catch-all.
    Internal,
}

impl ErrorCode {
    /// Code string exposed on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ToolNotFound => "tool_not_found",
            Self::NoBackends => "no_backends",
            Self::BackendOverride => "backend_override",
            Self::InputValidation => "input_validation",
            Self::OutputValidation => "output_validation",
            Self::StreamNotSupported => "stream_not_supported",
            Self::ExecutionFailed => "execution_failed",
            Self::StreamFailed => "stream_failed",
            Self::ChainStepFailed => "chain_step_failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
        }
    }

    /// Whether automatic retry is safe for this code.
    ///
    /// A pure function of the code: transient sandbox failures retry;
    /// not-found, validation, cancellation, and timeout never do, since
    /// retrying without caller intent risks duplicate side effects.
    #[must_use]
    pub const fn retryable(self) -> bool {
        matches!(self, Self::ExecutionFailed | Self::StreamFailed | Self::Internal)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure handed to callers.
///
/// `step_index` is set if and only if the failure arose while executing a
/// chain step; `retryable` always equals `code.retryable()`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorObject {
    /// Taxonomy member.
    pub code: ErrorCode,
    /// Human-readable message. Never a raw internal error rendering.
    pub message: String,
    /// Tool the failure is attributed to, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<ToolId>,
    /// Backend operation that failed, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    /// Kind of the serving backend, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    /// Zero-based index of the failing chain step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_index: Option<usize>,
    /// Whether automatic retry is safe.
    pub retryable: bool,
    /// Free-form supplementary detail.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl ErrorObject {
    /// Creates an object for the given code, deriving the retryable flag.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            tool: None,
            operation: None,
            backend: None,
            step_index: None,
            retryable: code.retryable(),
            detail: BTreeMap::new(),
        }
    }
}

/// Classifies an engine failure into its caller-facing form.
///
/// A chain-step wrapper wins regardless of the underlying cause: the
/// caller's primary concern inside a chain is *which step* failed. The
/// underlying code is preserved under the `cause` detail key.
#[must_use]
pub fn classify(error: &EngineError) -> ErrorObject {
    match error {
        EngineError::ChainStep { index, source } => {
            let inner = classify(source);
            let mut object = ErrorObject::new(
                ErrorCode::ChainStepFailed,
                format!("chain step {index} failed: {}", inner.message),
            );
            object.step_index = Some(*index);
            object.tool = inner.tool;
            object.operation = inner.operation;
            object.backend = inner.backend;
            object.detail = inner.detail;
            object.detail.insert("cause".into(), inner.code.as_str().into());
            object
        }
        EngineError::ToolNotFound { id } => {
            let mut object = ErrorObject::new(ErrorCode::ToolNotFound, error.to_string());
            object.tool = Some(id.clone());
            object
        }
        EngineError::NoBackends { profile } => {
            let mut object = ErrorObject::new(ErrorCode::NoBackends, error.to_string());
            object.detail.insert("profile".into(), profile.to_string());
            object
        }
        EngineError::InputValidation { .. } => {
            ErrorObject::new(ErrorCode::InputValidation, error.to_string())
        }
        EngineError::OutputValidation { .. } => {
            ErrorObject::new(ErrorCode::OutputValidation, error.to_string())
        }
        EngineError::BackendOverride { requested, bound } => {
            let mut object = ErrorObject::new(ErrorCode::BackendOverride, error.to_string());
            object.detail.insert("requested".into(), requested.to_string());
            if let Some(bound) = bound {
                object.detail.insert("bound".into(), bound.to_string());
            }
            object
        }
        EngineError::Backend {
            operation,
            kind,
            source,
        } => {
            let mut object = classify_backend(source);
            object.operation = Some((*operation).to_owned());
            object.backend = Some(*kind);
            object
        }
        EngineError::Internal { .. } => ErrorObject::new(ErrorCode::Internal, error.to_string()),
    }
}

fn classify_backend(source: &BackendError) -> ErrorObject {
    match source {
        BackendError::Timeout { .. } => ErrorObject::new(ErrorCode::Timeout, source.to_string()),
        BackendError::Cancelled => ErrorObject::new(ErrorCode::Cancelled, source.to_string()),
        BackendError::StreamNotSupported { .. } => {
            ErrorObject::new(ErrorCode::StreamNotSupported, source.to_string())
        }
        BackendError::Stream { .. } => ErrorObject::new(ErrorCode::StreamFailed, source.to_string()),
        BackendError::InvalidModule { .. } => {
            let mut object = ErrorObject::new(ErrorCode::InputValidation, source.to_string());
            object.detail.insert("condition".into(), "invalid_module".into());
            object
        }
        // Startup unavailability is a selector warning; at execution time a
        // vanished dependency is a transient execution failure.
        BackendError::Unavailable { .. }
        | BackendError::Spawn { .. }
        | BackendError::Execution { .. }
        | BackendError::Io { .. } => ErrorObject::new(ErrorCode::ExecutionFailed, source.to_string()),
    }
}
