//! The capability contract every sandbox backend implements.

use async_trait::async_trait;
use crucible_catalog::ToolLookup;
use crucible_primitives::{BackendKind, ExecutionResult, ExecutionSpec, ToolId};
use tokio_util::sync::CancellationToken;

use crate::error::{BackendError, BackendResult};
use crate::stream::EventSource;

/// Catalog tools whose source can run on the given backend kind.
pub(crate) fn tools_for_kind(catalog: &dyn ToolLookup, kind: BackendKind) -> Vec<ToolId> {
    catalog
        .list("")
        .into_iter()
        .filter(|id| {
            catalog
                .lookup(id)
                .is_some_and(|definition| definition.source().runs_on(kind))
        })
        .collect()
}

/// Liveness of a backend's external dependency.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Health {
    /// Probe succeeded; the backend can serve invocations.
    Healthy,
    /// Probe failed; the backend is excluded from selection.
    Unhealthy {
        /// Human-readable probe failure.
        reason: String,
    },
    /// The backend has not been probed yet.
    Unknown,
}

impl Health {
    /// Returns `true` when the backend reported healthy.
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Contract satisfied by every sandbox backend.
///
/// `start`/`stop` bracket the backend's external dependency; `stop` must be
/// idempotent and must never block indefinitely. Backends are safe for
/// concurrent invocation: no state leaks between calls, and each invocation
/// carries its own resource envelope.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Kind of sandbox this backend provides.
    fn kind(&self) -> BackendKind;

    /// Configured instance name.
    fn name(&self) -> &str;

    /// Returns `true` when the backend is enabled by configuration.
    fn enabled(&self) -> bool;

    /// Acquires the backend's external dependency (daemon connection,
    /// engine initialization).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Unavailable`] when the dependency cannot be
    /// reached.
    async fn start(&self) -> BackendResult<()>;

    /// Releases the backend's external dependency. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns an error only for unexpected teardown failures; a second
    /// `stop` on an already-stopped backend succeeds.
    async fn stop(&self) -> BackendResult<()>;

    /// Lightweight liveness probe, performed once at startup by the
    /// selector. A backend that later becomes unhealthy surfaces as an
    /// execution-time error instead of being swapped out mid-run.
    async fn health(&self) -> Health;

    /// Lists catalog tools this backend can serve.
    ///
    /// # Errors
    ///
    /// Propagates backend failures encountered while enumerating tools.
    async fn list_tools(&self) -> BackendResult<Vec<ToolId>>;

    /// Runs one invocation to completion.
    ///
    /// The invocation observes both the spec's timeout and the supplied
    /// cancellation token; whichever fires first tears the sandbox down and
    /// determines the terminal classification ([`BackendError::Timeout`]
    /// vs. [`BackendError::Cancelled`]).
    ///
    /// # Errors
    ///
    /// Returns the backend's classified failure; sandbox exits with a
    /// non-zero status are *not* errors and are reported through the
    /// [`ExecutionResult`].
    async fn execute(
        &self,
        spec: &ExecutionSpec,
        cancel: CancellationToken,
    ) -> BackendResult<ExecutionResult>;

    /// Returns `true` when [`Backend::execute_stream`] is implemented.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Runs one invocation, forwarding output incrementally.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::StreamNotSupported`] unless the backend
    /// opts in.
    async fn execute_stream(
        &self,
        spec: &ExecutionSpec,
        cancel: CancellationToken,
    ) -> BackendResult<EventSource> {
        let _ = (spec, cancel);
        Err(BackendError::StreamNotSupported { kind: self.kind() })
    }
}
