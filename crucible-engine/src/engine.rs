//! Budgeted execution over the selected backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crucible_backends::{Backend, EventSource, RuntimeSelector};
use crucible_catalog::{ToolDefinition, ToolLookup, ToolSource};
use crucible_primitives::{
    BackendKind, ExecutionResult, ExecutionSpec, ResourceEnvelope, SecurityProfile, ToolId,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// Per-call budgets applied by the engine.
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// Timeout applied when a spec carries none.
    pub default_timeout: Duration,
    /// Maximum tool calls served over the engine's lifetime.
    pub max_tool_calls: u64,
    /// Maximum steps accepted in one chain.
    pub max_chain_steps: usize,
    /// Resource envelope applied when a spec carries none.
    pub default_envelope: ResourceEnvelope,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_tool_calls: 64,
            max_chain_steps: 16,
            default_envelope: ResourceEnvelope::default(),
        }
    }
}

/// Accepts execution requests, applies budgets, and delegates to the
/// backend bound for the active security profile.
///
/// Budgets are rejected, never clamped: a spec exceeding the tool-call
/// budget fails with a validation error instead of being silently trimmed.
pub struct ExecutionEngine {
    selector: Arc<RuntimeSelector>,
    catalog: Arc<dyn ToolLookup>,
    config: EngineConfig,
    calls: AtomicU64,
}

impl ExecutionEngine {
    /// Creates an engine over a bound selector and catalog.
    #[must_use]
    pub fn new(
        selector: Arc<RuntimeSelector>,
        catalog: Arc<dyn ToolLookup>,
        config: EngineConfig,
    ) -> Self {
        Self {
            selector,
            catalog,
            config,
            calls: AtomicU64::new(0),
        }
    }

    /// The engine's budget configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Profile the engine executes under.
    #[must_use]
    pub fn profile(&self) -> SecurityProfile {
        self.selector.profile()
    }

    pub(crate) fn backend(&self) -> EngineResult<Arc<dyn Backend>> {
        self.selector.backend().ok_or_else(|| EngineError::NoBackends {
            profile: self.selector.profile(),
        })
    }

    /// Kind of the backend bound for the active profile, if any.
    #[must_use]
    pub fn bound_kind(&self) -> Option<BackendKind> {
        self.selector.bound_kind()
    }

    pub(crate) fn catalog(&self) -> &Arc<dyn ToolLookup> {
        &self.catalog
    }

    /// Charges one call against the tool-call budget, rejecting when spent.
    fn charge_call(&self) -> EngineResult<()> {
        let limit = self.config.max_tool_calls;
        let served = self.calls.fetch_add(1, Ordering::SeqCst);
        if served >= limit {
            return Err(EngineError::input(format!(
                "tool-call budget of {limit} calls exhausted"
            )));
        }
        Ok(())
    }

    /// Resolves budgets into the spec before the selector is consulted.
    fn resolve(&self, spec: ExecutionSpec) -> ExecutionSpec {
        spec.or_timeout(self.config.default_timeout)
            .or_envelope(self.config.default_envelope)
    }

    /// Runs one spec to completion on the bound backend.
    ///
    /// # Errors
    ///
    /// Fails with `NoBackends` when the profile is unbound, a validation
    /// error when the tool-call budget is spent, or the classified backend
    /// failure otherwise.
    pub async fn execute(
        &self,
        spec: ExecutionSpec,
        cancel: CancellationToken,
    ) -> EngineResult<ExecutionResult> {
        self.charge_call()?;
        let backend = self.backend()?;
        let spec = self.resolve(spec);

        debug!(backend = %backend.kind(), profile = %self.profile(), "executing spec");
        backend
            .execute(&spec, cancel)
            .await
            .map_err(|source| EngineError::Backend {
                operation: "execute",
                kind: backend.kind(),
                source,
            })
    }

    /// Runs one spec as a streaming invocation on the bound backend.
    ///
    /// # Errors
    ///
    /// As [`ExecutionEngine::execute`]; additionally fails with a
    /// stream-not-supported error when the bound backend cannot stream.
    pub async fn execute_stream(
        &self,
        spec: ExecutionSpec,
        cancel: CancellationToken,
    ) -> EngineResult<EventSource> {
        self.charge_call()?;
        let backend = self.backend()?;
        let spec = self.resolve(spec);

        debug!(backend = %backend.kind(), profile = %self.profile(), "executing spec (streaming)");
        backend
            .execute_stream(&spec, cancel)
            .await
            .map_err(|source| EngineError::Backend {
                operation: "execute_stream",
                kind: backend.kind(),
                source,
            })
    }

    /// Resolves a catalog tool and runs it with the supplied JSON arguments.
    ///
    /// `override_kind` pins the invocation to a specific backend kind; it
    /// fails when the bound backend differs, rather than silently running
    /// elsewhere.
    ///
    /// # Errors
    ///
    /// Fails with `ToolNotFound` for unregistered identifiers, a
    /// backend-override error for an unsatisfiable pin, and otherwise as
    /// [`ExecutionEngine::execute`].
    pub async fn run_tool(
        &self,
        id: &ToolId,
        arguments: Value,
        override_kind: Option<BackendKind>,
        cancel: CancellationToken,
    ) -> EngineResult<ExecutionResult> {
        let definition = self
            .catalog
            .lookup(id)
            .ok_or_else(|| EngineError::ToolNotFound { id: id.clone() })?;
        let bound = self.selector.bound_kind();
        if let Some(requested) = override_kind
            && bound != Some(requested)
        {
            return Err(EngineError::BackendOverride { requested, bound });
        }
        if let Some(kind) = bound
            && !definition.source().runs_on(kind)
        {
            return Err(EngineError::input(format!(
                "tool `{id}` cannot run on the bound `{kind}` backend"
            )));
        }

        let spec = Self::tool_spec(&definition, &arguments, bound)?;
        self.execute(spec, cancel).await
    }

    /// Builds the execution spec for a catalog tool: the tool's source
    /// becomes the module/argv and the call arguments are delivered as JSON
    /// on standard input. The container backend takes no stdin, so there the
    /// arguments travel as a trailing argv argument instead.
    pub(crate) fn tool_spec(
        definition: &ToolDefinition,
        arguments: &Value,
        bound: Option<BackendKind>,
    ) -> EngineResult<ExecutionSpec> {
        let encoded = serde_json::to_string(arguments)
            .map_err(|source| EngineError::input(format!("arguments are not valid JSON: {source}")))?;

        let mut argv = match definition.source() {
            ToolSource::Program { argv } => argv.clone(),
            ToolSource::Script { interpreter, code } => {
                vec![interpreter.clone(), "-c".to_owned(), code.clone()]
            }
            ToolSource::WasmModule { .. } => vec![definition.id().to_string()],
        };

        let mut builder = ExecutionSpec::builder();
        if let ToolSource::WasmModule { module } = definition.source() {
            builder = builder.module(module.clone());
        }
        if bound == Some(BackendKind::Container) {
            argv.push(encoded);
        } else {
            builder = builder.stdin(encoded.into_bytes());
        }

        builder
            .argv(argv)
            .build()
            .map_err(|source| EngineError::input(source.to_string()))
    }

    /// Number of tool calls served so far.
    #[must_use]
    pub fn calls_served(&self) -> u64 {
        self.calls.load(Ordering::SeqCst).min(self.config.max_tool_calls)
    }
}
