//! Sequencing of multi-step tool invocations.
//!
//! A chain is compiled against its guards before anything runs; compilation
//! fails closed. Steps then execute strictly in order, each optionally
//! consuming the previous step's output value, stopping at the first
//! failure with every produced result returned to the caller.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crucible_backends::BackendError;
use crucible_primitives::{BackendKind, ExecutionResult, StreamEvent, ToolId};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classify::{ErrorObject, classify};
use crate::engine::ExecutionEngine;
use crate::error::{EngineError, EngineResult};

/// One step of a chain: a catalog tool plus its call arguments.
#[derive(Clone, Debug)]
pub struct ChainStep {
    /// Caller-chosen step identifier, echoed in the step result.
    pub id: String,
    /// Catalog tool the step invokes.
    pub tool: ToolId,
    /// JSON arguments passed to the tool.
    pub arguments: Value,
    /// Substitute the previous step's output value into the arguments
    /// before invocation.
    pub use_previous: bool,
}

/// Guards applied when a chain is compiled.
#[derive(Clone, Debug)]
pub struct ChainGuards {
    /// Maximum number of steps accepted.
    pub max_steps: usize,
    /// Tools the chain may reference; `None` allows the full catalog.
    pub allowed_tools: Option<BTreeSet<ToolId>>,
}

impl Default for ChainGuards {
    fn default() -> Self {
        Self {
            max_steps: 16,
            allowed_tools: None,
        }
    }
}

impl ChainGuards {
    /// Guards with the given step cap and no allow-list.
    #[must_use]
    pub const fn new(max_steps: usize) -> Self {
        Self {
            max_steps,
            allowed_tools: None,
        }
    }
}

/// A chain validated against its guards, ready to run.
#[derive(Debug)]
pub struct CompiledChain {
    steps: Vec<ChainStep>,
}

impl CompiledChain {
    /// The validated steps, in execution order.
    #[must_use]
    pub fn steps(&self) -> &[ChainStep] {
        &self.steps
    }
}

/// Validates a chain against its guards before anything runs.
///
/// # Errors
///
/// Fails closed with a validation error when the chain exceeds the step
/// cap or references a tool outside the allow-list.
pub fn compile_chain(steps: Vec<ChainStep>, guards: &ChainGuards) -> EngineResult<CompiledChain> {
    if steps.len() > guards.max_steps {
        return Err(EngineError::input(format!(
            "chain of {} steps exceeds the cap of {}",
            steps.len(),
            guards.max_steps
        )));
    }
    if let Some(allowed) = &guards.allowed_tools {
        for step in &steps {
            if !allowed.contains(&step.tool) {
                return Err(EngineError::input(format!(
                    "step `{}` references tool `{}` outside the allow-list",
                    step.id, step.tool
                )));
            }
        }
    }
    Ok(CompiledChain { steps })
}

/// Outcome of one executed step.
#[derive(Clone, Debug)]
pub enum StepOutcome {
    /// The step ran to completion with exit status zero.
    Completed(ExecutionResult),
    /// The step failed; carries its classified error.
    Failed(ErrorObject),
}

/// Record of one executed step, including the arguments actually sent
/// after any previous-result substitution.
#[derive(Clone, Debug)]
pub struct StepResult {
    /// Identifier of the step, as supplied by the caller.
    pub step_id: String,
    /// Zero-based position in the chain.
    pub index: usize,
    /// Backend that served the step, when one was bound.
    pub backend: Option<BackendKind>,
    /// Arguments the tool was invoked with, after substitution.
    pub arguments: Value,
    /// The step's outcome.
    pub outcome: StepOutcome,
}

/// Result of one chain run: every produced step result, in order, plus the
/// terminal error when the run stopped early.
#[derive(Clone, Debug, Default)]
pub struct ChainRun {
    /// Step results up to and including a failing step.
    pub steps: Vec<StepResult>,
    /// Terminal error; `None` when every step completed.
    pub error: Option<ErrorObject>,
}

/// Progress event forwarded to the optional chain callback.
#[derive(Clone, Debug)]
pub struct ChainProgress {
    /// Identifier of the producing step.
    pub step_id: String,
    /// Zero-based position of the producing step.
    pub index: usize,
    /// The underlying stream event.
    pub event: StreamEvent,
}

/// Callback receiving incremental progress while a chain runs.
pub type ProgressCallback = Arc<dyn Fn(ChainProgress) + Send + Sync>;

impl ExecutionEngine {
    /// Runs a compiled chain strictly in order.
    ///
    /// The chain is checked against the engine's step budget before any
    /// step runs; a chain exceeding it is rejected outright, never trimmed.
    ///
    /// When `progress` is supplied and the bound backend streams, each
    /// step's output is forwarded incrementally; backends without streaming
    /// support fall back to the non-progress path, never failing the call
    /// for lack of progress alone.
    pub async fn run_chain(
        &self,
        chain: CompiledChain,
        cancel: CancellationToken,
        progress: Option<ProgressCallback>,
    ) -> ChainRun {
        let budget = self.config().max_chain_steps;
        if chain.steps.len() > budget {
            let error = classify(&EngineError::input(format!(
                "chain of {} steps exceeds the engine budget of {budget}",
                chain.steps.len()
            )));
            return ChainRun {
                steps: Vec::new(),
                error: Some(error),
            };
        }

        let mut run = ChainRun::default();
        let mut previous: Option<Value> = None;

        for (index, step) in chain.steps.into_iter().enumerate() {
            let arguments = resolve_arguments(&step.arguments, previous.as_ref(), step.use_previous);
            debug!(step = %step.id, index, tool = %step.tool, "running chain step");

            let outcome = self
                .run_step(&step, &arguments, cancel.clone(), progress.as_ref(), index)
                .await;
            match outcome {
                Ok(result) => {
                    previous = Some(result.output_value());
                    run.steps.push(StepResult {
                        step_id: step.id,
                        index,
                        backend: self.bound_kind(),
                        arguments,
                        outcome: StepOutcome::Completed(result),
                    });
                }
                Err(source) => {
                    let chained = EngineError::ChainStep {
                        index,
                        source: Box::new(source),
                    };
                    let mut object = classify(&chained);
                    if object.tool.is_none() {
                        object.tool = Some(step.tool.clone());
                    }
                    warn!(step = %step.id, index, code = %object.code, "chain stopped");
                    run.steps.push(StepResult {
                        step_id: step.id,
                        index,
                        backend: self.bound_kind(),
                        arguments,
                        outcome: StepOutcome::Failed(object.clone()),
                    });
                    run.error = Some(object);
                    break;
                }
            }
        }
        run
    }

    async fn run_step(
        &self,
        step: &ChainStep,
        arguments: &Value,
        cancel: CancellationToken,
        progress: Option<&ProgressCallback>,
        index: usize,
    ) -> EngineResult<ExecutionResult> {
        let definition = self
            .catalog()
            .lookup(&step.tool)
            .ok_or_else(|| EngineError::ToolNotFound {
                id: step.tool.clone(),
            })?;
        let backend = self.backend()?;
        if !definition.source().runs_on(backend.kind()) {
            return Err(EngineError::input(format!(
                "tool `{}` cannot run on the bound `{}` backend",
                step.tool,
                backend.kind()
            )));
        }

        let spec = Self::tool_spec(&definition, arguments, Some(backend.kind()))?;
        let result = if let Some(callback) = progress
            && backend.supports_streaming()
        {
            self.stream_step(spec, cancel, callback, &step.id, index, backend.kind())
                .await?
        } else {
            self.execute(spec, cancel).await?
        };

        if result.success() {
            Ok(result)
        } else {
            Err(EngineError::Backend {
                operation: "execute",
                kind: backend.kind(),
                source: BackendError::Execution {
                    reason: format!("tool exited with status {}", result.exit_code()),
                },
            })
        }
    }

    /// Streaming variant of a step: forwards events to the callback while
    /// rebuilding the terminal result from the drained chunks.
    async fn stream_step(
        &self,
        spec: crucible_primitives::ExecutionSpec,
        cancel: CancellationToken,
        callback: &ProgressCallback,
        step_id: &str,
        index: usize,
        kind: BackendKind,
    ) -> EngineResult<ExecutionResult> {
        use crucible_primitives::{OutputStream, StreamErrorCause};

        let started = Instant::now();
        let mut source = self.execute_stream(spec, cancel).await?;
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let emit = callback.as_ref();

        while let Some(event) = source.next_event().await {
            emit(ChainProgress {
                step_id: step_id.to_owned(),
                index,
                event: event.clone(),
            });
            match event {
                StreamEvent::Output { stream, bytes } => match stream {
                    OutputStream::Stdout => stdout.extend_from_slice(&bytes),
                    OutputStream::Stderr => stderr.extend_from_slice(&bytes),
                },
                StreamEvent::Exit { code } => {
                    return Ok(ExecutionResult::new(code, stdout, stderr, started.elapsed()));
                }
                StreamEvent::Error { cause, message } => {
                    let source = match cause {
                        StreamErrorCause::Cancelled => BackendError::Cancelled,
                        StreamErrorCause::Timeout => BackendError::Timeout {
                            elapsed: started.elapsed(),
                        },
                        StreamErrorCause::Execution => BackendError::Stream { reason: message },
                    };
                    return Err(EngineError::Backend {
                        operation: "execute_stream",
                        kind,
                        source,
                    });
                }
            }
        }
        Err(EngineError::internal(
            "event source closed without a terminal event",
        ))
    }
}

/// Substitutes the previous step's output under the reserved `input` key.
fn resolve_arguments(arguments: &Value, previous: Option<&Value>, use_previous: bool) -> Value {
    match (use_previous, previous) {
        (true, Some(prev)) => match arguments.clone() {
            Value::Object(mut map) => {
                map.insert("input".into(), prev.clone());
                Value::Object(map)
            }
            Value::Null => json!({ "input": prev }),
            other => json!({ "input": prev, "arguments": other }),
        },
        _ => arguments.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ErrorCode;
    use crate::engine::EngineConfig;
    use crucible_backends::{RuntimeSelector, SelectorConfig};
    use crucible_catalog::{ToolCatalog, ToolDefinition, ToolLookup, ToolSource};
    use crucible_primitives::SecurityProfile;
    use std::sync::Mutex;

    fn program(id: &str, argv: &[&str]) -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new(id).unwrap(),
            ToolSource::Program {
                argv: argv.iter().map(ToString::to_string).collect(),
            },
        )
        .unwrap()
    }

    async fn engine_with(config: EngineConfig) -> ExecutionEngine {
        let catalog = ToolCatalog::new();
        catalog
            .register(program("gen.hello", &["sh", "-c", "echo hello"]))
            .unwrap();
        catalog.register(program("sys.echo", &["cat"])).unwrap();
        catalog
            .register(program("sys.fail", &["sh", "-c", "exit 3"]))
            .unwrap();
        let catalog: Arc<dyn ToolLookup> = Arc::new(catalog);
        let selector = Arc::new(
            RuntimeSelector::bind(
                SecurityProfile::Dev,
                SelectorConfig::default(),
                Arc::clone(&catalog),
            )
            .await,
        );
        ExecutionEngine::new(selector, catalog, config)
    }

    async fn engine() -> ExecutionEngine {
        engine_with(EngineConfig::default()).await
    }

    fn step(id: &str, tool: &str, use_previous: bool) -> ChainStep {
        ChainStep {
            id: id.to_owned(),
            tool: ToolId::new(tool).unwrap(),
            arguments: json!({}),
            use_previous,
        }
    }

    #[test]
    fn compile_rejects_oversized_chains() {
        let steps = (0..3).map(|i| step(&format!("s{i}"), "sys.echo", false)).collect();
        let err = compile_chain(steps, &ChainGuards::new(2)).expect_err("too many steps");
        assert_eq!(classify(&err).code, ErrorCode::InputValidation);
    }

    #[test]
    fn compile_rejects_tools_outside_the_allow_list() {
        let mut allowed = BTreeSet::new();
        allowed.insert(ToolId::new("sys.echo").unwrap());
        let guards = ChainGuards {
            max_steps: 16,
            allowed_tools: Some(allowed),
        };

        let err = compile_chain(vec![step("s0", "gen.hello", false)], &guards)
            .expect_err("tool not allow-listed");
        assert!(matches!(err, EngineError::InputValidation { .. }));
    }

    #[tokio::test]
    async fn previous_output_is_recorded_in_the_next_arguments() {
        let engine = engine().await;
        let chain = compile_chain(
            vec![
                step("first", "gen.hello", false),
                step("second", "sys.echo", true),
                step("third", "sys.echo", true),
            ],
            &ChainGuards::default(),
        )
        .unwrap();

        let run = engine
            .run_chain(chain, CancellationToken::new(), None)
            .await;
        assert!(run.error.is_none());
        assert_eq!(run.steps.len(), 3);
        assert_eq!(run.steps[1].arguments["input"], json!("hello"));
        match &run.steps[1].outcome {
            StepOutcome::Completed(result) => {
                assert_eq!(result.output_value(), json!({"input": "hello"}));
            }
            StepOutcome::Failed(_) => panic!("step should complete"),
        }
    }

    #[tokio::test]
    async fn failure_at_step_k_returns_exactly_k_results() {
        let engine = engine().await;
        let chain = compile_chain(
            vec![
                step("first", "gen.hello", false),
                step("second", "sys.fail", false),
                step("third", "sys.echo", false),
            ],
            &ChainGuards::default(),
        )
        .unwrap();

        let run = engine
            .run_chain(chain, CancellationToken::new(), None)
            .await;
        assert_eq!(run.steps.len(), 2);
        let error = run.error.expect("terminal error");
        assert_eq!(error.code, ErrorCode::ChainStepFailed);
        assert_eq!(error.step_index, Some(1));
        assert!(matches!(run.steps[1].outcome, StepOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn chain_longer_than_the_engine_budget_is_rejected() {
        let engine = engine_with(EngineConfig {
            max_chain_steps: 1,
            ..EngineConfig::default()
        })
        .await;
        let chain = compile_chain(
            vec![
                step("first", "gen.hello", false),
                step("second", "sys.echo", true),
            ],
            &ChainGuards::default(),
        )
        .unwrap();

        let run = engine
            .run_chain(chain, CancellationToken::new(), None)
            .await;
        assert!(run.steps.is_empty());
        let error = run.error.expect("budget rejection");
        assert_eq!(error.code, ErrorCode::InputValidation);
        assert_eq!(engine.calls_served(), 0);
    }

    #[tokio::test]
    async fn unknown_tool_stops_the_chain() {
        let engine = engine().await;
        let chain = compile_chain(
            vec![step("only", "sys.missing", false)],
            &ChainGuards::default(),
        )
        .unwrap();

        let run = engine
            .run_chain(chain, CancellationToken::new(), None)
            .await;
        let error = run.error.expect("terminal error");
        assert_eq!(error.detail.get("cause").map(String::as_str), Some("tool_not_found"));
        assert_eq!(error.tool, Some(ToolId::new("sys.missing").unwrap()));
    }

    #[tokio::test]
    async fn progress_callback_receives_step_events() {
        let engine = engine().await;
        let chain = compile_chain(
            vec![step("only", "gen.hello", false)],
            &ChainGuards::default(),
        )
        .unwrap();

        let seen: Arc<Mutex<Vec<ChainProgress>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback: ProgressCallback = Arc::new(move |event| {
            sink.lock().expect("progress sink poisoned").push(event);
        });

        let run = engine
            .run_chain(chain, CancellationToken::new(), Some(callback))
            .await;
        assert!(run.error.is_none());

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|p| p.step_id == "only" && p.index == 0));
        assert!(seen.last().is_some_and(|p| p.event.is_terminal()));
    }

    #[tokio::test]
    async fn empty_chain_runs_to_an_empty_result() {
        let engine = engine().await;
        let chain = compile_chain(Vec::new(), &ChainGuards::default()).unwrap();
        let run = engine
            .run_chain(chain, CancellationToken::new(), None)
            .await;
        assert!(run.steps.is_empty());
        assert!(run.error.is_none());
    }
}
