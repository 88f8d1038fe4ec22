//! Execution engine for the Crucible runtime.
//!
//! Sits between callers and the sandbox backends: applies per-call budgets,
//! resolves catalog tools to execution specs, sequences multi-step chains,
//! and classifies every failure into a stable, retryable-tagged error
//! taxonomy before it reaches the caller.

#![warn(missing_docs, clippy::pedantic)]

mod chain;
mod classify;
mod engine;
mod error;
mod limits;

pub use chain::{
    ChainGuards, ChainProgress, ChainRun, ChainStep, CompiledChain, ProgressCallback, StepOutcome,
    StepResult, compile_chain,
};
pub use classify::{ErrorCode, ErrorObject, classify};
pub use engine::{EngineConfig, ExecutionEngine};
pub use error::{EngineError, EngineResult};
pub use limits::{FileLimitsStore, LimitsStore, RuntimeLimits};
