//! Shared data model for the Crucible sandboxed execution runtime.
//!
//! This crate defines the immutable value types exchanged between the
//! execution engine, the runtime selector, and the sandbox backends:
//! security profiles, execution specs with their resource envelopes,
//! terminal results, and streaming events.

#![warn(missing_docs, clippy::pedantic)]

mod error;
mod event;
mod profile;
mod result;
mod spec;
mod tool_id;

pub use error::{Error, Result};
pub use event::{OutputStream, StreamErrorCause, StreamEvent};
pub use profile::{BackendKind, SecurityProfile};
pub use result::ExecutionResult;
pub use spec::{ExecutionSpec, ExecutionSpecBuilder, ResourceEnvelope, WASM_PAGE_BYTES};
pub use tool_id::ToolId;
