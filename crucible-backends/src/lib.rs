//! Sandbox execution backends for the Crucible runtime.
//!
//! Three isolation technologies sit behind one contract: an unconfined
//! subprocess backend for trusted development, an ephemeral-container
//! backend driven by a container daemon, and a WebAssembly backend offering
//! the strongest portable isolation with no external dependency. The
//! [`RuntimeSelector`] binds at most one backend per security profile at
//! startup and is read-only afterwards.

#![warn(missing_docs, clippy::pedantic)]

mod container;
mod contract;
mod error;
mod invocation;
mod selector;
mod stream;
mod subprocess;
mod wasm;

pub use container::{ContainerBackend, ContainerConfig};
pub use contract::{Backend, Health};
pub use error::{BackendError, BackendResult};
pub use invocation::{Invocation, InvocationError, InvocationEvent, InvocationState};
pub use selector::{RuntimeSelector, SelectorConfig};
pub use stream::EventSource;
pub use subprocess::SubprocessBackend;
pub use wasm::{WasmBackend, WasmConfig};
