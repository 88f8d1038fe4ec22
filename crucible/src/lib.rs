//! Sandboxed tool-execution runtime facade.
//!
//! Depend on this crate via `cargo add crucible-rt`. It bundles the internal
//! runtime crates behind feature flags so hosts can pull in only the layers
//! they need.

#![warn(missing_docs, clippy::pedantic)]

/// Re-export shared primitives for convenience.
pub use crucible_primitives as primitives;

/// Tool catalog interface and in-memory implementation (enabled by the
/// `catalog` feature).
#[cfg(feature = "catalog")]
pub use crucible_catalog as catalog;

/// Sandbox backends and the runtime selector (enabled by the `backends`
/// feature).
#[cfg(feature = "backends")]
pub use crucible_backends as backends;

/// Execution engine, chain runner, and error classifier (enabled by the
/// `engine` feature).
#[cfg(feature = "engine")]
pub use crucible_engine as engine;

/// Startup configuration and bootstrap wiring (enabled by the `config`
/// feature).
#[cfg(feature = "config")]
pub use crucible_config as config;
