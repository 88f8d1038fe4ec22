//! Execution specs and resource envelopes.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Size of one WebAssembly linear-memory page in bytes.
pub const WASM_PAGE_BYTES: u64 = 64 * 1024;

/// Resource limits attached to a single invocation.
///
/// The envelope is fully resolved before the runtime selector is consulted;
/// backends never negotiate partial limits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    /// Linear-memory page cap for WebAssembly executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_pages: Option<u32>,
    /// Memory cap in bytes for container executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_memory_bytes: Option<u64>,
    /// Maximum number of nested tool calls the invocation may make.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_calls: Option<u32>,
}

impl ResourceEnvelope {
    /// Returns the effective memory cap in bytes, deriving it from the page
    /// cap when no byte cap is set.
    #[must_use]
    pub fn memory_bytes(&self) -> Option<u64> {
        self.max_memory_bytes
            .or_else(|| self.max_memory_pages.map(|p| u64::from(p) * WASM_PAGE_BYTES))
    }
}

/// Immutable description of one code/tool invocation.
///
/// Constructed fresh per call via [`ExecutionSpec::builder`] and never
/// mutated after submission.
#[derive(Clone, Debug)]
pub struct ExecutionSpec {
    module: Bytes,
    language: Option<String>,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Bytes,
    timeout: Option<Duration>,
    envelope: ResourceEnvelope,
}

impl ExecutionSpec {
    /// Returns a builder for assembling a spec.
    #[must_use]
    pub fn builder() -> ExecutionSpecBuilder {
        ExecutionSpecBuilder::default()
    }

    /// Module bytes (or inline source) to execute. Empty for process-backed
    /// invocations that only carry an argv.
    #[must_use]
    pub fn module(&self) -> &Bytes {
        &self.module
    }

    /// Optional language/runtime hint supplied by the caller.
    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    /// Argument vector. For process-backed invocations `argv[0]` is the
    /// program to run.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Environment variables passed to the sandbox.
    #[must_use]
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Bytes wired to the sandbox's standard input.
    #[must_use]
    pub fn stdin(&self) -> &Bytes {
        &self.stdin
    }

    /// Per-call timeout, if the caller specified one.
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resource envelope for this invocation.
    #[must_use]
    pub const fn envelope(&self) -> &ResourceEnvelope {
        &self.envelope
    }

    /// Returns `true` when the spec carries module bytes.
    #[must_use]
    pub fn has_module(&self) -> bool {
        !self.module.is_empty()
    }

    /// Returns a spec with `default` as its timeout when the caller supplied
    /// none. Resolving budgets happens before the selector is consulted.
    #[must_use]
    pub fn or_timeout(mut self, default: Duration) -> Self {
        if self.timeout.is_none() {
            self.timeout = Some(default);
        }
        self
    }

    /// Returns a spec with `default` as its resource envelope when the
    /// caller's envelope is empty.
    #[must_use]
    pub fn or_envelope(mut self, default: ResourceEnvelope) -> Self {
        if self.envelope == ResourceEnvelope::default() {
            self.envelope = default;
        }
        self
    }
}

/// Builder for [`ExecutionSpec`].
#[derive(Debug, Default)]
pub struct ExecutionSpecBuilder {
    module: Bytes,
    language: Option<String>,
    argv: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Bytes,
    timeout: Option<Duration>,
    envelope: ResourceEnvelope,
}

impl ExecutionSpecBuilder {
    /// Sets the module bytes (or inline source) to execute.
    #[must_use]
    pub fn module(mut self, module: impl Into<Bytes>) -> Self {
        self.module = module.into();
        self
    }

    /// Sets the language/runtime hint.
    #[must_use]
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    /// Sets the argument vector.
    #[must_use]
    pub fn argv<I, S>(mut self, argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv = argv.into_iter().map(Into::into).collect();
        self
    }

    /// Appends one environment variable.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the bytes wired to standard input.
    #[must_use]
    pub fn stdin(mut self, stdin: impl Into<Bytes>) -> Self {
        self.stdin = stdin.into();
        self
    }

    /// Sets the per-call timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the resource envelope.
    #[must_use]
    pub const fn envelope(mut self, envelope: ResourceEnvelope) -> Self {
        self.envelope = envelope;
        self
    }

    /// Finalizes the spec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidSpec`] when the spec carries neither module
    /// bytes nor an argument vector, or when a zero timeout is supplied.
    pub fn build(self) -> crate::Result<ExecutionSpec> {
        if self.module.is_empty() && self.argv.is_empty() {
            return Err(Error::InvalidSpec {
                reason: "spec must carry module bytes or an argument vector".into(),
            });
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(Error::InvalidSpec {
                reason: "timeout must be non-zero".into(),
            });
        }

        Ok(ExecutionSpec {
            module: self.module,
            language: self.language,
            argv: self.argv,
            env: self.env,
            stdin: self.stdin,
            timeout: self.timeout,
            envelope: self.envelope,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_assembles_spec() {
        let spec = ExecutionSpec::builder()
            .argv(["echo", "hello"])
            .env("LANG", "C")
            .stdin(Bytes::from_static(b"input"))
            .timeout(Duration::from_secs(5))
            .build()
            .expect("valid spec");

        assert_eq!(spec.argv(), ["echo", "hello"]);
        assert_eq!(spec.env(), [("LANG".to_owned(), "C".to_owned())]);
        assert_eq!(spec.timeout(), Some(Duration::from_secs(5)));
        assert!(!spec.has_module());
    }

    #[test]
    fn empty_spec_is_rejected() {
        let err = ExecutionSpec::builder().build().expect_err("empty spec");
        assert!(matches!(err, Error::InvalidSpec { .. }));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = ExecutionSpec::builder()
            .argv(["true"])
            .timeout(Duration::ZERO)
            .build()
            .expect_err("zero timeout");
        assert!(matches!(err, Error::InvalidSpec { .. }));
    }

    #[test]
    fn or_timeout_only_fills_missing() {
        let spec = ExecutionSpec::builder()
            .argv(["true"])
            .build()
            .unwrap()
            .or_timeout(Duration::from_secs(30));
        assert_eq!(spec.timeout(), Some(Duration::from_secs(30)));

        let explicit = ExecutionSpec::builder()
            .argv(["true"])
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap()
            .or_timeout(Duration::from_secs(30));
        assert_eq!(explicit.timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn envelope_derives_memory_bytes_from_pages() {
        let envelope = ResourceEnvelope {
            max_memory_pages: Some(16),
            ..ResourceEnvelope::default()
        };
        assert_eq!(envelope.memory_bytes(), Some(16 * WASM_PAGE_BYTES));

        let explicit = ResourceEnvelope {
            max_memory_pages: Some(16),
            max_memory_bytes: Some(1024),
            ..ResourceEnvelope::default()
        };
        assert_eq!(explicit.memory_bytes(), Some(1024));
    }
}
