//! Tool definitions resolvable to executable content.

use bytes::Bytes;
use crucible_primitives::{BackendKind, ToolId};

use crate::catalog::CatalogError;

/// Executable content backing a tool.
#[derive(Clone, Debug)]
pub enum ToolSource {
    /// A host program invoked with a fixed argument vector; call arguments
    /// are delivered on standard input as JSON.
    Program {
        /// Program and arguments, `argv[0]` first.
        argv: Vec<String>,
    },
    /// An interpreted snippet run as `interpreter -c <code>`.
    Script {
        /// Interpreter binary (`python3`, `sh`, ...).
        interpreter: String,
        /// Inline source passed to the interpreter.
        code: String,
    },
    /// A compiled WebAssembly module executed in the wasm sandbox.
    WasmModule {
        /// Raw module bytes.
        module: Bytes,
    },
}

impl ToolSource {
    /// Returns the backend kinds able to serve this source.
    #[must_use]
    pub fn compatible_kinds(&self) -> &'static [BackendKind] {
        match self {
            Self::Program { .. } | Self::Script { .. } => {
                &[BackendKind::Subprocess, BackendKind::Container]
            }
            Self::WasmModule { .. } => &[BackendKind::Wasm],
        }
    }

    /// Returns `true` when the given backend kind can serve this source.
    #[must_use]
    pub fn runs_on(&self, kind: BackendKind) -> bool {
        self.compatible_kinds().contains(&kind)
    }
}

/// A catalog entry: identifier, description, and executable source.
#[derive(Clone, Debug)]
pub struct ToolDefinition {
    id: ToolId,
    description: Option<String>,
    source: ToolSource,
}

impl ToolDefinition {
    /// Creates a definition for the supplied identifier and source.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::InvalidDefinition`] when the source is empty
    /// (no argv, blank interpreter/code, or zero-length module bytes).
    pub fn new(id: ToolId, source: ToolSource) -> Result<Self, CatalogError> {
        match &source {
            ToolSource::Program { argv } if argv.is_empty() => {
                return Err(CatalogError::InvalidDefinition {
                    id,
                    reason: "program source requires a non-empty argv".into(),
                });
            }
            ToolSource::Script { interpreter, code }
                if interpreter.trim().is_empty() || code.trim().is_empty() =>
            {
                return Err(CatalogError::InvalidDefinition {
                    id,
                    reason: "script source requires an interpreter and code".into(),
                });
            }
            ToolSource::WasmModule { module } if module.is_empty() => {
                return Err(CatalogError::InvalidDefinition {
                    id,
                    reason: "wasm source requires non-empty module bytes".into(),
                });
            }
            _ => {}
        }

        Ok(Self {
            id,
            description: None,
            source,
        })
    }

    /// Sets the human-readable description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Returns the tool identifier.
    #[must_use]
    pub fn id(&self) -> &ToolId {
        &self.id
    }

    /// Returns the optional description.
    #[must_use]
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the executable source.
    #[must_use]
    pub const fn source(&self) -> &ToolSource {
        &self.source
    }
}
