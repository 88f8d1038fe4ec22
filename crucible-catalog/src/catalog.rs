//! In-memory tool catalog keyed by identifier.

use std::collections::HashMap;
use std::sync::RwLock;

use crucible_primitives::ToolId;
use thiserror::Error;
use tracing::debug;

use crate::definition::ToolDefinition;

/// Result alias for catalog operations.
pub type CatalogResult<T> = Result<T, CatalogError>;

/// Read-only lookup surface consumed by the execution engine and the chain
/// runner.
pub trait ToolLookup: Send + Sync {
    /// Returns the definition registered under the supplied identifier.
    fn lookup(&self, id: &ToolId) -> Option<ToolDefinition>;

    /// Lists identifiers under the supplied namespace, sorted. An empty
    /// namespace lists the full catalog.
    fn list(&self, namespace: &str) -> Vec<ToolId>;
}

/// Catalog storing tool definitions keyed by identifier.
#[derive(Default)]
pub struct ToolCatalog {
    inner: RwLock<HashMap<ToolId, ToolDefinition>>,
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read().expect("tool catalog poisoned");
        let ids: Vec<_> = inner.keys().map(ToolId::to_string).collect();
        f.debug_struct("ToolCatalog")
            .field("registered", &ids)
            .finish()
    }
}

impl ToolCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::DuplicateTool`] if the identifier is already
    /// present.
    ///
    /// # Panics
    ///
    /// Panics if the internal catalog lock is poisoned.
    pub fn register(&self, definition: ToolDefinition) -> CatalogResult<()> {
        let mut inner = self.inner.write().expect("tool catalog poisoned");
        let id = definition.id().clone();
        if inner.contains_key(&id) {
            return Err(CatalogError::DuplicateTool { id });
        }

        debug!(tool = %id, "tool registered");
        inner.insert(id, definition);
        Ok(())
    }

    /// Returns the definition for `id`, erroring when absent.
    ///
    /// # Errors
    ///
    /// Returns [`CatalogError::UnknownTool`] when no definition is
    /// registered under the identifier.
    pub fn require(&self, id: &ToolId) -> CatalogResult<ToolDefinition> {
        self.lookup(id)
            .ok_or_else(|| CatalogError::UnknownTool { id: id.clone() })
    }
}

impl ToolLookup for ToolCatalog {
    fn lookup(&self, id: &ToolId) -> Option<ToolDefinition> {
        let inner = self.inner.read().ok()?;
        inner.get(id).cloned()
    }

    fn list(&self, namespace: &str) -> Vec<ToolId> {
        let inner = self.inner.read().expect("tool catalog poisoned");
        let mut ids: Vec<ToolId> = inner
            .keys()
            .filter(|id| namespace.is_empty() || id.in_namespace(namespace))
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

/// Errors produced by catalog registration and lookup.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// Definition failed validation.
    #[error("invalid definition for tool `{id}`: {reason}")]
    InvalidDefinition {
        /// Identifier of the offending tool.
        id: ToolId,
        /// Human-readable reason for rejection.
        reason: String,
    },

    /// Identifier collided with an existing registration.
    #[error("tool `{id}` is already registered")]
    DuplicateTool {
        /// Identifier of the offending tool.
        id: ToolId,
    },

    /// Requested tool does not exist.
    #[error("tool `{id}` is not registered")]
    UnknownTool {
        /// Identifier of the missing tool.
        id: ToolId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::ToolSource;

    fn echo_definition(id: &str) -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new(id).unwrap(),
            ToolSource::Program {
                argv: vec!["echo".into()],
            },
        )
        .unwrap()
        .with_description("Echo standard input")
    }

    #[test]
    fn register_and_lookup() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_definition("sys.echo")).unwrap();

        let id = ToolId::new("sys.echo").unwrap();
        let definition = catalog.lookup(&id).expect("registered tool");
        assert_eq!(definition.id(), &id);
        assert_eq!(definition.description(), Some("Echo standard input"));
    }

    #[test]
    fn duplicate_registration_errors() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_definition("sys.echo")).unwrap();

        let err = catalog
            .register(echo_definition("sys.echo"))
            .expect_err("duplicate should fail");
        assert!(matches!(err, CatalogError::DuplicateTool { .. }));
    }

    #[test]
    fn require_unknown_errors() {
        let catalog = ToolCatalog::new();
        let id = ToolId::new("missing").unwrap();
        let err = catalog.require(&id).expect_err("unknown tool");
        assert!(matches!(err, CatalogError::UnknownTool { .. }));
    }

    #[test]
    fn list_filters_by_namespace() {
        let catalog = ToolCatalog::new();
        catalog.register(echo_definition("sys.echo")).unwrap();
        catalog.register(echo_definition("sys.cat")).unwrap();
        catalog.register(echo_definition("net.fetch")).unwrap();

        let sys = catalog.list("sys");
        assert_eq!(sys.len(), 2);
        assert!(sys.iter().all(|id| id.in_namespace("sys")));

        let all = catalog.list("");
        assert_eq!(all.len(), 3);
    }
}
