//! Validated tool identifiers.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Identifier of a tool in the catalog.
///
/// Identifiers are dot-separated lowercase segments (`fs.read`,
/// `text.summarize`); the leading segments form the namespace used by
/// catalog listings.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(String);

impl ToolId {
    /// Creates a validated tool identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidToolId`] when the identifier is empty, has an
    /// empty segment, or contains characters outside `[a-z0-9_-]` and `.`.
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::InvalidToolId {
                id,
                reason: "identifier cannot be empty".into(),
            });
        }

        for segment in id.split('.') {
            if segment.is_empty() {
                return Err(Error::InvalidToolId {
                    id: id.clone(),
                    reason: "identifier segments cannot be empty".into(),
                });
            }
            if !segment
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
            {
                return Err(Error::InvalidToolId {
                    id: id.clone(),
                    reason: format!("segment `{segment}` contains invalid characters"),
                });
            }
        }

        Ok(Self(id))
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespace portion of the identifier, if any.
    ///
    /// For `fs.read` the namespace is `fs`; a single-segment identifier has
    /// no namespace.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.0.rsplit_once('.').map(|(ns, _)| ns)
    }

    /// Returns `true` when the identifier falls under the given namespace.
    #[must_use]
    pub fn in_namespace(&self, namespace: &str) -> bool {
        match self.namespace() {
            Some(ns) => ns == namespace || ns.starts_with(&format!("{namespace}.")),
            None => namespace.is_empty(),
        }
    }
}

impl Display for ToolId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ToolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ToolId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
