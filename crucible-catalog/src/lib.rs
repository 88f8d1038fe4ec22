//! Tool catalog interface and in-memory implementation.
//!
//! The execution core consumes the catalog through a narrow surface:
//! `lookup`, `list`, and `validate`. Discovery, ranking, and persistence of
//! tool definitions live elsewhere.

#![warn(missing_docs, clippy::pedantic)]

mod catalog;
mod definition;

pub use catalog::{CatalogError, CatalogResult, ToolCatalog, ToolLookup};
pub use definition::{ToolDefinition, ToolSource};
