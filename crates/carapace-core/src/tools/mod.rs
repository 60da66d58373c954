//! Tool Catalog (spec.md §4.4) and the built-in intrinsic tools.

pub mod registry;

pub use registry::{CatalogError, ToolCatalog, ToolError, ToolHandler};
