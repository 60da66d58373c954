//! Tool Catalog (spec.md §4.4).
//!
//! Registers `{declaration, handler}` pairs keyed by `declaration.name`,
//! unique. Writes happen only at startup and plugin shutdown; reads are
//! the stage-2/stage-3 hot path, so lookups never block on a writer that
//! isn't running.

use std::sync::Arc;

use async_trait::async_trait;
use carapace_types::ToolDeclaration;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;

/// Error raised by a tool handler. Reserved pipeline codes raised here are
/// normalized to `HANDLER_ERROR` by stage 6 (spec.md §4.8) before reaching
/// the wire, so handler authors cannot spoof pipeline failures.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{message}")]
    Failed {
        message: String,
        code: Option<carapace_types::ErrorCode>,
        retriable: bool,
    },
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            code: None,
            retriable: false,
        }
    }

    pub fn with_code(message: impl Into<String>, code: carapace_types::ErrorCode) -> Self {
        Self::Failed {
            message: message.into(),
            code: Some(code),
            retriable: code.default_retriable(),
        }
    }
}

/// An asynchronous tool handler: `Request envelope arguments -> result |
/// raises`. Implemented by both built-in intrinsic tools and plugin-backed
/// handlers resolved outside this crate.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value) -> Result<Value, ToolError>;
}

#[async_trait]
impl<F, Fut> ToolHandler for F
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<Value, ToolError>> + Send,
{
    async fn call(&self, arguments: Value) -> Result<Value, ToolError> {
        (self)(arguments).await
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("tool already registered: {0}")]
    AlreadyExists(String),
    #[error("invalid tool declaration: {0}")]
    InvalidDeclaration(String),
}

struct Entry {
    declaration: ToolDeclaration,
    handler: Arc<dyn ToolHandler>,
}

/// `register` fails on a duplicate name; `get`/`has`/`list` are safe to
/// call concurrently from many pipeline invocations.
pub struct ToolCatalog {
    entries: DashMap<String, Entry>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn register(
        &self,
        declaration: ToolDeclaration,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<(), CatalogError> {
        declaration
            .validate()
            .map_err(CatalogError::InvalidDeclaration)?;
        if self.entries.contains_key(&declaration.name) {
            return Err(CatalogError::AlreadyExists(declaration.name));
        }
        self.entries.insert(
            declaration.name.clone(),
            Entry { declaration, handler },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<(ToolDeclaration, Arc<dyn ToolHandler>)> {
        self.entries
            .get(name)
            .map(|e| (e.declaration.clone(), e.handler.clone()))
    }

    pub fn has(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn list(&self) -> Vec<ToolDeclaration> {
        self.entries.iter().map(|e| e.declaration.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ToolCatalog {
    fn default() -> Self {
        Self::new()
    }
}

/// Built-in intrinsic tools registered unconditionally by the server
/// composition root (spec.md §4.14 step 6).
pub mod intrinsic {
    use super::*;
    use carapace_types::RiskLevel;

    /// `echo`: returns `{echoed: <arguments.text>}`. The reference tool
    /// used by the happy-path end-to-end scenario (spec.md §8).
    pub fn echo_declaration() -> ToolDeclaration {
        ToolDeclaration {
            name: "echo".to_string(),
            description: "Echo the `text` argument back unchanged.".to_string(),
            risk_level: RiskLevel::Low,
            arguments_schema: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "text": {"type": "string"}
                },
                "required": ["text"]
            }),
            allowed_groups: None,
        }
    }

    pub async fn echo_handler(arguments: Value) -> Result<Value, ToolError> {
        let text = arguments
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::new("missing 'text' argument"))?;
        Ok(serde_json::json!({"echoed": text}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_get_round_trips() {
        let catalog = ToolCatalog::new();
        let decl = intrinsic::echo_declaration();
        let handler: Arc<dyn ToolHandler> = Arc::new(intrinsic::echo_handler);
        catalog.register(decl.clone(), handler).unwrap();

        assert!(catalog.has("echo"));
        let (got_decl, got_handler) = catalog.get("echo").unwrap();
        assert_eq!(got_decl.name, "echo");
        let result = got_handler
            .call(serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"echoed": "hi"}));
    }

    #[test]
    fn register_duplicate_name_fails() {
        let catalog = ToolCatalog::new();
        let decl = intrinsic::echo_declaration();
        catalog
            .register(decl.clone(), Arc::new(intrinsic::echo_handler))
            .unwrap();
        assert!(matches!(
            catalog.register(decl, Arc::new(intrinsic::echo_handler)),
            Err(CatalogError::AlreadyExists(_))
        ));
    }

    #[test]
    fn list_enumerates_registered_tools() {
        let catalog = ToolCatalog::new();
        assert!(catalog.is_empty());
        catalog
            .register(intrinsic::echo_declaration(), Arc::new(intrinsic::echo_handler))
            .unwrap();
        assert_eq!(catalog.list().len(), 1);
    }
}
