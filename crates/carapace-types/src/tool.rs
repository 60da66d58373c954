//! Tool declaration types (spec.md §3 "Tool Declaration").

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Risk tier of a tool. High-risk tools require confirmation-gate
/// clearance before dispatch (spec.md §4.8 stage 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    High,
}

/// A tool's declared shape: name, description, risk tier, and JSON-schema
/// for its arguments. Handlers are registered separately via the catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeclaration {
    pub name: String,
    pub description: String,
    pub risk_level: RiskLevel,
    /// An object JSON-schema. Must set `additionalProperties: false` and
    /// stay within the catalog's configured depth/property-count bounds;
    /// enforced when the tool is registered, not just at validation time.
    pub arguments_schema: Value,
    /// Optional allow-list of groups permitted to call this tool. `None`
    /// means any group may call it (spec.md §4.8 stage 4).
    #[serde(default)]
    pub allowed_groups: Option<Vec<String>>,
}

/// Tool names must match this pattern (spec.md §3).
pub const TOOL_NAME_PATTERN: &str = r"^[a-z][a-z0-9_]*$";

impl ToolDeclaration {
    /// Validate the declaration's own shape: name pattern and schema shape.
    /// Does not validate a particular arguments payload -- that's stage 3
    /// of the request pipeline.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("tool name must not be empty".to_string());
        }
        let mut chars = self.name.chars();
        let first_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let rest_ok = self
            .name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
        if !first_ok || !rest_ok {
            return Err(format!(
                "tool name '{}' must match {}",
                self.name, TOOL_NAME_PATTERN
            ));
        }
        let obj = self
            .arguments_schema
            .as_object()
            .ok_or_else(|| "arguments_schema must be a JSON object".to_string())?;
        if obj.get("additionalProperties") != Some(&Value::Bool(false)) {
            return Err("arguments_schema must set additionalProperties: false".to_string());
        }
        Ok(())
    }
}
