//! Minimal JSON-schema validator for stage 3 (spec.md §4.8).
//!
//! Supports exactly what tool `arguments_schema` values use: object shapes
//! with `properties`, `required`, `additionalProperties: false`, and
//! scalar/array/object `type` checks on each property. No external
//! json-schema crate -- the schemas in this system are small and
//! fully under this crate's control.

use serde_json::Value;

/// First failing field path, JSON-pointer-like (`/text`, `/nested/id`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub field_path: String,
    pub reason: String,
}

/// Validate `instance` against `schema`. Returns the first violation found;
/// `additionalProperties: false` rejects any key not named in `properties`,
/// which is what stops `__proto__`/`constructor`/`toString` keys from
/// reaching a handler (spec.md §8 invariant 6).
pub fn validate(schema: &Value, instance: &Value) -> Result<(), SchemaViolation> {
    validate_at("", schema, instance)
}

fn validate_at(path: &str, schema: &Value, instance: &Value) -> Result<(), SchemaViolation> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(expected_type) = schema_obj.get("type").and_then(Value::as_str) {
        if !matches_type(expected_type, instance) {
            return Err(SchemaViolation {
                field_path: path.to_string(),
                reason: format!("expected type '{expected_type}'"),
            });
        }
    }

    if expected_type_is(schema_obj, "object") {
        let Some(instance_obj) = instance.as_object() else {
            return Err(SchemaViolation {
                field_path: path.to_string(),
                reason: "expected an object".to_string(),
            });
        };

        let properties = schema_obj
            .get("properties")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        if schema_obj.get("additionalProperties") == Some(&Value::Bool(false)) {
            for key in instance_obj.keys() {
                if !properties.contains_key(key) {
                    return Err(SchemaViolation {
                        field_path: format!("{path}/{key}"),
                        reason: "additional property not allowed".to_string(),
                    });
                }
            }
        }

        if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
            for req in required {
                if let Some(name) = req.as_str() {
                    if !instance_obj.contains_key(name) {
                        return Err(SchemaViolation {
                            field_path: format!("{path}/{name}"),
                            reason: "required property missing".to_string(),
                        });
                    }
                }
            }
        }

        for (key, sub_schema) in &properties {
            if let Some(sub_instance) = instance_obj.get(key) {
                validate_at(&format!("{path}/{key}"), sub_schema, sub_instance)?;
            }
        }
    }

    if expected_type_is(schema_obj, "array") {
        if let Some(items_schema) = schema_obj.get("items") {
            if let Some(instance_arr) = instance.as_array() {
                for (i, item) in instance_arr.iter().enumerate() {
                    validate_at(&format!("{path}/{i}"), items_schema, item)?;
                }
            }
        }
    }

    Ok(())
}

fn expected_type_is(schema_obj: &serde_json::Map<String, Value>, ty: &str) -> bool {
    schema_obj.get("type").and_then(Value::as_str) == Some(ty)
}

fn matches_type(expected: &str, instance: &Value) -> bool {
    match expected {
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "string" => instance.is_string(),
        "number" => instance.is_number(),
        "integer" => instance.is_i64() || instance.is_u64(),
        "boolean" => instance.is_boolean(),
        "null" => instance.is_null(),
        _ => true,
    }
}
