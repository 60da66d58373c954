//! Message Limits (spec.md §4.7): pre-parse guards on raw inbound bytes,
//! applied before any JSON-Schema work so an oversized message is rejected
//! cheaply.

use thiserror::Error;

use crate::config::MessageLimits;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LimitViolation {
    #[error("message too large: {actual} bytes, limit {limit}")]
    RawTooLarge { actual: usize, limit: usize },
    #[error("payload too large: {actual} bytes, limit {limit}")]
    PayloadTooLarge { actual: usize, limit: usize },
    #[error("field too large: {actual} bytes, limit {limit}")]
    FieldTooLarge { actual: usize, limit: usize },
    #[error("json nesting too deep: {actual}, limit {limit}")]
    TooDeep { actual: usize, limit: usize },
}

/// Check the raw message size only. Cheapest check, applied first.
pub fn check_raw_size(raw: &[u8], limits: &MessageLimits) -> Result<(), LimitViolation> {
    if raw.len() > limits.max_raw_bytes {
        return Err(LimitViolation::RawTooLarge {
            actual: raw.len(),
            limit: limits.max_raw_bytes,
        });
    }
    Ok(())
}

/// Check the serialized size of the `arguments` object.
pub fn check_payload_size(
    arguments: &serde_json::Value,
    limits: &MessageLimits,
) -> Result<(), LimitViolation> {
    let size = serde_json::to_vec(arguments).map(|v| v.len()).unwrap_or(0);
    if size > limits.max_payload_bytes {
        return Err(LimitViolation::PayloadTooLarge {
            actual: size,
            limit: limits.max_payload_bytes,
        });
    }
    Ok(())
}

/// Check every string-typed leaf in `arguments` against `max_field_bytes`.
pub fn check_field_sizes(
    arguments: &serde_json::Value,
    limits: &MessageLimits,
) -> Result<(), LimitViolation> {
    fn walk(value: &serde_json::Value, limit: usize) -> Result<(), LimitViolation> {
        match value {
            serde_json::Value::String(s) if s.len() > limit => Err(LimitViolation::FieldTooLarge {
                actual: s.len(),
                limit,
            }),
            serde_json::Value::Array(items) => {
                for item in items {
                    walk(item, limit)?;
                }
                Ok(())
            }
            serde_json::Value::Object(map) => {
                for v in map.values() {
                    walk(v, limit)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
    walk(arguments, limits.max_field_bytes)
}

/// Count structural JSON nesting depth on raw bytes, counted *outside*
/// string literals, without fully parsing the document -- so a
/// pathologically deep document is rejected before a full parse is
/// attempted.
pub fn check_json_depth(raw: &[u8], limits: &MessageLimits) -> Result<(), LimitViolation> {
    let mut depth: usize = 0;
    let mut max_depth: usize = 0;
    let mut in_string = false;
    let mut escaped = false;

    for &byte in raw {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' | b'[' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            b'}' | b']' => {
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
        if max_depth > limits.max_json_depth {
            return Err(LimitViolation::TooDeep {
                actual: max_depth,
                limit: limits.max_json_depth,
            });
        }
    }
    Ok(())
}

/// Run every pre-parse guard in increasing cost order, short-circuiting on
/// the first violation.
pub fn check_all(
    raw: &[u8],
    arguments: Option<&serde_json::Value>,
    limits: &MessageLimits,
) -> Result<(), LimitViolation> {
    check_raw_size(raw, limits)?;
    check_json_depth(raw, limits)?;
    if let Some(arguments) = arguments {
        check_payload_size(arguments, limits)?;
        check_field_sizes(arguments, limits)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn limits() -> MessageLimits {
        MessageLimits {
            max_raw_bytes: 100,
            max_payload_bytes: 50,
            max_field_bytes: 10,
            max_json_depth: 4,
        }
    }

    #[test]
    fn raw_size_rejects_oversized_message() {
        let raw = vec![b'x'; 200];
        assert!(matches!(
            check_raw_size(&raw, &limits()),
            Err(LimitViolation::RawTooLarge { .. })
        ));
    }

    #[test]
    fn field_size_rejects_long_string_leaf() {
        let args = json!({"text": "0123456789ABCDEF"});
        assert!(matches!(
            check_field_sizes(&args, &limits()),
            Err(LimitViolation::FieldTooLarge { .. })
        ));
    }

    #[test]
    fn field_size_allows_short_strings() {
        let args = json!({"text": "short"});
        assert!(check_field_sizes(&args, &limits()).is_ok());
    }

    #[test]
    fn json_depth_counts_outside_strings() {
        let raw = br#"{"a": "{{{{{{not actually nested}}}}}}"}"#;
        assert!(check_json_depth(raw, &limits()).is_ok());
    }

    #[test]
    fn json_depth_rejects_deep_nesting() {
        let raw = b"[[[[[[1]]]]]]";
        assert!(matches!(
            check_json_depth(raw, &limits()),
            Err(LimitViolation::TooDeep { .. })
        ));
    }

    #[test]
    fn check_all_short_circuits_on_raw_size() {
        let raw = vec![b'x'; 200];
        assert!(check_all(&raw, None, &limits()).is_err());
    }
}
