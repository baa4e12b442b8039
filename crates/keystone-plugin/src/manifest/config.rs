//! Plugin configuration schema, merging, and validation.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field name → definition.
pub type ConfigSchema = BTreeMap<String, ConfigField>;

/// JSON type a configuration field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigType {
    /// JSON string.
    String,
    /// Any JSON number.
    Number,
    /// Integral JSON number.
    Integer,
    /// JSON boolean.
    Boolean,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl ConfigType {
    /// Returns whether `value` has this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }
}

/// Definition of one configuration field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    /// Expected type; any type is accepted when absent.
    #[serde(default, rename = "type")]
    pub field_type: Option<ConfigType>,
    /// Whether the field must be present after defaults are applied.
    #[serde(default)]
    pub required: bool,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Fields that failed validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigViolations {
    /// Required fields that are absent or null.
    pub missing: Vec<String>,
    /// Fields whose value has the wrong type.
    pub invalid: Vec<String>,
}

/// Overlay the top-level keys of `top` onto `base`.
///
/// A `null` in `top` removes the key. Non-object inputs are treated as empty.
pub fn overlay(base: &Value, top: &Value) -> Value {
    let mut merged: Map<String, Value> = base.as_object().cloned().unwrap_or_default();
    if let Some(top) = top.as_object() {
        for (key, value) in top {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(merged)
}

/// Check `config` against `schema`, collecting every violation.
pub fn validate_config(schema: &ConfigSchema, config: &Value) -> Result<(), ConfigViolations> {
    let empty = Map::new();
    let values = config.as_object().unwrap_or(&empty);
    let mut violations = ConfigViolations::default();

    for (name, field) in schema {
        match values.get(name) {
            None | Some(Value::Null) => {
                if field.required {
                    violations.missing.push(name.clone());
                }
            }
            Some(value) => {
                if let Some(expected) = field.field_type {
                    if !expected.matches(value) {
                        violations.invalid.push(name.clone());
                    }
                }
            }
        }
    }

    if violations.missing.is_empty() && violations.invalid.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ConfigSchema {
        serde_json::from_value(json!({
            "title": {"type": "string", "required": true},
            "limit": {"type": "integer", "required": true},
            "tags": {"type": "array"}
        }))
        .unwrap()
    }

    #[test]
    fn test_overlay_stored_wins() {
        let merged = overlay(&json!({"a": 1, "b": 2}), &json!({"b": 3, "c": 4}));
        assert_eq!(merged, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_overlay_null_removes() {
        let merged = overlay(&json!({"a": 1, "b": 2}), &json!({"a": null}));
        assert_eq!(merged, json!({"b": 2}));
    }

    #[test]
    fn test_validate_lists_every_missing_key() {
        let err = validate_config(&schema(), &json!({"tags": []})).unwrap_err();
        assert_eq!(err.missing, vec!["limit", "title"]);
        assert!(err.invalid.is_empty());
    }

    #[test]
    fn test_validate_types() {
        let err = validate_config(&schema(), &json!({"title": 5, "limit": 1.5})).unwrap_err();
        assert_eq!(err.invalid, vec!["limit", "title"]);
        assert!(validate_config(&schema(), &json!({"title": "x", "limit": 3})).is_ok());
    }
}
