//! Best-effort JSON repair and schema validation for LLM output.
//!
//! Models routinely emit almost-JSON: single quotes, trailing commas,
//! unquoted keys, strings cut off mid-stream. [`repair_json`] parses such
//! text permissively and produces a well-formed [`serde_json::Value`];
//! [`JsonRepairService`] layers optional JSON-Schema validation on top with a
//! strict/best-effort split.

mod repair;

pub use repair::repair_json;

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum JsonRepairError {
    #[error("unrepairable JSON: {0}")]
    Unrepairable(String),

    #[error("schema validation failed: {0}")]
    SchemaValidation(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

/// Repairs JSON text and validates it against an optional schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonRepairService;

impl JsonRepairService {
    pub fn new() -> Self {
        Self
    }

    /// Repair a JSON string into a value. Well-formed input parses strictly
    /// first so valid JSON round-trips untouched.
    pub fn repair(&self, json_string: &str) -> Result<Value, JsonRepairError> {
        if let Ok(value) = serde_json::from_str::<Value>(json_string) {
            return Ok(value);
        }
        repair_json(json_string)
    }

    /// Validate a value against a JSON schema.
    pub fn validate(&self, value: &Value, schema: &Value) -> Result<(), JsonRepairError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| JsonRepairError::InvalidSchema(e.to_string()))?;
        let mut errors = validator.iter_errors(value);
        if let Some(first) = errors.next() {
            return Err(JsonRepairError::SchemaValidation(first.to_string()));
        }
        Ok(())
    }

    /// Repair and optionally validate.
    ///
    /// - `Ok(Some(value))`: repaired (and validated, when a schema was given).
    /// - `Ok(None)`: best-effort mode and repair or validation failed; the
    ///   caller should fall back to the raw text.
    /// - `Err(..)`: strict mode and repair or validation failed.
    pub fn repair_and_validate(
        &self,
        json_string: &str,
        schema: Option<&Value>,
        strict: bool,
    ) -> Result<Option<Value>, JsonRepairError> {
        let repaired = match self.repair(json_string) {
            Ok(value) => value,
            Err(e) if strict => return Err(e),
            Err(e) => {
                warn!(error = %e, "JSON repair failed in best-effort mode");
                return Ok(None);
            }
        };

        if let Some(schema) = schema {
            if let Err(e) = self.validate(&repaired, schema) {
                if strict {
                    return Err(e);
                }
                warn!(error = %e, "schema validation failed in best-effort mode");
                return Ok(None);
            }
        }

        Ok(Some(repaired))
    }

    /// Repair + validate a whole structured response body. Returns the
    /// serialized repaired content and the parsed object when validation
    /// succeeded; in best-effort mode failures return the original content
    /// with no parsed object.
    pub fn process_structured_response(
        &self,
        content: &str,
        schema: &Value,
        strict: bool,
    ) -> Result<(String, Option<Value>), JsonRepairError> {
        match self.repair_and_validate(content, Some(schema), strict)? {
            Some(value) => {
                let serialized = serde_json::to_string(&value)
                    .map_err(|e| JsonRepairError::Unrepairable(e.to_string()))?;
                Ok((serialized, Some(value)))
            }
            None => Ok((content.to_string(), None)),
        }
    }
}

/// Serialize a value with object keys sorted at every level. Used to build
/// stable signatures: two payloads that differ only in key order canonicalize
/// to the same string.
pub fn to_canonical_string(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                out.push('{');
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::to_string(key).unwrap_or_default());
                    out.push(':');
                    write(&map[key.as_str()], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => {
                out.push_str(&serde_json::to_string(other).unwrap_or_default());
            }
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_valid_json_round_trips() {
        let service = JsonRepairService::new();
        let value = service.repair(r#"{"a": 1, "b": [true, null]}"#).unwrap();
        assert_eq!(value, json!({"a": 1, "b": [true, null]}));
    }

    #[test]
    fn test_repair_single_quotes_and_trailing_comma() {
        let service = JsonRepairService::new();
        let value = service.repair(r#"{'a': 1, 'b': 'x',}"#).unwrap();
        assert_eq!(value, json!({"a": 1, "b": "x"}));
    }

    #[test]
    fn test_schema_validation_pass() {
        let service = JsonRepairService::new();
        let schema = json!({
            "type": "object",
            "required": ["a", "b"],
            "properties": {"a": {"type": "integer"}, "b": {"type": "string"}}
        });
        let result = service
            .repair_and_validate(r#"{'a': 1, 'b': 'x',}"#, Some(&schema), true)
            .unwrap();
        assert_eq!(result, Some(json!({"a": 1, "b": "x"})));
    }

    #[test]
    fn test_schema_validation_strict_failure() {
        let service = JsonRepairService::new();
        let schema = json!({"type": "object", "required": ["missing"]});
        let err = service
            .repair_and_validate(r#"{"a": 1}"#, Some(&schema), true)
            .unwrap_err();
        assert!(matches!(err, JsonRepairError::SchemaValidation(_)));
    }

    #[test]
    fn test_schema_validation_best_effort_failure_returns_none() {
        let service = JsonRepairService::new();
        let schema = json!({"type": "object", "required": ["missing"]});
        let result = service
            .repair_and_validate(r#"{"a": 1}"#, Some(&schema), false)
            .unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_canonical_string_sorts_keys() {
        let a = json!({"b": 2, "a": {"y": 1, "x": [1, 2]}});
        let b = json!({"a": {"x": [1, 2], "y": 1}, "b": 2});
        assert_eq!(to_canonical_string(&a), to_canonical_string(&b));
    }

    #[test]
    fn test_process_structured_response_best_effort_fallback() {
        let service = JsonRepairService::new();
        let schema = json!({"type": "object", "required": ["zz"]});
        let (content, parsed) = service
            .process_structured_response("{\"a\": 1}", &schema, false)
            .unwrap();
        assert_eq!(content, "{\"a\": 1}");
        assert!(parsed.is_none());
    }
}
