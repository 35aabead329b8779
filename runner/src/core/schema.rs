//! Target schemas for structured responses and conformance checks against them.
//!
//! Conformance is checked on the parsed JSON before deserializing into the
//! typed records, so a violation can be attributed to a specific field
//! (e.g. `outcome` outside `{valid, invalid}`) rather than surfacing as an
//! opaque deserialization error.

use std::sync::LazyLock;

use jsonschema::validator_for;
use regex::Regex;
use serde_json::Value;

const PLAN_RESULT_SCHEMA: &str = include_str!("../../schemas/plan_result.schema.json");
const GENERATION_RESULT_SCHEMA: &str = include_str!("../../schemas/generation_result.schema.json");
const VALIDATION_RESULT_SCHEMA: &str = include_str!("../../schemas/validation_result.schema.json");

/// Field label used when a violation cannot be pinned to one property.
pub const ROOT_FIELD: &str = "(root)";

pub static PLAN_RESULT: LazyLock<SchemaDescriptor> =
    LazyLock::new(|| SchemaDescriptor::builtin("plan_result", PLAN_RESULT_SCHEMA));
pub static GENERATION_RESULT: LazyLock<SchemaDescriptor> =
    LazyLock::new(|| SchemaDescriptor::builtin("generation_result", GENERATION_RESULT_SCHEMA));
pub static VALIDATION_RESULT: LazyLock<SchemaDescriptor> =
    LazyLock::new(|| SchemaDescriptor::builtin("validation_result", VALIDATION_RESULT_SCHEMA));

/// Named JSON Schema a structured response must conform to.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDescriptor {
    name: &'static str,
    raw: &'static str,
    schema: Value,
}

/// A conformance failure, attributed to a field where possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub field: String,
    pub detail: String,
}

impl SchemaDescriptor {
    fn builtin(name: &'static str, raw: &'static str) -> Self {
        let schema = serde_json::from_str(raw).expect("builtin schema should be valid JSON");
        Self { name, raw, schema }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schema source text, as handed to backends that accept a schema file.
    pub fn raw(&self) -> &'static str {
        self.raw
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }

    /// Validate `instance` against the schema.
    pub fn check(&self, instance: &Value) -> Result<(), SchemaViolation> {
        let validator = validator_for(&self.schema).map_err(|err| SchemaViolation {
            field: ROOT_FIELD.to_string(),
            detail: format!("invalid schema '{}': {err}", self.name),
        })?;
        if validator.is_valid(instance) {
            return Ok(());
        }
        let messages = validator
            .iter_errors(instance)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        Err(self.attribute(instance, messages))
    }

    /// Find the first property responsible for a failure, in schema order.
    fn attribute(&self, instance: &Value, messages: Vec<String>) -> SchemaViolation {
        let fallback = SchemaViolation {
            field: ROOT_FIELD.to_string(),
            detail: messages.join("; "),
        };
        let Some(object) = instance.as_object() else {
            return fallback;
        };

        let required = self
            .schema
            .get("required")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        for field in required {
            if !object.contains_key(field) {
                return SchemaViolation {
                    field: field.to_string(),
                    detail: "missing required field".to_string(),
                };
            }
        }

        let properties = self.schema.get("properties").and_then(Value::as_object);
        for (field, subschema) in properties.into_iter().flatten() {
            let Some(value) = object.get(field) else {
                continue;
            };
            let Ok(validator) = validator_for(subschema) else {
                continue;
            };
            if !validator.is_valid(value) {
                let detail = validator
                    .iter_errors(value)
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return SchemaViolation {
                    field: field.clone(),
                    detail,
                };
            }
        }

        fallback
    }
}

/// Parse a raw response body as JSON.
///
/// Accepts either a bare JSON document or one wrapped in a fenced code block
/// (```` ```json ... ``` ````), which is how chat models usually answer.
pub fn parse_response_json(raw: &str) -> Result<Value, String> {
    static FENCED_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*\n(.*?)\n?```").expect("fence regex should compile")
    });

    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let Some(body) = FENCED_RE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
    else {
        return serde_json::from_str::<Value>(trimmed).map_err(|err| err.to_string());
    };
    serde_json::from_str(body.trim()).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builtin_schemas_accept_conforming_values() {
        PLAN_RESULT
            .check(&json!({"summary": "s", "plan_body": "1. do", "feedback_notes": ""}))
            .expect("plan");
        GENERATION_RESULT
            .check(&json!({"artifact": "package Bulb;", "comments": ""}))
            .expect("generation");
        VALIDATION_RESULT
            .check(&json!({"outcome": "invalid", "comments": "c", "feedback": "f"}))
            .expect("validation");
    }

    #[test]
    fn out_of_domain_outcome_is_attributed_to_field() {
        let err = VALIDATION_RESULT
            .check(&json!({"outcome": "maybe", "comments": "c", "feedback": "f"}))
            .unwrap_err();
        assert_eq!(err.field, "outcome");
        assert!(err.detail.contains("maybe"), "{}", err.detail);
    }

    #[test]
    fn missing_field_is_attributed() {
        let err = GENERATION_RESULT
            .check(&json!({"comments": "no artifact"}))
            .unwrap_err();
        assert_eq!(err.field, "artifact");
        assert_eq!(err.detail, "missing required field");
    }

    #[test]
    fn non_object_is_a_root_violation() {
        let err = PLAN_RESULT.check(&json!("just text")).unwrap_err();
        assert_eq!(err.field, ROOT_FIELD);
    }

    #[test]
    fn extra_properties_are_root_violations() {
        let err = GENERATION_RESULT
            .check(&json!({"artifact": "a", "comments": "c", "extra": 1}))
            .unwrap_err();
        assert_eq!(err.field, ROOT_FIELD);
    }

    #[test]
    fn parses_bare_and_fenced_json() {
        let bare = parse_response_json(r#"{"a": 1}"#).expect("bare");
        assert_eq!(bare, json!({"a": 1}));

        let fenced = parse_response_json("Here you go:\n```json\n{\"a\": 2}\n```\n").expect("fenced");
        assert_eq!(fenced, json!({"a": 2}));
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_response_json("not json at all").is_err());
    }
}
