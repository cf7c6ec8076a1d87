//! Expected shapes for structured completions.
//!
//! The service is asked for JSON matching a [`ResponseSchema`]; the reply is
//! cleaned of incidental formatting, parsed, and checked field by field
//! before anything downstream sees it.

use serde_json::Value;

use crate::error::LlmError;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Text,
    Number { min: Option<f64>, max: Option<f64> },
    Boolean,
    TextList,
    Enum(&'static [&'static str]),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub description: &'static str,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: true,
            description,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind, description: &'static str) -> Self {
        Self {
            name,
            kind,
            required: false,
            description,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSchema {
    pub name: &'static str,
    pub version: &'static str,
    pub fields: Vec<FieldSpec>,
}

impl ResponseSchema {
    /// Human-readable contract appended to the prompt.
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Respond with a single JSON object (no prose, no markdown) named {} with these fields:\n",
            self.name
        );
        for field in &self.fields {
            let kind = match &field.kind {
                FieldKind::Text => "string".to_string(),
                FieldKind::Number { min, max } => match (min, max) {
                    (Some(lo), Some(hi)) => format!("number between {} and {}", lo, hi),
                    (Some(lo), None) => format!("number >= {}", lo),
                    (None, Some(hi)) => format!("number <= {}", hi),
                    (None, None) => "number".to_string(),
                },
                FieldKind::Boolean => "boolean".to_string(),
                FieldKind::TextList => "array of strings".to_string(),
                FieldKind::Enum(values) => format!("one of {}", values.join(" | ")),
            };
            out.push_str(&format!(
                "- \"{}\" ({}{}): {}\n",
                field.name,
                kind,
                if field.required { ", required" } else { ", optional" },
                field.description
            ));
        }
        out
    }

    /// Check a parsed value against the contract.
    pub fn validate(&self, value: &Value) -> Result<(), LlmError> {
        let obj = value
            .as_object()
            .ok_or_else(|| LlmError::schema(self.name, "expected a JSON object"))?;

        for field in &self.fields {
            let Some(v) = obj.get(field.name).filter(|v| !v.is_null()) else {
                if field.required {
                    return Err(LlmError::schema(
                        self.name,
                        format!("missing required field '{}'", field.name),
                    ));
                }
                continue;
            };
            self.check_field(field, v)?;
        }
        Ok(())
    }

    fn check_field(&self, field: &FieldSpec, v: &Value) -> Result<(), LlmError> {
        let fail = |msg: String| {
            Err(LlmError::schema(self.name, format!("field '{}': {}", field.name, msg)))
        };

        match &field.kind {
            FieldKind::Text => {
                if !v.is_string() {
                    return fail(format!("expected string, got {}", v));
                }
            }
            FieldKind::Boolean => {
                if !v.is_boolean() {
                    return fail(format!("expected boolean, got {}", v));
                }
            }
            FieldKind::Number { min, max } => {
                let Some(n) = v.as_f64() else {
                    return fail(format!("expected number, got {}", v));
                };
                if min.is_some_and(|lo| n < lo) || max.is_some_and(|hi| n > hi) {
                    return fail(format!("{} out of range", n));
                }
            }
            FieldKind::TextList => {
                let Some(items) = v.as_array() else {
                    return fail(format!("expected array, got {}", v));
                };
                if items.iter().any(|i| !i.is_string()) {
                    return fail("array must contain only strings".to_string());
                }
            }
            FieldKind::Enum(values) => {
                let Some(s) = v.as_str() else {
                    return fail(format!("expected string, got {}", v));
                };
                if !values.contains(&s) {
                    return fail(format!("'{}' is not one of {}", s, values.join(", ")));
                }
            }
        }
        Ok(())
    }

    /// Clean, parse and validate raw completion text.
    pub fn parse(&self, raw: &str) -> Result<Value, LlmError> {
        let cleaned = clean_json_response(raw);
        if cleaned.is_empty() {
            return Err(LlmError::schema(self.name, "empty completion"));
        }
        let value: Value = serde_json::from_str(cleaned)
            .map_err(|e| LlmError::schema(self.name, format!("invalid JSON: {}", e)))?;
        self.validate(&value)?;
        Ok(value)
    }
}

/// Strip markdown code fences and surrounding whitespace.
pub fn clean_json_response(raw: &str) -> &str {
    let mut content = raw.trim();
    if let Some(rest) = content.strip_prefix("```json") {
        content = rest;
    } else if let Some(rest) = content.strip_prefix("```") {
        content = rest;
    }
    if let Some(rest) = content.strip_suffix("```") {
        content = rest;
    }
    content.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> ResponseSchema {
        ResponseSchema {
            name: "mood_report",
            version: "1",
            fields: vec![
                FieldSpec::required("mood", FieldKind::Enum(&["up", "down"]), "mood"),
                FieldSpec::required(
                    "score",
                    FieldKind::Number {
                        min: Some(0.0),
                        max: Some(1.0),
                    },
                    "score",
                ),
                FieldSpec::optional("tags", FieldKind::TextList, "tags"),
            ],
        }
    }

    #[test]
    fn test_clean_strips_fences() {
        assert_eq!(clean_json_response("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(clean_json_response("```\n{}\n```  "), "{}");
        assert_eq!(clean_json_response("  {\"b\":2} "), "{\"b\":2}");
    }

    #[test]
    fn test_parse_accepts_conforming_output() {
        let v = schema()
            .parse("```json\n{\"mood\":\"up\",\"score\":0.4}\n```")
            .unwrap();
        assert_eq!(v["mood"], "up");
    }

    #[test]
    fn test_validation_failures_are_schema_errors() {
        let s = schema();
        for bad in [
            json!({"mood": "sideways", "score": 0.5}),
            json!({"mood": "up", "score": 1.5}),
            json!({"score": 0.5}),
            json!({"mood": "up", "score": 0.5, "tags": [1, 2]}),
            json!(["not", "an", "object"]),
        ] {
            let err = s.validate(&bad).unwrap_err();
            assert_eq!(err.kind(), "schema_validation_error", "{}", bad);
        }
        assert!(matches!(
            s.parse("I'm sorry, I can't do that"),
            Err(LlmError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn test_describe_lists_enum_domains() {
        let text = schema().describe();
        assert!(text.contains("\"mood\" (one of up | down, required)"));
        assert!(text.contains("\"tags\" (array of strings, optional)"));
    }
}
