//! Template reference grammar for step inputs.
//!
//! Step inputs may reference outputs of earlier steps with the exact shape
//! `{{step_id.outputs.field}}`. References are parsed once into a small AST
//! and evaluated against a lookup table of completed outputs; any other
//! accessor form (singular `output`, bare `result`, missing field) is
//! rejected at parse time rather than by string pattern-matching.

use crate::StepId;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Errors from parsing or evaluating template references.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateError {
    /// The reference does not follow `step_id.outputs.field`.
    #[error("invalid template reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// An opening `{{` with no matching `}}`.
    #[error("unterminated template reference in '{0}'")]
    Unterminated(String),

    /// The referenced step has no recorded outputs (not yet DONE).
    #[error("unresolved reference '{{{{{step_id}.outputs.{field}}}}}': step '{step_id}' has no completed outputs")]
    StepNotCompleted { step_id: StepId, field: String },

    /// The referenced step completed but did not produce the field.
    #[error("unresolved reference '{{{{{step_id}.outputs.{field}}}}}': no output field '{field}'")]
    MissingField { step_id: StepId, field: String },
}

/// A parsed reference to one output field of another step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRef {
    /// Step whose outputs are referenced.
    pub step_id: StepId,

    /// Named output field.
    pub field: String,
}

impl StepRef {
    /// Parse the inside of a `{{...}}` reference.
    ///
    /// Only the three-part shape `step_id.outputs.field` is accepted; the
    /// accessor must be the plural `outputs` and the field must be named.
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let reference = raw.trim();
        let invalid = |reason: &str| TemplateError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = reference.split('.').collect();
        match parts.as_slice() {
            [step, accessor, field] => {
                if step.is_empty() {
                    return Err(invalid("missing step id"));
                }
                if *accessor != "outputs" {
                    return Err(invalid(&format!(
                        "accessor must be 'outputs', got '{accessor}'"
                    )));
                }
                if field.is_empty() {
                    return Err(invalid("missing output field name"));
                }
                Ok(Self {
                    step_id: StepId::new(*step),
                    field: field.to_string(),
                })
            }
            [_, accessor] if *accessor == "outputs" => {
                Err(invalid("missing output field name"))
            }
            _ => Err(invalid("expected 'step_id.outputs.field'")),
        }
    }

    /// Look up the referenced value in a table of completed outputs.
    pub fn evaluate(
        &self,
        outputs: &HashMap<StepId, HashMap<String, Value>>,
    ) -> Result<Value, TemplateError> {
        let step_outputs =
            outputs
                .get(&self.step_id)
                .ok_or_else(|| TemplateError::StepNotCompleted {
                    step_id: self.step_id.clone(),
                    field: self.field.clone(),
                })?;
        step_outputs
            .get(&self.field)
            .cloned()
            .ok_or_else(|| TemplateError::MissingField {
                step_id: self.step_id.clone(),
                field: self.field.clone(),
            })
    }
}

impl fmt::Display for StepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{{{}.outputs.{}}}}}", self.step_id, self.field)
    }
}

/// One piece of an interpolated template string.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Literal text copied through unchanged.
    Text(String),

    /// A reference substituted at evaluation time.
    Ref(StepRef),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq)]
pub enum Template {
    /// No references; the string passes through untouched.
    Literal(String),

    /// The whole value is a single reference; substitution preserves the
    /// referenced value's structure.
    Ref(StepRef),

    /// Text with embedded references; substituted values are stringified.
    Interpolated(Vec<Segment>),
}

impl Template {
    /// Parse a string that may contain `{{step_id.outputs.field}}`
    /// references.
    pub fn parse(input: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = input;
        let mut saw_ref = false;

        while let Some(start) = rest.find(OPEN) {
            let (before, after_open) = rest.split_at(start);
            if !before.is_empty() {
                segments.push(Segment::Text(before.to_string()));
            }
            let body = &after_open[OPEN.len()..];
            let end = body
                .find(CLOSE)
                .ok_or_else(|| TemplateError::Unterminated(input.to_string()))?;
            segments.push(Segment::Ref(StepRef::parse(&body[..end])?));
            saw_ref = true;
            rest = &body[end + CLOSE.len()..];
        }

        if !saw_ref {
            return Ok(Self::Literal(input.to_string()));
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }
        if let [Segment::Ref(r)] = segments.as_slice() {
            return Ok(Self::Ref(r.clone()));
        }
        Ok(Self::Interpolated(segments))
    }

    /// True when the template contains at least one reference.
    pub fn has_refs(&self) -> bool {
        !matches!(self, Self::Literal(_))
    }

    /// Evaluate the template against a table of completed step outputs.
    pub fn evaluate(
        &self,
        outputs: &HashMap<StepId, HashMap<String, Value>>,
    ) -> Result<Value, TemplateError> {
        match self {
            Self::Literal(s) => Ok(Value::String(s.clone())),
            Self::Ref(r) => r.evaluate(outputs),
            Self::Interpolated(segments) => {
                let mut out = String::new();
                for segment in segments {
                    match segment {
                        Segment::Text(t) => out.push_str(t),
                        Segment::Ref(r) => match r.evaluate(outputs)? {
                            Value::String(s) => out.push_str(&s),
                            other => out.push_str(&other.to_string()),
                        },
                    }
                }
                Ok(Value::String(out))
            }
        }
    }
}

/// Resolve every template reference inside a JSON value, recursing into
/// arrays and objects. Non-string scalars pass through unchanged.
pub fn resolve_value(
    value: &Value,
    outputs: &HashMap<StepId, HashMap<String, Value>>,
) -> Result<Value, TemplateError> {
    match value {
        Value::String(s) => {
            let template = Template::parse(s)?;
            if template.has_refs() {
                template.evaluate(outputs)
            } else {
                Ok(value.clone())
            }
        }
        Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, outputs))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| resolve_value(v, outputs).map(|r| (k.clone(), r)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

/// Validate template syntax inside a JSON value without evaluating it.
pub fn validate_value(value: &Value) -> Result<(), TemplateError> {
    match value {
        Value::String(s) => Template::parse(s).map(|_| ()),
        Value::Array(items) => items.iter().try_for_each(validate_value),
        Value::Object(map) => map.values().try_for_each(validate_value),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(step: &str, field: &str, value: Value) -> HashMap<StepId, HashMap<String, Value>> {
        HashMap::from([(
            StepId::new(step),
            HashMap::from([(field.to_string(), value)]),
        )])
    }

    #[test]
    fn test_parse_whole_value_ref() {
        let t = Template::parse("{{fetch.outputs.url}}").unwrap();
        assert_eq!(
            t,
            Template::Ref(StepRef {
                step_id: StepId::new("fetch"),
                field: "url".to_string(),
            })
        );
    }

    #[test]
    fn test_parse_literal() {
        let t = Template::parse("no references here").unwrap();
        assert!(!t.has_refs());
    }

    #[test]
    fn test_singular_output_rejected() {
        let err = Template::parse("{{fetch.output.url}}").unwrap_err();
        assert!(matches!(err, TemplateError::InvalidReference { .. }));
        assert!(err.to_string().contains("outputs"));
    }

    #[test]
    fn test_bare_result_rejected() {
        assert!(Template::parse("{{fetch.result}}").is_err());
    }

    #[test]
    fn test_missing_field_name_rejected() {
        assert!(Template::parse("{{fetch.outputs}}").is_err());
        assert!(Template::parse("{{fetch.outputs.}}").is_err());
    }

    #[test]
    fn test_unterminated_rejected() {
        let err = Template::parse("{{fetch.outputs.url").unwrap_err();
        assert!(matches!(err, TemplateError::Unterminated(_)));
    }

    #[test]
    fn test_whole_value_ref_preserves_structure() {
        let outputs = table("fetch", "payload", json!({"rows": [1, 2, 3]}));
        let t = Template::parse("{{fetch.outputs.payload}}").unwrap();
        assert_eq!(t.evaluate(&outputs).unwrap(), json!({"rows": [1, 2, 3]}));
    }

    #[test]
    fn test_interpolation_stringifies() {
        let outputs = table("fetch", "count", json!(42));
        let t = Template::parse("found {{fetch.outputs.count}} rows").unwrap();
        assert_eq!(t.evaluate(&outputs).unwrap(), json!("found 42 rows"));
    }

    #[test]
    fn test_unresolved_step_errors() {
        let outputs = HashMap::new();
        let t = Template::parse("{{fetch.outputs.url}}").unwrap();
        assert!(matches!(
            t.evaluate(&outputs),
            Err(TemplateError::StepNotCompleted { .. })
        ));
    }

    #[test]
    fn test_missing_output_field_errors() {
        let outputs = table("fetch", "url", json!("https://example.com"));
        let t = Template::parse("{{fetch.outputs.body}}").unwrap();
        assert!(matches!(
            t.evaluate(&outputs),
            Err(TemplateError::MissingField { .. })
        ));
    }

    #[test]
    fn test_resolve_value_recurses() {
        let outputs = table("fetch", "url", json!("https://example.com"));
        let input = json!({
            "target": "{{fetch.outputs.url}}",
            "nested": ["literal", "see {{fetch.outputs.url}}"],
            "count": 3,
        });
        let resolved = resolve_value(&input, &outputs).unwrap();
        assert_eq!(resolved["target"], json!("https://example.com"));
        assert_eq!(resolved["nested"][1], json!("see https://example.com"));
        assert_eq!(resolved["count"], json!(3));
    }
}
