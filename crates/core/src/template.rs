//! Stream templates: the client-supplied shape of a data stream.
//!
//! A template is a JSON object listing the fields every record carries and,
//! optionally, threshold rules that turn record values into detected events:
//!
//! ```json
//! {
//!   "stream_name": "engine",
//!   "fields": ["rpm", "temp"],
//!   "event_rules": [{ "name": "overheat", "field": "temp", "op": ">", "value": 110 }]
//! }
//! ```

use std::{collections::HashSet, fmt};

use serde::{Deserialize, Serialize};

use crate::{
    error::{CoordinatorError, CoordinatorResult},
    ingest::TOKEN_FIELD,
};

/// Comparison applied by an [`EventRule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Greater,
    #[serde(rename = ">=")]
    GreaterOrEqual,
    #[serde(rename = "<")]
    Less,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = "==")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
}

impl Comparison {
    pub fn holds(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparison::Greater => lhs > rhs,
            Comparison::GreaterOrEqual => lhs >= rhs,
            Comparison::Less => lhs < rhs,
            Comparison::LessOrEqual => lhs <= rhs,
            Comparison::Equal => lhs == rhs,
            Comparison::NotEqual => lhs != rhs,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Comparison::Greater => ">",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Less => "<",
            Comparison::LessOrEqual => "<=",
            Comparison::Equal => "==",
            Comparison::NotEqual => "!=",
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Threshold rule producing an event when a numeric field satisfies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRule {
    pub name: String,
    pub field: String,
    pub op: Comparison,
    pub value: f64,
}

/// Validated, immutable template attached to a stream token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_name: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub event_rules: Vec<EventRule>,
}

impl ParsedTemplate {
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f == name)
    }
}

/// Parses raw template payloads into [`ParsedTemplate`]s.
///
/// Stateless; share freely across threads.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateValidator;

impl TemplateValidator {
    pub fn new() -> Self {
        Self
    }

    /// Parse and validate a raw template.
    ///
    /// Fails with [`CoordinatorError::MalformedTemplate`] when `raw` is not
    /// JSON, and with [`CoordinatorError::SchemaInvalid`] when it is JSON but
    /// does not describe a consistent template.
    pub fn parse(&self, raw: &str) -> CoordinatorResult<ParsedTemplate> {
        let value: serde_json::Value = serde_json::from_str(raw)
            .map_err(|e| CoordinatorError::MalformedTemplate(e.to_string()))?;

        if !value.is_object() {
            return Err(CoordinatorError::SchemaInvalid(
                "template must be a JSON object".to_string(),
            ));
        }

        let template: ParsedTemplate = serde_json::from_value(value)
            .map_err(|e| CoordinatorError::SchemaInvalid(e.to_string()))?;

        validate(&template)?;
        Ok(template)
    }
}

fn validate(template: &ParsedTemplate) -> CoordinatorResult<()> {
    if template.fields.is_empty() {
        return Err(schema_invalid("template must declare at least one field"));
    }

    let mut seen = HashSet::new();
    for field in &template.fields {
        if field.trim().is_empty() {
            return Err(schema_invalid("field names must not be empty"));
        }
        if field == TOKEN_FIELD {
            return Err(schema_invalid(format!(
                "field name '{}' is reserved",
                TOKEN_FIELD
            )));
        }
        if !seen.insert(field.as_str()) {
            return Err(schema_invalid(format!("duplicate field '{}'", field)));
        }
    }

    let mut rule_names = HashSet::new();
    for rule in &template.event_rules {
        if rule.name.trim().is_empty() {
            return Err(schema_invalid("event rule names must not be empty"));
        }
        if !rule_names.insert(rule.name.as_str()) {
            return Err(schema_invalid(format!(
                "duplicate event rule '{}'",
                rule.name
            )));
        }
        if !template.has_field(&rule.field) {
            return Err(schema_invalid(format!(
                "event rule '{}' references undeclared field '{}'",
                rule.name, rule.field
            )));
        }
        if !rule.value.is_finite() {
            return Err(schema_invalid(format!(
                "event rule '{}' threshold must be finite",
                rule.name
            )));
        }
    }

    Ok(())
}

fn schema_invalid(msg: impl Into<String>) -> CoordinatorError {
    CoordinatorError::SchemaInvalid(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_template() {
        let template = TemplateValidator::new()
            .parse(r#"{"fields":["a","b"]}"#)
            .unwrap();
        assert_eq!(template.fields, vec!["a", "b"]);
        assert!(template.event_rules.is_empty());
        assert_eq!(template.stream_name, None);
    }

    #[test]
    fn test_parse_template_with_rules() {
        let raw = r#"{
            "stream_name": "engine",
            "fields": ["rpm", "temp"],
            "event_rules": [{"name": "overheat", "field": "temp", "op": ">=", "value": 110}],
            "storage": {"rollup": "1m"}
        }"#;
        let template = TemplateValidator::new().parse(raw).unwrap();
        assert_eq!(template.stream_name.as_deref(), Some("engine"));
        assert_eq!(template.event_rules.len(), 1);
        assert_eq!(template.event_rules[0].op, Comparison::GreaterOrEqual);
        assert_eq!(template.event_rules[0].value, 110.0);
    }

    #[test]
    fn test_not_json_is_malformed() {
        let result = TemplateValidator::new().parse("{fields: [a]");
        assert!(matches!(result, Err(CoordinatorError::MalformedTemplate(_))));
    }

    #[test]
    fn test_non_object_is_schema_invalid() {
        let result = TemplateValidator::new().parse(r#"["a","b"]"#);
        assert!(matches!(result, Err(CoordinatorError::SchemaInvalid(_))));
    }

    #[test]
    fn test_wrong_field_type_is_schema_invalid() {
        let result = TemplateValidator::new().parse(r#"{"fields":"a"}"#);
        assert!(matches!(result, Err(CoordinatorError::SchemaInvalid(_))));
    }

    #[test]
    fn test_semantic_rules() {
        let validator = TemplateValidator::new();
        for raw in [
            r#"{"fields":[]}"#,
            r#"{"fields":["a","a"]}"#,
            r#"{"fields":[" "]}"#,
            r#"{"fields":["stream_token"]}"#,
            r#"{"fields":["a"],"event_rules":[{"name":"x","field":"b","op":">","value":1}]}"#,
            r#"{"fields":["a"],"event_rules":[{"name":"x","field":"a","op":"~","value":1}]}"#,
            r#"{"fields":["a"],"event_rules":[
                {"name":"x","field":"a","op":">","value":1},
                {"name":"x","field":"a","op":"<","value":0}]}"#,
        ] {
            let result = validator.parse(raw);
            assert!(
                matches!(result, Err(CoordinatorError::SchemaInvalid(_))),
                "expected schema error for {raw}, got {result:?}"
            );
        }
    }

    #[test]
    fn test_comparison_holds() {
        assert!(Comparison::Greater.holds(2.0, 1.0));
        assert!(!Comparison::Greater.holds(1.0, 1.0));
        assert!(Comparison::GreaterOrEqual.holds(1.0, 1.0));
        assert!(Comparison::Less.holds(0.5, 1.0));
        assert!(Comparison::LessOrEqual.holds(1.0, 1.0));
        assert!(Comparison::Equal.holds(3.0, 3.0));
        assert!(Comparison::NotEqual.holds(3.0, 4.0));
    }
}
