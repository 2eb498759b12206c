//! Structural schemas for step and workflow payloads.
//!
//! A [`Schema`] describes a JSON object by its fields. It answers two
//! questions: does this value have the right shape (`validate`), and can
//! every value produced under one schema feed a consumer declared with
//! another (`accepts`). Extra fields are always allowed.

use serde_json::{json, Map, Value};

use crate::error::FieldIssue;

/// The type of a single field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array(Box<FieldType>),
    Object(Schema),
    Any,
}

impl FieldType {
    pub fn array(item: FieldType) -> Self {
        Self::Array(Box::new(item))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Any => "any",
        }
    }

    fn to_json_schema(&self) -> Value {
        match self {
            Self::Array(item) => json!({ "type": "array", "items": item.to_json_schema() }),
            Self::Object(schema) => schema.to_json_schema(),
            Self::Any => json!({}),
            other => json!({ "type": other.name() }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    name: String,
    ty: FieldType,
    required: bool,
    description: Option<String>,
}

/// Object schema: an ordered list of named, typed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// An object schema with no fields (accepts any object).
    pub fn object() -> Self {
        Self::default()
    }

    /// Add a required field.
    pub fn field(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.push(name.into(), ty, true)
    }

    /// Add an optional field.
    pub fn optional(self, name: impl Into<String>, ty: FieldType) -> Self {
        self.push(name.into(), ty, false)
    }

    /// Attach a description to an already-declared field.
    pub fn describe(mut self, name: &str, text: impl Into<String>) -> Self {
        if let Some(f) = self.fields.iter_mut().find(|f| f.name == name) {
            f.description = Some(text.into());
        }
        self
    }

    fn push(mut self, name: String, ty: FieldType, required: bool) -> Self {
        self.fields.retain(|f| f.name != name);
        self.fields.push(Field {
            name,
            ty,
            required,
            description: None,
        });
        self
    }

    /// Field names in declaration order.
    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    /// Names of required fields declared as strings.
    pub fn required_string_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.required && f.ty == FieldType::String)
            .map(|f| f.name.as_str())
            .collect()
    }

    fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Check a value against this schema, collecting every offending field.
    pub fn validate(&self, value: &Value) -> Result<(), Vec<FieldIssue>> {
        let mut issues = Vec::new();
        self.validate_at("", value, &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    fn validate_at(&self, prefix: &str, value: &Value, issues: &mut Vec<FieldIssue>) {
        let Some(obj) = value.as_object() else {
            issues.push(FieldIssue::new(
                display_path(prefix),
                format!("expected object, got {}", value_kind(value)),
            ));
            return;
        };

        for field in &self.fields {
            let path = join_path(prefix, &field.name);
            match obj.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    issues.push(FieldIssue::new(path, "missing required field"));
                }
                None | Some(Value::Null) => {}
                Some(v) => check_type(&path, &field.ty, v, issues),
            }
        }
    }

    /// Structural compatibility: can every value valid under `producer`
    /// also satisfy `self`?
    pub fn accepts(&self, producer: &Schema) -> Result<(), Vec<FieldIssue>> {
        let mut issues = Vec::new();
        self.accepts_at("", producer, &mut issues);
        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }

    fn accepts_at(&self, prefix: &str, producer: &Schema, issues: &mut Vec<FieldIssue>) {
        for field in &self.fields {
            let path = join_path(prefix, &field.name);
            match producer.get(&field.name) {
                None if field.required => {
                    issues.push(FieldIssue::new(path, "required but never produced"));
                }
                None => {}
                Some(produced) => {
                    if field.required && !produced.required {
                        issues.push(FieldIssue::new(
                            path.clone(),
                            "required but only optionally produced",
                        ));
                    }
                    compatible(&path, &field.ty, &produced.ty, issues);
                }
            }
        }
    }

    /// Render as JSON Schema, for asking a model for structured output.
    pub fn to_json_schema(&self) -> Value {
        let mut properties = Map::new();
        let mut required = Vec::new();
        for field in &self.fields {
            let mut prop = field.ty.to_json_schema();
            if let (Some(desc), Some(obj)) = (&field.description, prop.as_object_mut()) {
                obj.insert("description".into(), Value::String(desc.clone()));
            }
            properties.insert(field.name.clone(), prop);
            if field.required {
                required.push(Value::String(field.name.clone()));
            }
        }
        json!({
            "type": "object",
            "properties": properties,
            "required": required,
        })
    }
}

fn check_type(path: &str, ty: &FieldType, value: &Value, issues: &mut Vec<FieldIssue>) {
    let ok = match ty {
        FieldType::Any => true,
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Integer => is_integer(value),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Array(item) => match value.as_array() {
            Some(items) => {
                for (i, v) in items.iter().enumerate() {
                    check_type(&format!("{}[{}]", path, i), item, v, issues);
                }
                true
            }
            None => false,
        },
        FieldType::Object(schema) => {
            if value.is_object() {
                schema.validate_at(path, value, issues);
                true
            } else {
                false
            }
        }
    };

    if !ok {
        issues.push(FieldIssue::new(
            path,
            format!("expected {}, got {}", ty.name(), value_kind(value)),
        ));
    }
}

fn compatible(path: &str, consumer: &FieldType, producer: &FieldType, issues: &mut Vec<FieldIssue>) {
    match (consumer, producer) {
        (FieldType::Any, _) | (_, FieldType::Any) => {}
        (FieldType::Number, FieldType::Integer) => {}
        (FieldType::Array(c), FieldType::Array(p)) => compatible(&format!("{}[]", path), c, p, issues),
        (FieldType::Object(c), FieldType::Object(p)) => c.accepts_at(path, p, issues),
        (c, p) if c == p => {}
        (c, p) => issues.push(FieldIssue::new(
            path,
            format!("expected {}, producer declares {}", c.name(), p.name()),
        )),
    }
}

fn is_integer(value: &Value) -> bool {
    value.is_i64()
        || value.is_u64()
        || value.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0)
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

fn display_path(prefix: &str) -> String {
    if prefix.is_empty() {
        "$".to_string()
    } else {
        prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forecast() -> Schema {
        Schema::object()
            .field("date", FieldType::String)
            .field("maxTemp", FieldType::Number)
            .field("precipitationChance", FieldType::Number)
            .field("location", FieldType::String)
    }

    #[test]
    fn test_validate_ok_with_extra_fields() {
        let value = json!({
            "date": "2025-01-01",
            "maxTemp": 21.5,
            "precipitationChance": 30,
            "location": "Lisbon",
            "extra": true
        });
        assert!(forecast().validate(&value).is_ok());
    }

    #[test]
    fn test_validate_reports_every_offending_field() {
        let value = json!({ "date": 5, "maxTemp": "hot", "location": "Oslo" });
        let issues = forecast().validate(&value).unwrap_err();
        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["date", "maxTemp", "precipitationChance"]);
    }

    #[test]
    fn test_validate_non_object() {
        let issues = forecast().validate(&json!("Lisbon")).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "$");
        assert!(issues[0].message.contains("got string"));
    }

    #[test]
    fn test_optional_and_null() {
        let schema = Schema::object()
            .field("city", FieldType::String)
            .optional("country", FieldType::String);
        assert!(schema.validate(&json!({ "city": "Rome", "country": null })).is_ok());
        assert!(schema.validate(&json!({ "city": null })).is_err());
    }

    #[test]
    fn test_nested_paths() {
        let schema = Schema::object().field(
            "days",
            FieldType::array(FieldType::Object(
                Schema::object().field("max", FieldType::Integer),
            )),
        );
        let issues = schema
            .validate(&json!({ "days": [{ "max": 3 }, { "max": 2.5 }] }))
            .unwrap_err();
        assert_eq!(issues[0].path, "days[1].max");
        assert!(schema.validate(&json!({ "days": [{ "max": 3.0 }] })).is_ok());
    }

    #[test]
    fn test_accepts_subset() {
        let consumer = Schema::object().field("location", FieldType::String);
        assert!(consumer.accepts(&forecast()).is_ok());
    }

    #[test]
    fn test_accepts_rejects_missing_and_mismatched() {
        let consumer = Schema::object()
            .field("text", FieldType::String)
            .field("location", FieldType::Number);
        let issues = consumer.accepts(&forecast()).unwrap_err();
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].path, "text");
        assert_eq!(issues[1].path, "location");
    }

    #[test]
    fn test_accepts_integer_as_number_not_reverse() {
        let ints = Schema::object().field("n", FieldType::Integer);
        let nums = Schema::object().field("n", FieldType::Number);
        assert!(nums.accepts(&ints).is_ok());
        assert!(ints.accepts(&nums).is_err());
    }

    #[test]
    fn test_accepts_optional_producer_for_required_consumer() {
        let consumer = Schema::object().field("n", FieldType::Number);
        let producer = Schema::object().optional("n", FieldType::Number);
        assert!(consumer.accepts(&producer).is_err());
    }

    #[test]
    fn test_json_schema_rendering() {
        let schema = Schema::object()
            .field("city", FieldType::String)
            .describe("city", "The city to research")
            .optional("days", FieldType::Integer);
        let rendered = schema.to_json_schema();
        assert_eq!(rendered["properties"]["city"]["type"], "string");
        assert_eq!(
            rendered["properties"]["city"]["description"],
            "The city to research"
        );
        assert_eq!(rendered["required"], json!(["city"]));
    }

    #[test]
    fn test_required_string_fields() {
        let schema = Schema::object()
            .field("city", FieldType::String)
            .optional("note", FieldType::String)
            .field("days", FieldType::Integer);
        assert_eq!(schema.required_string_fields(), vec!["city"]);
        assert_eq!(schema.field_names(), vec!["city", "note", "days"]);
    }
}
