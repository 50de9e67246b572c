//! Procedure input/output schemas.
//!
//! The source relies on structural typing for RPC payloads; per the design
//! note in spec.md §9 this is modeled here as a `Schema` trait object
//! rather than a full JSON-Schema engine — proportionate to what the core
//! contract actually needs (validate-and-report, not generate docs).

use crate::error::FieldError;

/// Validates a decoded JSON value, reporting every failing field rather
/// than stopping at the first one (so `ValidationError` carries complete
/// per-field detail, per §7).
pub trait Schema: Send + Sync {
    fn validate(&self, value: &serde_json::Value) -> Result<(), Vec<FieldError>>;
    fn describe(&self) -> serde_json::Value;
}

/// A schema that accepts any well-formed JSON value. Used by procedures
/// and tasks that opt out of validation.
pub struct AnySchema;

impl Schema for AnySchema {
    fn validate(&self, _value: &serde_json::Value) -> Result<(), Vec<FieldError>> {
        Ok(())
    }

    fn describe(&self) -> serde_json::Value {
        serde_json::json!({ "type": "any" })
    }
}

/// A minimal object-shape schema: each named field must be present (unless
/// optional) and pass a per-field predicate. Enough to cover the common
/// "object with required string/number/bool fields" case without pulling
/// in a full JSON-Schema crate.
pub struct ObjectSchema {
    fields: Vec<FieldSpec>,
}

pub struct FieldSpec {
    pub name: &'static str,
    pub optional: bool,
    pub check: Box<dyn Fn(&serde_json::Value) -> bool + Send + Sync>,
    pub expected: &'static str,
}

impl ObjectSchema {
    pub fn new() -> Self {
        ObjectSchema { fields: Vec::new() }
    }

    pub fn field(
        mut self,
        name: &'static str,
        expected: &'static str,
        check: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fields.push(FieldSpec { name, optional: false, check: Box::new(check), expected });
        self
    }

    pub fn optional_field(
        mut self,
        name: &'static str,
        expected: &'static str,
        check: impl Fn(&serde_json::Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.fields.push(FieldSpec { name, optional: true, check: Box::new(check), expected });
        self
    }
}

impl Default for ObjectSchema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema for ObjectSchema {
    fn validate(&self, value: &serde_json::Value) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                errors.push(FieldError { field: "$".into(), message: "expected an object".into() });
                return Err(errors);
            }
        };
        for spec in &self.fields {
            match obj.get(spec.name) {
                Some(v) => {
                    if !(spec.check)(v) {
                        errors.push(FieldError {
                            field: spec.name.to_string(),
                            message: format!("expected {}", spec.expected),
                        });
                    }
                }
                None if !spec.optional => {
                    errors.push(FieldError { field: spec.name.to_string(), message: "required".into() });
                }
                None => {}
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn describe(&self) -> serde_json::Value {
        let props: serde_json::Map<String, serde_json::Value> = self
            .fields
            .iter()
            .map(|f| (f.name.to_string(), serde_json::json!({ "type": f.expected, "optional": f.optional })))
            .collect();
        serde_json::json!({ "type": "object", "properties": props })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_schema_accepts_everything() {
        assert!(AnySchema.validate(&serde_json::json!(null)).is_ok());
    }

    #[test]
    fn object_schema_reports_all_missing_fields() {
        let schema = ObjectSchema::new()
            .field("a", "number", |v| v.is_number())
            .field("b", "string", |v| v.is_string());
        let err = schema.validate(&serde_json::json!({})).unwrap_err();
        assert_eq!(err.len(), 2);
    }

    #[test]
    fn object_schema_optional_field_may_be_absent() {
        let schema = ObjectSchema::new().optional_field("a", "number", |v| v.is_number());
        assert!(schema.validate(&serde_json::json!({})).is_ok());
    }

    #[test]
    fn object_schema_rejects_wrong_type() {
        let schema = ObjectSchema::new().field("a", "number", |v| v.is_number());
        let err = schema.validate(&serde_json::json!({"a": "nope"})).unwrap_err();
        assert_eq!(err[0].field, "a");
    }
}
