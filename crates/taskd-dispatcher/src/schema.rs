//! Argument validation against a task type's parameter schema.
//!
//! The dispatcher treats validation as a black box behind
//! [`SchemaValidator`]. [`BasicValidator`] implements the JSON Schema subset
//! task types declare: `type`, `enum`, `const`, `properties`, `required`,
//! `additionalProperties`, `items` (list or tuple form), `minItems`,
//! `maxItems`, `minimum`, `maximum`, `minLength`, `maxLength`, `anyOf`,
//! `oneOf`, `allOf`, and `readOnly` under strict validation.

use serde_json::{json, Map, Value};
use taskd_core::{errno, ValidationIssue};

pub trait SchemaValidator: Send + Sync {
    /// Every violation of `schema` by `instance`. Empty means valid.
    fn validate(&self, schema: &Value, instance: &Value, strict: bool) -> Vec<ValidationIssue>;
}

/// Convert a task type's per-position schemas into one array schema.
/// Entries marked `"mandatory": true` count towards `minItems`.
pub fn params_schema(params: &[Value]) -> Value {
    let mandatory = params
        .iter()
        .filter(|p| p.get("mandatory").and_then(Value::as_bool).unwrap_or(false))
        .count();
    json!({
        "type": "array",
        "items": params,
        "minItems": mandatory,
        "maxItems": params.len(),
    })
}

/// Built-in validator for the schema subset above.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicValidator;

impl SchemaValidator for BasicValidator {
    fn validate(&self, schema: &Value, instance: &Value, strict: bool) -> Vec<ValidationIssue> {
        let mut walk = Walk {
            strict,
            path: Vec::new(),
            issues: Vec::new(),
        };
        walk.check(schema, instance);
        walk.issues
    }
}

struct Walk {
    strict: bool,
    path: Vec<Value>,
    issues: Vec<ValidationIssue>,
}

impl Walk {
    fn fail(&mut self, message: String) {
        self.issues.push(ValidationIssue {
            path: self.path.clone(),
            code: errno::EINVAL,
            message,
        });
    }

    fn nested(&mut self, segment: Value, schema: &Value, instance: &Value) {
        self.path.push(segment);
        self.check(schema, instance);
        self.path.pop();
    }

    /// Issues of a sub-check, without recording them.
    fn probe(&self, schema: &Value, instance: &Value) -> Vec<ValidationIssue> {
        let mut walk = Walk {
            strict: self.strict,
            path: self.path.clone(),
            issues: Vec::new(),
        };
        walk.check(schema, instance);
        walk.issues
    }

    fn check(&mut self, schema: &Value, instance: &Value) {
        let Some(schema) = schema.as_object() else {
            // `true`, `{}` and anything unrecognised accept everything.
            if schema == &Value::Bool(false) {
                self.fail("No value is allowed here".to_string());
            }
            return;
        };

        if let Some(expected) = schema.get("type") {
            if !type_matches(expected, instance) {
                self.fail(format!("{} is not of type {}", instance, expected));
                return;
            }
        }

        if let Some(Value::Array(options)) = schema.get("enum") {
            if !options.contains(instance) {
                self.fail(format!("{} is not one of {}", instance, Value::Array(options.clone())));
            }
        }

        if let Some(expected) = schema.get("const") {
            if expected != instance {
                self.fail(format!("{} was expected", expected));
            }
        }

        self.check_combinators(schema, instance);

        match instance {
            Value::Object(map) => self.check_object(schema, map),
            Value::Array(items) => self.check_array(schema, items),
            Value::String(s) => self.check_string(schema, s),
            Value::Number(_) => self.check_number(schema, instance),
            _ => {}
        }
    }

    fn check_combinators(&mut self, schema: &Map<String, Value>, instance: &Value) {
        if let Some(Value::Array(all)) = schema.get("allOf") {
            for sub in all {
                self.check(sub, instance);
            }
        }
        if let Some(Value::Array(any)) = schema.get("anyOf") {
            if !any.iter().any(|sub| self.probe(sub, instance).is_empty()) {
                self.fail(format!("{} is not valid under any of the given schemas", instance));
            }
        }
        if let Some(Value::Array(one)) = schema.get("oneOf") {
            let valid = one
                .iter()
                .filter(|sub| self.probe(sub, instance).is_empty())
                .count();
            if valid != 1 {
                self.fail(format!(
                    "{} is valid under {} of the given schemas, expected exactly one",
                    instance, valid
                ));
            }
        }
    }

    fn check_object(&mut self, schema: &Map<String, Value>, map: &Map<String, Value>) {
        if let Some(Value::Array(required)) = schema.get("required") {
            for key in required.iter().filter_map(Value::as_str) {
                if !map.contains_key(key) {
                    self.fail(format!("'{}' is a required property", key));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (key, value) in map {
            match properties.and_then(|p| p.get(key)) {
                Some(sub) => {
                    if self.strict && sub.get("readOnly").and_then(Value::as_bool) == Some(true) {
                        self.path.push(Value::String(key.clone()));
                        self.fail(format!("'{}' is a read-only field", key));
                        self.path.pop();
                        continue;
                    }
                    self.nested(Value::String(key.clone()), sub, value);
                }
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        self.fail(format!("Additional property '{}' is not allowed", key));
                    }
                    Some(sub @ Value::Object(_)) => {
                        self.nested(Value::String(key.clone()), sub, value);
                    }
                    _ => {}
                },
            }
        }
    }

    fn check_array(&mut self, schema: &Map<String, Value>, items: &[Value]) {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                self.fail(format!("Expected at least {} items, got {}", min, items.len()));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max {
                self.fail(format!("Expected at most {} items, got {}", max, items.len()));
            }
        }

        match schema.get("items") {
            Some(Value::Array(positional)) => {
                for (index, (sub, item)) in positional.iter().zip(items).enumerate() {
                    self.nested(json!(index), sub, item);
                }
            }
            Some(sub @ Value::Object(_)) => {
                for (index, item) in items.iter().enumerate() {
                    self.nested(json!(index), sub, item);
                }
            }
            _ => {}
        }
    }

    fn check_string(&mut self, schema: &Map<String, Value>, s: &str) {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                self.fail(format!("'{}' is too short", s));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                self.fail(format!("'{}' is too long", s));
            }
        }
    }

    fn check_number(&mut self, schema: &Map<String, Value>, instance: &Value) {
        let Some(n) = instance.as_f64() else {
            return;
        };
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if n < min {
                self.fail(format!("{} is less than the minimum of {}", instance, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if n > max {
                self.fail(format!("{} is greater than the maximum of {}", instance, max));
            }
        }
    }
}

fn type_matches(expected: &Value, instance: &Value) -> bool {
    match expected {
        Value::String(name) => is_type(name, instance),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(name, instance)),
        _ => true,
    }
}

fn is_type(name: &str, instance: &Value) -> bool {
    match name {
        "null" => instance.is_null(),
        "boolean" => instance.is_boolean(),
        "string" => instance.is_string(),
        "object" => instance.is_object(),
        "array" => instance.is_array(),
        "number" => instance.is_number(),
        "integer" => {
            instance.is_i64()
                || instance.is_u64()
                || instance.as_f64().map_or(false, |f| f.fract() == 0.0)
        }
        _ => true,
    }
}
