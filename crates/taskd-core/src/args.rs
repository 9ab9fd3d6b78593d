//! Typed argument envelope passed to task implementations.
//!
//! Arguments travel as a positional list of JSON values. Map keys must not
//! contain `.`; the task store indexes records by dotted paths, so such keys
//! are rejected at the submission boundary instead of being rewritten.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// Environment variables a task runs with.
pub type Environment = BTreeMap<String, String>;

/// Positional task arguments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Args(Vec<Value>);

impl Args {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Argument at `index` as a string, if it is one.
    pub fn str(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Value] {
        &self.0
    }

    /// The arguments as one JSON array, as seen by schema validation.
    pub fn to_value(&self) -> Value {
        Value::Array(self.0.clone())
    }

    pub fn into_inner(self) -> Vec<Value> {
        self.0
    }

    /// Reject map keys containing `.` anywhere in the argument tree.
    pub fn validate_keys(&self) -> Result<(), CoreError> {
        for (index, value) in self.0.iter().enumerate() {
            check_keys(value, &mut vec![index.to_string()])?;
        }
        Ok(())
    }
}

impl From<Vec<Value>> for Args {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Args {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn check_keys(value: &Value, path: &mut Vec<String>) -> Result<(), CoreError> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.contains('.') {
                    return Err(CoreError::InvalidInput(format!(
                        "map key '{}' at {} must not contain '.'",
                        key,
                        path.join("/")
                    )));
                }
                path.push(key.clone());
                check_keys(child, path)?;
                path.pop();
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                path.push(index.to_string());
                check_keys(child, path)?;
                path.pop();
            }
        }
        _ => {}
    }
    Ok(())
}
