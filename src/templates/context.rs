use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use super::TemplateError;

/// A scalar the template engine knows how to print and test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Bool(bool),
    Number(Number),
    String(String),
}

impl TemplateValue {
    /// `true`, any non-zero number and any non-empty string.
    pub fn is_truthy(&self) -> bool {
        match self {
            TemplateValue::Bool(b) => *b,
            TemplateValue::Number(n) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            TemplateValue::String(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Bool(b) => write!(f, "{}", b),
            TemplateValue::Number(n) => write!(f, "{}", n),
            TemplateValue::String(s) => f.write_str(s),
        }
    }
}

impl From<bool> for TemplateValue {
    fn from(value: bool) -> Self {
        TemplateValue::Bool(value)
    }
}

impl From<i64> for TemplateValue {
    fn from(value: i64) -> Self {
        TemplateValue::Number(Number::from(value))
    }
}

impl From<u32> for TemplateValue {
    fn from(value: u32) -> Self {
        TemplateValue::Number(Number::from(value))
    }
}

impl From<&str> for TemplateValue {
    fn from(value: &str) -> Self {
        TemplateValue::String(value.to_string())
    }
}

impl From<String> for TemplateValue {
    fn from(value: String) -> Self {
        TemplateValue::String(value)
    }
}

/// Per-request variables for one render.
///
/// Keys are kept ordered so debug output and error messages are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TemplateContext {
    values: BTreeMap<String, TemplateValue>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<TemplateValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<TemplateValue>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&TemplateValue> {
        self.values.get(name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Builds a context from a caller-supplied JSON object.
    ///
    /// `null` members are dropped so they behave as absent. Nested arrays and
    /// objects are rejected.
    pub fn from_json(value: &Value) -> Result<Self, TemplateError> {
        let object = value.as_object().ok_or_else(|| {
            TemplateError::InvalidContext(format!(
                "expected a JSON object, found {}",
                json_type_name(value)
            ))
        })?;

        let mut context = Self::new();
        for (name, member) in object {
            let value = match member {
                Value::Null => continue,
                Value::Bool(b) => TemplateValue::Bool(*b),
                Value::Number(n) => TemplateValue::Number(n.clone()),
                Value::String(s) => TemplateValue::String(s.clone()),
                other => {
                    return Err(TemplateError::InvalidContext(format!(
                        "variable `{}` must be a string, number or boolean, found {}",
                        name,
                        json_type_name(other)
                    )))
                }
            };
            context.values.insert(name.clone(), value);
        }
        Ok(context)
    }

    /// Parses message text that is expected to hold a JSON context object.
    pub fn from_json_str(text: &str) -> Result<Self, TemplateError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| TemplateError::InvalidContext(format!("context is not valid JSON: {}", e)))?;
        Self::from_json(&value)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
