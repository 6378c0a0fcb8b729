//! The result envelope every stage processor returns.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The output of an agent invocation.
///
/// The engine only inspects `success`; every other field is opaque and
/// flows into the run scope for downstream stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Whether the agent considers its work successful.
    pub success: bool,

    /// Agent-specific result fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Default for AgentOutput {
    fn default() -> Self {
        Self::ok()
    }
}

impl AgentOutput {
    /// Creates a successful output with no fields.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            success: true,
            fields: Map::new(),
        }
    }

    /// Creates a successful output with the given fields.
    #[must_use]
    pub fn ok_with(fields: Map<String, Value>) -> Self {
        Self {
            success: true,
            fields,
        }
    }

    /// Creates a successful output holding a single value.
    #[must_use]
    pub fn ok_value(key: impl Into<String>, value: Value) -> Self {
        Self::ok().with_field(key, value)
    }

    /// Creates an unsuccessful output carrying an `error` field.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            fields: Map::new(),
        }
        .with_field("error", Value::String(reason.into()))
    }

    /// Adds a field.
    #[must_use]
    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Returns a field by name.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns the `error` field, if the agent set one.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        self.fields.get("error").and_then(Value::as_str)
    }

    /// Converts to a JSON object including the `success` flag.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("success".to_string(), Value::Bool(self.success));
        Value::Object(map)
    }
}
