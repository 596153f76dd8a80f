//! Typed access to tool call arguments.

use serde_json::{Map, Value};

use crate::error::KestrelError;

/// Wrapper around tool call arguments providing typed extraction.
#[derive(Debug, Clone, Default)]
pub struct ToolArguments {
    value: Map<String, Value>,
}

impl ToolArguments {
    pub fn new(value: Map<String, Value>) -> Self {
        Self { value }
    }

    /// Build from any JSON value; non-objects become empty arguments.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self { value: map },
            _ => Self::default(),
        }
    }

    /// Get the raw argument map.
    pub fn raw(&self) -> &Map<String, Value> {
        &self.value
    }

    /// Get a string argument by key.
    pub fn get_str(&self, key: &str) -> Result<&str, KestrelError> {
        self.value
            .get(key)
            .and_then(|v| v.as_str())
            .ok_or_else(|| KestrelError::InvalidArgument(format!("Missing string argument: {key}")))
    }

    /// Get an optional string argument.
    pub fn get_str_opt(&self, key: &str) -> Option<&str> {
        self.value.get(key).and_then(|v| v.as_str())
    }

    /// Get an optional non-negative integer argument.
    pub fn get_u64_opt(&self, key: &str) -> Option<u64> {
        self.value.get(key).and_then(|v| v.as_u64())
    }

    /// Get a boolean argument, falling back to `default` when absent.
    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.value.get(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    /// Deserialize the entire arguments into a typed struct.
    pub fn deserialize<T: serde::de::DeserializeOwned>(&self) -> Result<T, KestrelError> {
        serde_json::from_value(Value::Object(self.value.clone())).map_err(|e| {
            KestrelError::InvalidArgument(format!("Failed to deserialize arguments: {e}"))
        })
    }
}
