use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Prefix used when exporting context entries to task-body environments.
pub const ENV_PREFIX: &str = "VAR_";

/// The mutable key-value store threaded through one workflow execution.
///
/// Seeded from the workflow's declared variables. Keys are strings; values
/// are JSON for maximum flexibility. Nested invocations (loop bodies,
/// sub-workflows) receive a *copy* and merge results back explicitly on
/// exit, never a shared reference.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    data: HashMap<String, serde_json::Value>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a Context from initial data.
    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    /// Get a value by key.
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    /// Set a value.
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Set a string value.
    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    /// Merge another context into this one (overwrites on conflict).
    pub fn merge(&mut self, other: &Context) {
        for (k, v) in &other.data {
            self.data.insert(k.clone(), v.clone());
        }
    }

    /// Merge the keys of a JSON object into this context.
    ///
    /// Non-object values are ignored.
    pub fn merge_object(&mut self, value: &serde_json::Value) {
        if let Some(obj) = value.as_object() {
            for (k, v) in obj {
                self.data.insert(k.clone(), v.clone());
            }
        }
    }

    /// The string form of a context value, as exported to task bodies and
    /// substituted into query placeholders.
    ///
    /// Strings are taken verbatim; everything else is its JSON rendering.
    pub fn value_string(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Export every entry as a `VAR_<key>` environment variable pair.
    pub fn env_vars(&self) -> Vec<(String, String)> {
        self.data
            .iter()
            .map(|(k, v)| (format!("{}{}", ENV_PREFIX, k), Self::value_string(v)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Get the underlying data map.
    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }
}
