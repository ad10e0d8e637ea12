//! Pluggable payload encoding.
//!
//! Job payloads and results travel through the store as opaque bytes; a
//! `Serializer` is the only thing that knows how to turn them back into values.

use crate::{JobError, Result};
use serde_json::Value;

/// Encode/decode capability for job payloads and results
pub trait Serializer: Send + Sync {
    /// Short name, used in logs and config
    fn name(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON encoding (default)
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(JobError::from)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(JobError::from)
    }
}

/// YAML encoding, handy when payloads are written by hand
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlSerializer;

impl Serializer for YamlSerializer {
    fn name(&self) -> &'static str {
        "yaml"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_yaml::to_string(value)
            .map(String::into_bytes)
            .map_err(JobError::from)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_yaml::from_slice(bytes).map_err(JobError::from)
    }
}

/// Look up a serializer by its configured name
pub fn serializer_by_name(name: &str) -> Option<Box<dyn Serializer>> {
    match name {
        "json" => Some(Box::new(JsonSerializer)),
        "yaml" => Some(Box::new(YamlSerializer)),
        _ => None,
    }
}
