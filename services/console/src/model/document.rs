//! Generic resource documents.
//!
//! # Purpose
//! A [`Document`] is a JSON object stored in a named collection. Every
//! document carries an `id` and a `metadata` block whose timestamps are owned
//! by the query layer (`store::query`); callers never stamp them directly.
//!
//! # Key invariants
//! - `metadata.deletionTimestamp == null` means the document is live.
//! - `metadata.resourceVersion` strictly increases on every successful write.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use utoipa::ToSchema;

pub const ID_FIELD: &str = "id";
pub const CREATION_TIMESTAMP_PATH: &str = "metadata.creationTimestamp";
pub const RESOURCE_VERSION_PATH: &str = "metadata.resourceVersion";
pub const DELETION_TIMESTAMP_PATH: &str = "metadata.deletionTimestamp";

/// Bookkeeping block shared by all resource documents.
///
/// Timestamps are seconds since the Unix epoch with microsecond resolution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    #[serde(default)]
    pub creation_timestamp: f64,
    #[serde(default)]
    pub resource_version: f64,
    #[serde(default)]
    pub deletion_timestamp: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// A schemaless JSON object persisted in a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Serialize a typed model into a document. Fails unless the model is a JSON object.
    pub fn from_model<T: Serialize>(model: &T) -> serde_json::Result<Self> {
        match serde_json::to_value(model)? {
            Value::Object(map) => Ok(Self(map)),
            other => Err(<serde_json::Error as serde::de::Error>::custom(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn into_model<T: DeserializeOwned>(self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.0))
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: impl Into<String>) {
        self.0.insert(ID_FIELD.to_string(), Value::String(id.into()));
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Resolve a dotted path (`metadata.resourceVersion`) inside the document.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.0.get(first)?;
        for segment in segments {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Set a dotted path, creating intermediate objects. A non-object value
    /// sitting on the path is replaced by an object.
    pub fn set_path(&mut self, path: &str, value: Value) {
        let segments: Vec<&str> = path.split('.').collect();
        let Some((last, parents)) = segments.split_last() else {
            return;
        };
        let mut current = &mut self.0;
        for segment in parents {
            let entry = current
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            let Value::Object(next) = entry else {
                return;
            };
            current = next;
        }
        current.insert(last.to_string(), value);
    }

    pub fn resource_version(&self) -> Option<f64> {
        self.get_path(RESOURCE_VERSION_PATH).and_then(Value::as_f64)
    }

    pub fn creation_timestamp(&self) -> Option<f64> {
        self.get_path(CREATION_TIMESTAMP_PATH).and_then(Value::as_f64)
    }

    pub fn deletion_timestamp(&self) -> Option<f64> {
        self.get_path(DELETION_TIMESTAMP_PATH).and_then(Value::as_f64)
    }

    pub fn is_deleted(&self) -> bool {
        self.deletion_timestamp().is_some()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Document {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Document {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(other),
        }
    }
}
