//! The document model shared by every collection.
//!
//! Documents are opaque: a stable string id plus an arbitrary JSON field
//! map.  The collection a document belongs to is carried by whoever holds it
//! (the query, the cache key), not by the document itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::temporal::{Temporal, TemporalError};

/// A single record read from or written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    /// Create a document from an id and a JSON object.
    ///
    /// Non-object values produce a document with no fields.  An `id` key
    /// inside `fields` is dropped; the explicit id wins.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let mut fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        fields.remove("id");
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Raw field lookup.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// String field lookup; empty strings count as absent.
    pub fn str_field(&self, field: &str) -> Option<&str> {
        match self.fields.get(field) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether the field exists and is neither `null` nor an empty string.
    pub fn has_value(&self, field: &str) -> bool {
        match self.fields.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(_) => true,
        }
    }

    /// Read a date-like field and normalize it to UTC.
    ///
    /// Returns `None` when the field is absent or `null`, and an error when
    /// it is present but not a recognizable temporal value.
    pub fn timestamp(&self, field: &str) -> Option<Result<DateTime<Utc>, TemporalError>> {
        match self.fields.get(field) {
            None | Some(Value::Null) => None,
            Some(value) => Some(Temporal::from_value(value).and_then(|t| t.to_utc())),
        }
    }

    /// Convert back into a flat JSON object that includes the `id`.
    pub fn to_value(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("id".to_owned(), Value::String(self.id.clone()));
        Value::Object(map)
    }
}
