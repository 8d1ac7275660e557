//! Raw record types.
//!
//! A [`RawRecord`] is the persisted shape of a record: a JSON object mapping
//! field names to values, with two reserved fields — `id` and `_status`.
//! The backing object is `Arc`-shared so a record can cross the execution
//! context boundary without a deep copy; mutation goes through copy-on-write,
//! so a shared record can never be altered underneath another holder.

use crate::{error::Result, Error, RecordId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Reserved field holding the record's lifecycle status.
pub const STATUS_FIELD: &str = "_status";

/// Reserved field holding the record's id.
pub const ID_FIELD: &str = "id";

/// Lifecycle status of a record, used for sync bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Created,
    Updated,
    /// Soft-deleted by application convention; still present in storage
    /// until destroyed permanently.
    Deleted,
}

impl RecordStatus {
    /// The string form stored in the `_status` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Created => "created",
            RecordStatus::Updated => "updated",
            RecordStatus::Deleted => "deleted",
        }
    }

    /// Parse from the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(RecordStatus::Created),
            "updated" => Some(RecordStatus::Updated),
            "deleted" => Some(RecordStatus::Deleted),
            _ => None,
        }
    }
}

/// A raw record: field name to JSON value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord {
    fields: Arc<Map<String, Value>>,
}

impl RawRecord {
    /// Create a record from a field map.
    pub fn new(fields: Map<String, Value>) -> Self {
        Self {
            fields: Arc::new(fields),
        }
    }

    /// Create a record from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::new(fields)),
            other => Err(Error::InvalidRecord(format!(
                "record must be an object, got {}",
                type_of(&other)
            ))),
        }
    }

    /// Create an empty record.
    pub fn empty() -> Self {
        Self::new(Map::new())
    }

    /// The record's id, if the reserved field is set.
    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    /// The record's lifecycle status. Missing or malformed status reads as
    /// `Created`.
    pub fn status(&self) -> RecordStatus {
        self.fields
            .get(STATUS_FIELD)
            .and_then(Value::as_str)
            .and_then(RecordStatus::parse)
            .unwrap_or(RecordStatus::Created)
    }

    /// Whether the record is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.status() == RecordStatus::Deleted
    }

    /// Get a field value. The reserved fields are addressable like any other.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// All fields of the record.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Set a field value. Copy-on-write: if the backing object is shared,
    /// this clones it first, leaving other holders untouched.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        Arc::make_mut(&mut self.fields).insert(field.into(), value);
    }

    /// Set the record's id.
    pub fn set_id(&mut self, id: impl Into<RecordId>) {
        self.set(ID_FIELD, Value::String(id.into()));
    }

    /// Set the record's lifecycle status.
    pub fn set_status(&mut self, status: RecordStatus) {
        self.set(STATUS_FIELD, Value::String(status.as_str().to_string()));
    }

    /// A detached deep copy that shares nothing with this record.
    pub fn deep_clone(&self) -> Self {
        Self::new((*self.fields).clone())
    }

    /// Whether this record shares its backing object with another handle.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.fields) > 1
    }

    /// The record as a plain JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object((*self.fields).clone())
    }
}

fn type_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
