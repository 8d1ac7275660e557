//! Schema definition and validation.
//!
//! Schemas define the set of tables a database holds and enable validation
//! of record payloads before they are stored.

use crate::{error::Result, Error, SchemaVersion, TableName};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Column types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnType::String => write!(f, "String"),
            ColumnType::Int => write!(f, "Int"),
            ColumnType::Float => write!(f, "Float"),
            ColumnType::Bool => write!(f, "Bool"),
            ColumnType::Timestamp => write!(f, "Timestamp"),
            ColumnType::Json => write!(f, "Json"),
        }
    }
}

/// Definition of a column in a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    /// Column name
    pub name: String,
    /// Column type
    pub column_type: ColumnType,
    /// Whether this column is required
    pub required: bool,
}

impl ColumnDef {
    /// Create a new required column definition.
    pub fn required(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            required: true,
        }
    }

    /// Create a new optional column definition.
    pub fn optional(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            required: false,
        }
    }

    /// Validate a JSON value against this column definition.
    pub fn validate(&self, value: Option<&serde_json::Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredColumn(self.name.clone())),
            None => Ok(()),
            Some(serde_json::Value::Null) if self.required => {
                Err(Error::MissingRequiredColumn(self.name.clone()))
            }
            Some(serde_json::Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &serde_json::Value) -> Result<()> {
        let valid = match self.column_type {
            ColumnType::String => value.is_string(),
            ColumnType::Int => value.is_i64() || value.is_u64(),
            ColumnType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            ColumnType::Bool => value.is_boolean(),
            ColumnType::Timestamp => value.is_u64() || value.is_i64(),
            ColumnType::Json => true, // Any JSON is valid
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                column: self.name.clone(),
                expected: self.column_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "Null",
        serde_json::Value::Bool(_) => "Bool",
        serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        serde_json::Value::Number(_) => "Float",
        serde_json::Value::String(_) => "String",
        serde_json::Value::Array(_) => "Array",
        serde_json::Value::Object(_) => "Object",
    }
}

/// Schema for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableSchema {
    /// Table name
    pub name: TableName,
    /// Column definitions (reserved `id` and `_status` fields excluded)
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Create a new table schema.
    pub fn new(name: impl Into<TableName>, columns: Vec<ColumnDef>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Get a column definition by name.
    pub fn get_column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Validate a record payload against this table's columns.
    pub fn validate_payload(&self, payload: &serde_json::Map<String, serde_json::Value>) -> Result<()> {
        for column in &self.columns {
            column.validate(payload.get(&column.name))?;
        }
        Ok(())
    }
}

/// Schema for the entire database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version for migrations
    pub version: SchemaVersion,
    /// Table schemas by name
    pub tables: HashMap<TableName, TableSchema>,
}

impl Schema {
    /// Create a new schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            tables: HashMap::new(),
        }
    }

    /// Add a table to the schema.
    pub fn add_table(&mut self, table: TableSchema) -> &mut Self {
        self.tables.insert(table.name.clone(), table);
        self
    }

    /// Builder-style method to add a table.
    pub fn with_table(mut self, table: TableSchema) -> Self {
        self.add_table(table);
        self
    }

    /// Get a table schema by name.
    pub fn get_table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.get(name)
    }

    /// Check whether a table exists in this schema.
    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Validate a payload destined for the named table.
    pub fn validate_payload(
        &self,
        table: &str,
        payload: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<()> {
        let table_schema = self
            .tables
            .get(table)
            .ok_or_else(|| Error::TableNotFound(table.to_string()))?;
        table_schema.validate_payload(payload)
    }
}
