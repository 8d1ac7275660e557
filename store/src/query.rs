//! Serialized queries.
//!
//! A [`SerializedQuery`] is an immutable description of a read operation:
//! a table name plus a composable predicate/sort/limit tree. It is built
//! once (the builder consumes `self`) and never mutated afterwards, so it
//! can be shared across context boundaries by reference.

use crate::{RawRecord, TableName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Comparison operators for `where` clauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    Eq(Value),
    NotEq(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    OneOf(Vec<Value>),
}

/// A predicate over record fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Clause {
    Where { field: String, op: Comparison },
    And(Vec<Clause>),
    Or(Vec<Clause>),
}

impl Clause {
    /// Evaluate the predicate against a record. A missing field reads as
    /// JSON null.
    pub fn matches(&self, record: &RawRecord) -> bool {
        match self {
            Clause::Where { field, op } => {
                let value = record.get(field).unwrap_or(&Value::Null);
                op.matches(value)
            }
            Clause::And(clauses) => clauses.iter().all(|c| c.matches(record)),
            Clause::Or(clauses) => clauses.iter().any(|c| c.matches(record)),
        }
    }
}

impl Comparison {
    fn matches(&self, value: &Value) -> bool {
        match self {
            Comparison::Eq(expected) => values_equal(value, expected),
            Comparison::NotEq(expected) => !values_equal(value, expected),
            Comparison::Gt(expected) => compare_values(value, expected) == Some(Ordering::Greater),
            Comparison::Gte(expected) => matches!(
                compare_values(value, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Comparison::Lt(expected) => compare_values(value, expected) == Some(Ordering::Less),
            Comparison::Lte(expected) => matches!(
                compare_values(value, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Comparison::OneOf(options) => options.iter().any(|o| values_equal(value, o)),
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            // Integers compare exactly, even beyond f64's 2^53 precision
            (Some(i), Some(j)) => i == j,
            // Mixed int/float compares numerically, so 1 == 1.0
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Partial ordering over JSON values: numbers numerically, strings
/// lexicographically, booleans false < true. Mixed types are unordered.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Sort direction for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// A single sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortBy {
    pub field: String,
    pub direction: SortDirection,
}

/// An immutable description of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedQuery {
    table: TableName,
    clauses: Vec<Clause>,
    sort: Vec<SortBy>,
    limit: Option<usize>,
}

impl SerializedQuery {
    /// Start a query over the given table.
    pub fn new(table: impl Into<TableName>) -> Self {
        Self {
            table: table.into(),
            clauses: Vec::new(),
            sort: Vec::new(),
            limit: None,
        }
    }

    /// Add a `where field op` clause. All top-level clauses are ANDed.
    pub fn and_where(mut self, field: impl Into<String>, op: Comparison) -> Self {
        self.clauses.push(Clause::Where {
            field: field.into(),
            op,
        });
        self
    }

    /// Add an arbitrary predicate clause.
    pub fn and_clause(mut self, clause: Clause) -> Self {
        self.clauses.push(clause);
        self
    }

    /// Add a sort key. Multiple keys apply in the order given.
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort.push(SortBy {
            field: field.into(),
            direction,
        });
        self
    }

    /// Cap the number of returned records.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// The table this query reads from.
    pub fn table(&self) -> &TableName {
        &self.table
    }

    /// The predicate clauses (implicitly ANDed).
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// The sort keys.
    pub fn sort(&self) -> &[SortBy] {
        &self.sort
    }

    /// The result cap, if any.
    pub fn limit_value(&self) -> Option<usize> {
        self.limit
    }

    /// Evaluate the predicate against a record.
    pub fn matches(&self, record: &RawRecord) -> bool {
        self.clauses.iter().all(|c| c.matches(record))
    }

    /// Order two records by this query's sort keys.
    pub fn compare_records(&self, a: &RawRecord, b: &RawRecord) -> Ordering {
        for key in &self.sort {
            let va = a.get(&key.field).unwrap_or(&Value::Null);
            let vb = b.get(&key.field).unwrap_or(&Value::Null);
            let ord = compare_values(va, vb).unwrap_or(Ordering::Equal);
            let ord = match key.direction {
                SortDirection::Asc => ord,
                SortDirection::Desc => ord.reverse(),
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}
