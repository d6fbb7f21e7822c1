// ABOUTME: Change stream items - typed values, rows and change events
// ABOUTME: Produced by every ChangeSource adapter and consumed by the apply engine

use crate::position::Position;
use crate::table::{ColumnDef, TableId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::Text(_) => 3,
            Value::Bytes(_) => 4,
        }
    }

    /// Total order used to sort rows by key. Nulls first, numbers compared numerically.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).total_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.total_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Storage class of a column, derived from its declared type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
}

impl ValueKind {
    /// Classify PostgreSQL (`character varying(20)`, `int8`) and SQLite (`INTEGER`) type names.
    pub fn of(type_name: &str) -> Self {
        let lowered = type_name.trim().to_ascii_lowercase();
        if lowered.ends_with("[]") {
            return ValueKind::Text;
        }
        let base = lowered
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        match base.as_str() {
            "smallint" | "integer" | "bigint" | "int" | "int2" | "int4" | "int8"
            | "smallserial" | "serial" | "bigserial" => ValueKind::Int,
            "real" | "double precision" | "float4" | "float8" | "float" | "double" => {
                ValueKind::Float
            }
            "boolean" | "bool" => ValueKind::Bool,
            "bytea" | "blob" => ValueKind::Bytes,
            _ => ValueKind::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub type_name: String,
    pub value: Value,
}

impl Field {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value,
        }
    }
}

/// Ordered list of named, typed values.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(pub Vec<Field>);

impl Row {
    pub fn new(fields: Vec<Field>) -> Self {
        Row(fields)
    }

    /// Pair `values` positionally with `columns`.
    pub fn from_values(columns: &[ColumnDef], values: Vec<Value>) -> Self {
        Row(columns
            .iter()
            .zip(values)
            .map(|(column, value)| Field::new(&column.name, &column.type_name, value))
            .collect())
    }

    pub fn fields(&self) -> &[Field] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.iter().find(|f| f.name == name).map(|f| &f.value)
    }

    /// Declared `(name, type)` layout of the row.
    pub fn shape(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .map(|f| (f.name.as_str(), f.type_name.as_str()))
    }

    /// Project the row onto `columns`, in that order. `None` if any column is absent.
    pub fn project(&self, columns: &[String]) -> Option<Row> {
        columns
            .iter()
            .map(|name| self.0.iter().find(|f| &f.name == name).cloned())
            .collect::<Option<Vec<_>>>()
            .map(Row)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.0.iter().map(|f| &f.value)
    }

    /// Compare two rows value by value, in field order.
    pub fn cmp_values(&self, other: &Row) -> Ordering {
        for (a, b) in self.values().zip(other.values()) {
            match a.total_cmp(b) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        self.len().cmp(&other.len())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert {
        row: Row,
    },
    /// `old_key` is set when the primary key itself changed.
    Update {
        row: Row,
        old_key: Option<Row>,
    },
    Delete {
        key: Row,
    },
    SchemaChange {
        columns: Vec<ColumnDef>,
    },
}

impl ChangeKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChangeKind::Insert { .. } => "insert",
            ChangeKind::Update { .. } => "update",
            ChangeKind::Delete { .. } => "delete",
            ChangeKind::SchemaChange { .. } => "schema change",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub table: TableId,
    pub position: Position,
    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(table: TableId, position: Position, kind: ChangeKind) -> Self {
        Self {
            table,
            position,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Change(ChangeEvent),
    /// Source transaction boundary; the only kind of position that gets acknowledged.
    EndOfBatch(Position),
}

impl StreamItem {
    pub fn position(&self) -> Position {
        match self {
            StreamItem::Change(event) => event.position,
            StreamItem::EndOfBatch(position) => *position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", "int8", false),
            ColumnDef::new("name", "text", true),
        ]
    }

    #[test]
    fn test_row_from_values_and_project() {
        let row = Row::from_values(&columns(), vec![Value::Int(7), "alice".into()]);
        assert_eq!(row.len(), 2);
        assert_eq!(row.get("name"), Some(&Value::Text("alice".into())));

        let key = row.project(&["id".to_string()]).unwrap();
        assert_eq!(key.len(), 1);
        assert_eq!(key.get("id"), Some(&Value::Int(7)));

        assert!(row.project(&["missing".to_string()]).is_none());
    }

    #[test]
    fn test_value_total_order() {
        assert_eq!(Value::Int(2).total_cmp(&Value::Int(10)), Ordering::Less);
        assert_eq!(Value::Int(2).total_cmp(&Value::Float(1.5)), Ordering::Greater);
        assert_eq!(Value::Null.total_cmp(&Value::Int(0)), Ordering::Less);
        assert_eq!(
            Value::Text("b".into()).total_cmp(&Value::Text("a".into())),
            Ordering::Greater
        );
    }

    #[test]
    fn test_value_kind_of() {
        assert_eq!(ValueKind::of("integer"), ValueKind::Int);
        assert_eq!(ValueKind::of("INTEGER"), ValueKind::Int);
        assert_eq!(ValueKind::of("double precision"), ValueKind::Float);
        assert_eq!(ValueKind::of("character varying(255)"), ValueKind::Text);
        assert_eq!(ValueKind::of("numeric(10,2)"), ValueKind::Text);
        assert_eq!(ValueKind::of("integer[]"), ValueKind::Text);
        assert_eq!(ValueKind::of("bool"), ValueKind::Bool);
        assert_eq!(ValueKind::of("bytea"), ValueKind::Bytes);
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_row_serializes_as_list() {
        let row = Row::from_values(&columns(), vec![Value::Int(1), Value::Null]);
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.is_array());
        let back: Row = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }
}
