// ABOUTME: Tracked table model - identity, column layout and replication state
// ABOUTME: Shared by the registry, the apply engine and the checkpoint format

use crate::position::Position;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a source table. The schema is optional for single-schema databases.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: Option<String>,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            name: name.into(),
        }
    }

    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// Parse `schema.table` or a bare `table`. Only the first dot separates the schema.
    pub fn parse(value: &str) -> Self {
        match value.split_once('.') {
            Some((schema, name)) => TableId::new(schema, name),
            None => TableId::bare(value),
        }
    }

    /// The same table with `schema` filled in when it was left out.
    pub fn with_default_schema(&self, schema: &str) -> Self {
        Self {
            schema: Some(self.schema.clone().unwrap_or_else(|| schema.to_string())),
            name: self.name.clone(),
        }
    }

    pub fn schema_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.schema.as_deref().unwrap_or(default)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable,
        }
    }
}

/// Ordered column set plus the replica identity (primary key columns).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>, primary_key: Vec<String>) -> Self {
        Self {
            columns,
            primary_key,
        }
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// Compare a declared `(name, type)` layout against this schema.
    ///
    /// Returns a human readable reason when names, types or order differ.
    pub fn shape_difference<'a, I>(&self, declared: I) -> Option<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let declared: Vec<(&str, &str)> = declared.into_iter().collect();
        if declared.len() != self.columns.len() {
            return Some(format!(
                "expected {} columns ({}), got {} ({})",
                self.columns.len(),
                self.column_names().join(", "),
                declared.len(),
                declared
                    .iter()
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        for (position, (expected, (name, type_name))) in
            self.columns.iter().zip(declared.iter()).enumerate()
        {
            if expected.name != *name {
                return Some(format!(
                    "column {} is '{}', expected '{}'",
                    position + 1,
                    name,
                    expected.name
                ));
            }
            if !expected.type_name.eq_ignore_ascii_case(type_name) {
                return Some(format!(
                    "column '{}' has type {}, expected {}",
                    name, type_name, expected.type_name
                ));
            }
        }

        None
    }

    /// Like [`shape_difference`](Self::shape_difference) for a row that may leave out
    /// non-key columns (unchanged TOASTed values of an update).
    ///
    /// Every declared column must be known with the same type, appear once and in
    /// table order; every primary key column must be present.
    pub fn partial_difference<'a, I>(&self, declared: I) -> Option<String>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut next = 0;
        let mut seen: Vec<&str> = Vec::new();
        for (name, type_name) in declared {
            let Some(offset) = self.columns[next..].iter().position(|c| c.name == name) else {
                return Some(if self.column(name).is_some() {
                    format!("column '{}' is out of order", name)
                } else {
                    format!("unknown column '{}'", name)
                });
            };
            let expected = &self.columns[next + offset];
            if !expected.type_name.eq_ignore_ascii_case(type_name) {
                return Some(format!(
                    "column '{}' has type {}, expected {}",
                    name, type_name, expected.type_name
                ));
            }
            next += offset + 1;
            seen.push(name);
        }

        let missing: Vec<&str> = self
            .primary_key
            .iter()
            .map(String::as_str)
            .filter(|pk| !seen.contains(pk))
            .collect();
        if !missing.is_empty() {
            return Some(format!("row misses primary key columns ({})", missing.join(", ")));
        }
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Initializing,
    Snapshotting,
    Syncing,
    Skipped,
    Detached,
}

impl TableState {
    /// Waiting for its baseline; stream events are deferred.
    pub fn awaits_baseline(self) -> bool {
        matches!(self, TableState::Initializing | TableState::Snapshotting)
    }
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TableState::Initializing => "Initializing",
            TableState::Snapshotting => "Snapshotting",
            TableState::Syncing => "Syncing",
            TableState::Skipped => "Skipped",
            TableState::Detached => "Detached",
        };
        f.pad(name)
    }
}

/// One source table mirrored into one local table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedTable {
    pub id: TableId,
    pub local_name: String,
    /// Recorded column set; absent until the first baseline lands.
    pub schema: Option<TableSchema>,
    pub state: TableState,
    pub last_applied_position: Position,
    pub snapshot_position: Option<Position>,
    pub quarantine_reason: Option<String>,
}

impl TrackedTable {
    pub fn new(id: TableId, local_name: impl Into<String>) -> Self {
        Self {
            id,
            local_name: local_name.into(),
            schema: None,
            state: TableState::Initializing,
            last_applied_position: Position::ZERO,
            snapshot_position: None,
            quarantine_reason: None,
        }
    }

    /// Back to `Initializing` for a fresh baseline (re-attach).
    pub fn reset(&mut self) {
        self.schema = None;
        self.state = TableState::Initializing;
        self.last_applied_position = Position::ZERO;
        self.snapshot_position = None;
        self.quarantine_reason = None;
    }

    pub fn begin_snapshot(&mut self) {
        self.state = TableState::Snapshotting;
    }

    /// Baseline committed: the table now follows the stream from `position`.
    pub fn finish_snapshot(&mut self, schema: TableSchema, position: Position) {
        self.schema = Some(schema);
        self.state = TableState::Syncing;
        self.snapshot_position = Some(position);
        self.last_applied_position = position;
        self.quarantine_reason = None;
    }

    pub fn quarantine(&mut self, reason: impl Into<String>) {
        self.state = TableState::Skipped;
        self.quarantine_reason = Some(reason.into());
    }

    pub fn detach(&mut self) {
        self.state = TableState::Detached;
    }

    pub fn is_visible(&self) -> bool {
        self.state != TableState::Detached
    }

    /// Record an applied event. Positions never move backwards.
    pub fn advance(&mut self, position: Position) {
        if position > self.last_applied_position {
            self.last_applied_position = position;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnDef::new("id", "int8", false),
                ColumnDef::new("name", "text", true),
            ],
            vec!["id".to_string()],
        )
    }

    #[test]
    fn test_table_id_parse_and_display() {
        let qualified = TableId::parse("sales.orders");
        assert_eq!(qualified.schema.as_deref(), Some("sales"));
        assert_eq!(qualified.name, "orders");
        assert_eq!(qualified.to_string(), "sales.orders");

        let bare = TableId::parse("orders");
        assert_eq!(bare.schema, None);
        assert_eq!(bare.to_string(), "orders");
        assert_eq!(bare.schema_or("public"), "public");
        assert_eq!(
            bare.with_default_schema("public"),
            TableId::new("public", "orders")
        );
    }

    #[test]
    fn test_shape_difference_detects_changes() {
        let schema = users_schema();
        assert_eq!(schema.shape_difference([("id", "int8"), ("name", "text")]), None);
        assert_eq!(schema.shape_difference([("id", "INT8"), ("name", "TEXT")]), None);

        let extra = schema.shape_difference([("id", "int8"), ("name", "text"), ("age", "int4")]);
        assert!(extra.unwrap().contains("expected 2 columns"));

        let retyped = schema.shape_difference([("id", "int8"), ("name", "int4")]);
        assert!(retyped.unwrap().contains("has type int4"));

        let renamed = schema.shape_difference([("id", "int8"), ("title", "text")]);
        assert!(renamed.unwrap().contains("'title'"));
    }

    #[test]
    fn test_partial_difference_allows_left_out_columns() {
        let schema = TableSchema::new(
            vec![
                ColumnDef::new("id", "int8", false),
                ColumnDef::new("name", "text", true),
                ColumnDef::new("bio", "text", true),
            ],
            vec!["id".to_string()],
        );
        assert_eq!(schema.partial_difference([("id", "int8"), ("name", "text")]), None);
        assert_eq!(schema.partial_difference([("id", "int8"), ("bio", "text")]), None);

        let unknown = schema.partial_difference([("id", "int8"), ("age", "int4")]);
        assert!(unknown.unwrap().contains("unknown column 'age'"));

        let retyped = schema.partial_difference([("id", "int8"), ("bio", "int4")]);
        assert!(retyped.unwrap().contains("has type int4"));

        let reordered = schema.partial_difference([("id", "int8"), ("bio", "text"), ("name", "text")]);
        assert!(reordered.unwrap().contains("out of order"));

        let keyless = schema.partial_difference([("name", "text")]);
        assert!(keyless.unwrap().contains("primary key columns (id)"));
    }

    #[test]
    fn test_tracked_table_lifecycle() {
        let mut table = TrackedTable::new(TableId::bare("users"), "users");
        assert_eq!(table.state, TableState::Initializing);
        assert!(table.state.awaits_baseline());

        table.begin_snapshot();
        assert_eq!(table.state, TableState::Snapshotting);

        table.finish_snapshot(users_schema(), Position(10));
        assert_eq!(table.state, TableState::Syncing);
        assert_eq!(table.last_applied_position, Position(10));

        table.advance(Position(5));
        assert_eq!(table.last_applied_position, Position(10));
        table.advance(Position(12));
        assert_eq!(table.last_applied_position, Position(12));

        table.quarantine("column added");
        assert_eq!(table.state, TableState::Skipped);
        assert!(table.is_visible());

        table.detach();
        assert!(!table.is_visible());

        table.reset();
        assert_eq!(table.state, TableState::Initializing);
        assert_eq!(table.quarantine_reason, None);
        assert_eq!(table.schema, None);
    }
}
