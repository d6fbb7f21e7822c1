// ABOUTME: Local managed-table storage behind one atomic commit primitive
// ABOUTME: Every data change lands in the same transaction as the checkpoint describing it

pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;

use crate::source::{Field, Row, Value};
use crate::table::TableSchema;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One row-level change against a managed table.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Insert the row or overwrite the row with the same primary key.
    ///
    /// Columns left out of `row` (unchanged TOASTed values of an update) keep
    /// their stored value, or NULL when the row is new.
    Upsert { table: String, row: Row },
    /// Remove the row whose primary key equals `key`.
    Delete { table: String, key: Row },
}

impl RowOp {
    pub fn table(&self) -> &str {
        match self {
            RowOp::Upsert { table, .. } | RowOp::Delete { table, .. } => table,
        }
    }
}

/// A managed table recreated from scratch with a baseline.
#[derive(Debug, Clone)]
pub struct TableData {
    pub name: String,
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

/// Everything that becomes durable together.
///
/// Applied in this order: `drop_tables`, `replace_tables`, `operations`, then the
/// checkpoint. `schemas` holds the layout of every table `operations` touches.
#[derive(Debug, Clone, Default)]
pub struct CommitBatch {
    pub drop_tables: Vec<String>,
    pub replace_tables: Vec<TableData>,
    pub schemas: BTreeMap<String, TableSchema>,
    pub operations: Vec<RowOp>,
    pub checkpoint: String,
}

impl CommitBatch {
    /// A commit that only records a new checkpoint.
    pub fn checkpoint_only(checkpoint: String) -> Self {
        Self {
            checkpoint,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait TargetStorage: Send + Sync {
    /// Apply the batch in a single local transaction. Nothing is visible if it fails.
    async fn commit(&self, batch: CommitBatch) -> Result<()>;

    /// The encoded checkpoint of the last successful commit, if any.
    async fn load_checkpoint(&self) -> Result<Option<String>>;

    async fn row_count(&self, table: &str) -> Result<u64>;

    /// All rows of a managed table ordered by primary key.
    async fn read_rows(&self, table: &str) -> Result<Vec<Row>>;

    /// Remove every managed table and the checkpoint.
    async fn destroy(&self) -> Result<()>;
}

/// Sort rows by their primary key values.
pub(crate) fn sort_by_key(rows: &mut [Row], primary_key: &[String]) {
    rows.sort_by(|a, b| {
        let ka = a.project(primary_key).unwrap_or_default();
        let kb = b.project(primary_key).unwrap_or_default();
        ka.cmp_values(&kb)
    });
}

/// Lay `row` out over every column of `schema`, taking left-out columns from
/// `existing` or NULL.
pub(crate) fn complete_row(schema: &TableSchema, row: Row, existing: Option<&Row>) -> Row {
    if row.len() == schema.columns.len() {
        return row;
    }
    let fields = schema
        .columns
        .iter()
        .map(|column| {
            let value = row
                .get(&column.name)
                .or_else(|| existing.and_then(|e| e.get(&column.name)))
                .cloned()
                .unwrap_or(Value::Null);
            Field::new(&column.name, &column.type_name, value)
        })
        .collect();
    Row::new(fields)
}
