// ABOUTME: In-memory managed tables for tests and embedding
// ABOUTME: Validates a whole batch before applying it and supports injected commit failures

use super::{complete_row, sort_by_key, CommitBatch, RowOp, TargetStorage};
use crate::source::{Row, Value};
use crate::table::TableSchema;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Default)]
struct MemoryState {
    tables: BTreeMap<String, MemTable>,
    checkpoint: Option<String>,
    failures_pending: usize,
    commits: usize,
}

fn row_key(row: &Row, primary_key: &[String]) -> Result<String> {
    let key = row
        .project(primary_key)
        .ok_or_else(|| anyhow!("row is missing primary key columns {:?}", primary_key))?;
    let values: Vec<&Value> = key.values().collect();
    Ok(serde_json::to_string(&values)?)
}

#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` commits fail without applying anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.state().failures_pending = count;
    }

    /// Overwrite the stored checkpoint text.
    pub fn set_raw_checkpoint(&self, checkpoint: Option<String>) {
        self.state().checkpoint = checkpoint;
    }

    pub fn commit_count(&self) -> usize {
        self.state().commits
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state().tables.keys().cloned().collect()
    }
}

/// Reject batches that would fail half-way through.
fn validate(state: &MemoryState, batch: &CommitBatch) -> Result<()> {
    let dropped: BTreeSet<&str> = batch.drop_tables.iter().map(String::as_str).collect();
    let replaced: BTreeMap<&str, &TableSchema> = batch
        .replace_tables
        .iter()
        .map(|t| (t.name.as_str(), &t.schema))
        .collect();

    for table in &batch.replace_tables {
        for row in &table.rows {
            row_key(row, &table.schema.primary_key)?;
        }
    }

    for op in &batch.operations {
        let name = op.table();
        let exists = replaced.contains_key(name)
            || (!dropped.contains(name) && state.tables.contains_key(name));
        if !exists {
            bail!("table {} does not exist", name);
        }
        let schema = batch
            .schemas
            .get(name)
            .or_else(|| replaced.get(name).copied())
            .ok_or_else(|| anyhow!("no schema supplied for table {}", name))?;
        match op {
            RowOp::Upsert { row, .. } => row_key(row, &schema.primary_key)?,
            RowOp::Delete { key, .. } => row_key(key, &schema.primary_key)?,
        };
    }
    Ok(())
}

#[async_trait]
impl TargetStorage for MemoryStorage {
    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut state = self.state();
        if state.failures_pending > 0 {
            state.failures_pending -= 1;
            bail!("injected commit failure");
        }
        validate(&state, &batch)?;

        for name in &batch.drop_tables {
            state.tables.remove(name);
        }
        for table in batch.replace_tables {
            let mut rows = BTreeMap::new();
            for row in table.rows {
                rows.insert(row_key(&row, &table.schema.primary_key)?, row);
            }
            state.tables.insert(
                table.name,
                MemTable {
                    schema: table.schema,
                    rows,
                },
            );
        }
        for op in batch.operations {
            let table = state
                .tables
                .get_mut(op.table())
                .ok_or_else(|| anyhow!("table {} does not exist", op.table()))?;
            let schema = batch
                .schemas
                .get(op.table())
                .cloned()
                .unwrap_or_else(|| table.schema.clone());
            match op {
                RowOp::Upsert { row, .. } => {
                    let key = row_key(&row, &schema.primary_key)?;
                    let row = complete_row(&schema, row, table.rows.get(&key));
                    table.rows.insert(key, row);
                }
                RowOp::Delete { key, .. } => {
                    table.rows.remove(&row_key(&key, &schema.primary_key)?);
                }
            }
        }
        state.checkpoint = Some(batch.checkpoint);
        state.commits += 1;
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<String>> {
        Ok(self.state().checkpoint.clone())
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        self.state()
            .tables
            .get(table)
            .map(|t| t.rows.len() as u64)
            .ok_or_else(|| anyhow!("table {} does not exist", table))
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Row>> {
        let state = self.state();
        let mem = state
            .tables
            .get(table)
            .ok_or_else(|| anyhow!("table {} does not exist", table))?;
        let mut rows: Vec<Row> = mem.rows.values().cloned().collect();
        sort_by_key(&mut rows, &mem.schema.primary_key);
        Ok(rows)
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.state();
        state.tables.clear();
        state.checkpoint = None;
        Ok(())
    }
}
