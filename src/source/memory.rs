// ABOUTME: In-process change source with tables, a transaction log and retention
// ABOUTME: Used by tests and embedders; supports simulated outages and DDL drift

use super::event::{ChangeEvent, ChangeKind, Field, Row, StreamItem, Value};
use super::{ChangeSource, ChangeStream, TableSnapshot};
use crate::config::DEFAULT_SCHEMA;
use crate::error::{Result, SyncError};
use crate::position::Position;
use crate::table::{ColumnDef, TableId, TableSchema};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: BTreeMap<String, Row>,
}

impl MemTable {
    fn key_of(&self, row: &Row) -> Result<String> {
        let key = row.project(&self.schema.primary_key).ok_or_else(|| {
            SyncError::invalid("row does not contain every primary key column")
        })?;
        serde_json::to_string(&key).map_err(|e| SyncError::invalid(e.to_string()))
    }
}

#[derive(Debug, Default)]
struct SourceState {
    tables: BTreeMap<TableId, MemTable>,
    log: VecDeque<StreamItem>,
    head: Position,
    reclaimed: Position,
    publication: BTreeSet<TableId>,
    slot_created: bool,
    available: bool,
    generation: u64,
    publication_failures: usize,
}

struct Inner {
    state: Mutex<SourceState>,
    notify: Notify,
}

/// Cloneable handle on an in-process source database.
///
/// Every mutation helper runs as one transaction: its changes share one position
/// and are followed by an end-of-batch marker.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize(id: &TableId) -> TableId {
    id.with_default_schema(DEFAULT_SCHEMA)
}

fn missing(id: &TableId) -> SyncError {
    SyncError::SourceTableMissing {
        table: id.to_string(),
    }
}

fn lost_connection() -> SyncError {
    SyncError::SourceUnavailable("connection to memory source lost".to_string())
}

impl MemorySource {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(SourceState {
                    available: true,
                    ..SourceState::default()
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SourceState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(state: &SourceState) -> Result<()> {
        if state.available {
            Ok(())
        } else {
            Err(lost_connection())
        }
    }

    fn check_publication(state: &mut SourceState) -> Result<()> {
        if state.publication_failures > 0 {
            state.publication_failures -= 1;
            return Err(SyncError::SourceUnavailable(
                "publication update failed".to_string(),
            ));
        }
        Ok(())
    }

    /// Append one transaction to the log and wake waiting streams.
    fn commit(state: &mut SourceState, table: &TableId, kinds: Vec<ChangeKind>) -> Position {
        let position = state.head.next();
        state.head = position;
        for kind in kinds {
            state
                .log
                .push_back(StreamItem::Change(ChangeEvent::new(table.clone(), position, kind)));
        }
        state.log.push_back(StreamItem::EndOfBatch(position));
        position
    }

    fn mutate<F>(&self, table: &TableId, f: F) -> Result<Position>
    where
        F: FnOnce(&mut MemTable) -> Result<Vec<ChangeKind>>,
    {
        let id = normalize(table);
        let position = {
            let mut state = self.state();
            let mem = state.tables.get_mut(&id).ok_or_else(|| missing(&id))?;
            let kinds = f(mem)?;
            Self::commit(&mut state, &id, kinds)
        };
        self.inner.notify.notify_waiters();
        Ok(position)
    }

    pub fn create_table(&self, table: &TableId, schema: TableSchema) -> Result<()> {
        let id = normalize(table);
        let mut state = self.state();
        if state.tables.contains_key(&id) {
            return Err(SyncError::AlreadyExists(format!("Table {}", id)));
        }
        state.tables.insert(
            id,
            MemTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    pub fn drop_table(&self, table: &TableId) -> Result<()> {
        let id = normalize(table);
        self.state()
            .tables
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| missing(&id))
    }

    /// Add a column; existing rows get NULL and the change is announced on the stream.
    pub fn add_column(&self, table: &TableId, column: ColumnDef) -> Result<Position> {
        self.mutate(table, |mem| {
            for row in mem.rows.values_mut() {
                row.0.push(Field::new(
                    &column.name,
                    &column.type_name,
                    Value::Null,
                ));
            }
            mem.schema.columns.push(column);
            Ok(vec![ChangeKind::SchemaChange {
                columns: mem.schema.columns.clone(),
            }])
        })
    }

    /// Rename a column without announcing it on the stream.
    pub fn rename_column(&self, table: &TableId, from: &str, to: &str) -> Result<()> {
        let id = normalize(table);
        let mut state = self.state();
        let mem = state.tables.get_mut(&id).ok_or_else(|| missing(&id))?;
        let column = mem
            .schema
            .columns
            .iter_mut()
            .find(|c| c.name == from)
            .ok_or_else(|| SyncError::invalid(format!("no column {} in {}", from, id)))?;
        column.name = to.to_string();
        for key in mem.schema.primary_key.iter_mut().filter(|k| k.as_str() == from) {
            *key = to.to_string();
        }
        for row in mem.rows.values_mut() {
            for field in row.0.iter_mut().filter(|f| f.name == from) {
                field.name = to.to_string();
            }
        }
        Ok(())
    }

    /// Make the next `count` publish or unpublish calls fail.
    pub fn fail_next_publications(&self, count: usize) {
        self.state().publication_failures = count;
    }

    pub fn insert(&self, table: &TableId, values: Vec<Value>) -> Result<Position> {
        self.insert_many(table, vec![values])
    }

    /// Insert several rows in a single transaction.
    pub fn insert_many(&self, table: &TableId, rows: Vec<Vec<Value>>) -> Result<Position> {
        self.mutate(table, |mem| {
            let mut kinds = Vec::with_capacity(rows.len());
            for values in rows {
                let row = build_row(&mem.schema, values)?;
                let key = mem.key_of(&row)?;
                mem.rows.insert(key, row.clone());
                kinds.push(ChangeKind::Insert { row });
            }
            Ok(kinds)
        })
    }

    /// Replace the row with the same primary key.
    pub fn update(&self, table: &TableId, values: Vec<Value>) -> Result<Position> {
        self.mutate(table, |mem| {
            let row = build_row(&mem.schema, values)?;
            let key = mem.key_of(&row)?;
            mem.rows.insert(key, row.clone());
            Ok(vec![ChangeKind::Update { row, old_key: None }])
        })
    }

    /// Update some columns of a row. The change carries only those columns, as
    /// happens for unchanged TOASTed values.
    pub fn update_columns(&self, table: &TableId, values: Vec<(&str, Value)>) -> Result<Position> {
        self.mutate(table, |mem| {
            let fields: Vec<Field> = mem
                .schema
                .columns
                .iter()
                .filter_map(|c| {
                    values
                        .iter()
                        .find(|(name, _)| *name == c.name)
                        .map(|(_, value)| Field::new(&c.name, &c.type_name, value.clone()))
                })
                .collect();
            if fields.len() != values.len() {
                return Err(SyncError::invalid("update names an unknown column"));
            }
            let row = Row::new(fields);
            let key = mem.key_of(&row)?;
            let stored = mem
                .rows
                .get_mut(&key)
                .ok_or_else(|| SyncError::invalid("no row with that key"))?;
            for field in row.fields() {
                if let Some(slot) = stored.0.iter_mut().find(|f| f.name == field.name) {
                    slot.value = field.value.clone();
                }
            }
            Ok(vec![ChangeKind::Update { row, old_key: None }])
        })
    }

    /// Update a row and change its primary key.
    pub fn update_key(
        &self,
        table: &TableId,
        old_key: Vec<Value>,
        values: Vec<Value>,
    ) -> Result<Position> {
        self.mutate(table, |mem| {
            let old = key_row(&mem.schema, old_key)?;
            let old_key_str =
                serde_json::to_string(&old).map_err(|e| SyncError::invalid(e.to_string()))?;
            mem.rows.remove(&old_key_str);
            let row = build_row(&mem.schema, values)?;
            let key = mem.key_of(&row)?;
            mem.rows.insert(key, row.clone());
            Ok(vec![ChangeKind::Update {
                row,
                old_key: Some(old),
            }])
        })
    }

    pub fn delete(&self, table: &TableId, key: Vec<Value>) -> Result<Position> {
        self.mutate(table, |mem| {
            let key = key_row(&mem.schema, key)?;
            let key_str =
                serde_json::to_string(&key).map_err(|e| SyncError::invalid(e.to_string()))?;
            mem.rows.remove(&key_str);
            Ok(vec![ChangeKind::Delete { key }])
        })
    }

    /// Simulate losing (or regaining) the connection. Open streams fail for good
    /// once the source goes away.
    pub fn set_available(&self, available: bool) {
        {
            let mut state = self.state();
            if state.available && !available {
                state.generation += 1;
            }
            state.available = available;
        }
        self.inner.notify.notify_waiters();
    }

    pub fn row_count(&self, table: &TableId) -> usize {
        self.state()
            .tables
            .get(&normalize(table))
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    pub fn is_published(&self, table: &TableId) -> bool {
        self.state().publication.contains(&normalize(table))
    }

    /// Highest position acknowledged so far.
    pub fn acknowledged(&self) -> Position {
        self.state().reclaimed
    }

    pub fn head(&self) -> Position {
        self.state().head
    }

    /// Items still retained in the log.
    pub fn retained(&self) -> usize {
        self.state().log.len()
    }

    pub fn slot_exists(&self) -> bool {
        self.state().slot_created
    }
}

fn build_row(schema: &TableSchema, values: Vec<Value>) -> Result<Row> {
    if values.len() != schema.columns.len() {
        return Err(SyncError::invalid(format!(
            "expected {} values, got {}",
            schema.columns.len(),
            values.len()
        )));
    }
    Ok(Row::from_values(&schema.columns, values))
}

fn key_row(schema: &TableSchema, values: Vec<Value>) -> Result<Row> {
    let columns: Vec<ColumnDef> = schema
        .primary_key
        .iter()
        .filter_map(|name| schema.column(name).cloned())
        .collect();
    if columns.len() != values.len() {
        return Err(SyncError::invalid(format!(
            "expected {} key values, got {}",
            columns.len(),
            values.len()
        )));
    }
    Ok(Row::from_values(&columns, values))
}

#[async_trait]
impl ChangeSource for MemorySource {
    async fn init_stream(&self) -> Result<Position> {
        let mut state = self.state();
        Self::check_available(&state)?;
        state.slot_created = true;
        state.reclaimed = state.reclaimed.max(state.head);
        let head = state.head;
        state.log.retain(|item| item.position() > head);
        Ok(head)
    }

    async fn open(&self, from: Position) -> Result<Box<dyn ChangeStream>> {
        let state = self.state();
        Self::check_available(&state)?;
        if from < state.reclaimed {
            return Err(SyncError::StreamGap {
                requested: from,
                oldest: state.reclaimed,
            });
        }
        Ok(Box::new(MemoryStream {
            source: self.clone(),
            cursor: from,
            consumed: 0,
            generation: state.generation,
        }))
    }

    async fn acknowledge(&self, position: Position) -> Result<()> {
        let mut state = self.state();
        Self::check_available(&state)?;
        if position > state.reclaimed {
            state.reclaimed = position;
        }
        while state
            .log
            .front()
            .map(|item| item.position() <= position)
            .unwrap_or(false)
        {
            state.log.pop_front();
        }
        Ok(())
    }

    async fn publish(&self, table: &TableId) -> Result<()> {
        let mut state = self.state();
        Self::check_available(&state)?;
        Self::check_publication(&mut state)?;
        state.publication.insert(normalize(table));
        Ok(())
    }

    async fn unpublish(&self, table: &TableId) -> Result<()> {
        let id = normalize(table);
        let mut state = self.state();
        Self::check_available(&state)?;
        Self::check_publication(&mut state)?;
        if !state.tables.contains_key(&id) {
            tracing::info!(
                "Skipping removal of table {} from publication, because table does not exist in PostgreSQL",
                id
            );
        }
        state.publication.remove(&id);
        Ok(())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableId>> {
        let state = self.state();
        Self::check_available(&state)?;
        Ok(state
            .tables
            .keys()
            .filter(|id| id.schema.as_deref() == Some(schema))
            .cloned()
            .collect())
    }

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema> {
        let id = normalize(table);
        let state = self.state();
        Self::check_available(&state)?;
        state
            .tables
            .get(&id)
            .map(|t| t.schema.clone())
            .ok_or_else(|| missing(&id))
    }

    async fn table_exists(&self, table: &TableId) -> Result<bool> {
        let state = self.state();
        Self::check_available(&state)?;
        Ok(state.tables.contains_key(&normalize(table)))
    }

    async fn snapshot(&self, table: &TableId) -> Result<TableSnapshot> {
        let id = normalize(table);
        let state = self.state();
        Self::check_available(&state)?;
        let mem = state.tables.get(&id).ok_or_else(|| missing(&id))?;

        let mut keyed: Vec<(Row, Row)> = mem
            .rows
            .values()
            .map(|row| {
                let key = row.project(&mem.schema.primary_key).unwrap_or_default();
                (key, row.clone())
            })
            .collect();
        keyed.sort_by(|a, b| a.0.cmp_values(&b.0));

        Ok(TableSnapshot {
            position: state.head,
            schema: mem.schema.clone(),
            rows: keyed.into_iter().map(|(_, row)| row).collect(),
        })
    }

    async fn drop_stream(&self) -> Result<()> {
        let mut state = self.state();
        Self::check_available(&state)?;
        state.slot_created = false;
        state.publication.clear();
        Ok(())
    }
}

pub struct MemoryStream {
    source: MemorySource,
    /// Last transaction boundary handed out.
    cursor: Position,
    /// Log items of the current transaction already consumed.
    consumed: usize,
    generation: u64,
}

impl MemoryStream {
    /// Next deliverable item after the cursor, skipping unpublished tables.
    fn poll_item(&mut self) -> Result<Option<StreamItem>> {
        let state = self.source.state();
        if !state.available || state.generation != self.generation {
            return Err(lost_connection());
        }

        let start = state
            .log
            .partition_point(|item| item.position() <= self.cursor);
        while let Some(item) = state.log.get(start + self.consumed) {
            self.consumed += 1;
            match item {
                StreamItem::Change(event) if !state.publication.contains(&event.table) => {}
                StreamItem::Change(_) => return Ok(Some(item.clone())),
                StreamItem::EndOfBatch(position) => {
                    self.cursor = *position;
                    self.consumed = 0;
                    return Ok(Some(item.clone()));
                }
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl ChangeStream for MemoryStream {
    async fn next(&mut self) -> Result<StreamItem> {
        let inner = self.source.inner.clone();
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.poll_item()? {
                return Ok(item);
            }
            notified.await;
        }
    }
}
