// ABOUTME: PostgreSQL change source - logical decoding through a wal2json slot
// ABOUTME: Reads changes with pg_logical_slot_peek_changes and acknowledges by advancing the slot

use super::event::{ChangeEvent, ChangeKind, Field, Row, StreamItem, Value, ValueKind};
use super::{ChangeSource, ChangeStream, TableSnapshot};
use crate::config::ConnectionParams;
use crate::error::{Result, SyncError};
use crate::position::Position;
use crate::postgres::privileges::can_select;
use crate::postgres::{
    check_source_readiness, connect, connect_error, connect_with_retry, is_connection_error,
    is_undefined_table,
};
use crate::table::{ColumnDef, TableId, TableSchema};
use crate::utils::quote_ident;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_postgres::{Client, IsolationLevel};

/// Records fetched per peek. Decoding always finishes the transaction in progress.
const PEEK_LIMIT: i32 = 10_000;

fn source_error(context: &str, err: tokio_postgres::Error) -> SyncError {
    if is_connection_error(&err) {
        return SyncError::SourceUnavailable(format!("{}: connection lost: {}", context, err));
    }
    let detail = err
        .as_db_error()
        .map(|e| e.message().to_string())
        .unwrap_or_else(|| err.to_string());
    SyncError::SourceUnavailable(format!("{}: {}", context, detail))
}

fn query_error(err: anyhow::Error) -> SyncError {
    SyncError::SourceUnavailable(format!("{:#}", err))
}

fn schema_of(table: &TableId) -> &str {
    table.schema_or(crate::config::DEFAULT_SCHEMA)
}

/// Change source backed by a PostgreSQL logical replication slot (wal2json plugin).
pub struct PgSource {
    params: ConnectionParams,
    slot: String,
    client: tokio::sync::Mutex<Option<Arc<Client>>>,
    publication: Arc<RwLock<BTreeSet<TableId>>>,
    poll_interval: Duration,
}

impl PgSource {
    pub fn new(params: ConnectionParams, slot: impl Into<String>) -> Self {
        Self {
            params,
            slot: slot.into(),
            client: tokio::sync::Mutex::new(None),
            publication: Arc::new(RwLock::new(BTreeSet::new())),
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Shared catalog connection, reconnected when the previous one was closed.
    async fn client(&self) -> Result<Arc<Client>> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            if !client.is_closed() {
                return Ok(client.clone());
            }
            tracing::warn!("Source connection closed, reconnecting");
        }
        let client = Arc::new(connect_with_retry(&self.params).await?);
        *guard = Some(client.clone());
        Ok(client)
    }

    async fn confirmed_flush(&self, client: &Client) -> Result<Option<Position>> {
        let row = client
            .query_opt(
                "SELECT confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot],
            )
            .await
            .map_err(|e| source_error("Failed to read replication slot", e))?;
        match row.and_then(|r| r.get::<_, Option<String>>(0)) {
            Some(lsn) => Ok(Some(Position::from_lsn(&lsn).map_err(|e| {
                SyncError::SourceUnavailable(format!("{:#}", e))
            })?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ChangeSource for PgSource {
    async fn init_stream(&self) -> Result<Position> {
        let client = self.client().await?;

        let readiness = check_source_readiness(&client)
            .await
            .map_err(query_error)?;
        if !readiness.is_ready() {
            return Err(SyncError::invalid(format!(
                "source cannot stream changes: {}",
                readiness.problems().join("; ")
            )));
        }

        let existing = client
            .query_opt(
                "SELECT plugin, confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot],
            )
            .await
            .map_err(|e| source_error("Failed to check for existing replication slot", e))?;

        let lsn: String = match existing {
            Some(row) => {
                let plugin: Option<String> = row.get(0);
                if plugin.as_deref() != Some("wal2json") {
                    return Err(SyncError::invalid(format!(
                        "replication slot {} uses plugin {:?}, expected wal2json",
                        self.slot, plugin
                    )));
                }
                tracing::info!("Replication slot already exists: {}", self.slot);
                row.get::<_, Option<String>>(1).unwrap_or_else(|| "0/0".to_string())
            }
            None => {
                tracing::info!("Creating logical replication slot: {}", self.slot);
                let row = client
                    .query_one(
                        "SELECT lsn::text FROM pg_create_logical_replication_slot($1, 'wal2json')",
                        &[&self.slot],
                    )
                    .await
                    .map_err(|e| source_error("Failed to create logical replication slot", e))?;
                row.get(0)
            }
        };

        Position::from_lsn(&lsn).map_err(|e| SyncError::SourceUnavailable(format!("{:#}", e)))
    }

    async fn open(&self, from: Position) -> Result<Box<dyn ChangeStream>> {
        // The stream polls on its own connection so catalog calls never wait behind it.
        let client = connect(&self.params).await.map_err(connect_error)?;

        let confirmed = self.confirmed_flush(&client).await?.ok_or_else(|| {
            SyncError::invalid(format!("replication slot {} does not exist", self.slot))
        })?;
        if from < confirmed {
            return Err(SyncError::StreamGap {
                requested: from,
                oldest: confirmed,
            });
        }

        tracing::debug!("Opening change stream on slot {} after {}", self.slot, from);
        Ok(Box::new(PgStream {
            client,
            slot: self.slot.clone(),
            publication: self.publication.clone(),
            cursor: from,
            buffer: VecDeque::new(),
            poll_interval: self.poll_interval,
        }))
    }

    async fn acknowledge(&self, position: Position) -> Result<()> {
        let client = self.client().await?;
        if let Some(confirmed) = self.confirmed_flush(&client).await? {
            if position <= confirmed {
                return Ok(());
            }
        }
        client
            .execute(
                "SELECT pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&self.slot, &position.to_lsn()],
            )
            .await
            .map_err(|e| source_error("Failed to advance replication slot", e))?;
        tracing::debug!("Advanced slot {} to {}", self.slot, position);
        Ok(())
    }

    async fn publish(&self, table: &TableId) -> Result<()> {
        self.publication
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.with_default_schema(crate::config::DEFAULT_SCHEMA));
        Ok(())
    }

    async fn unpublish(&self, table: &TableId) -> Result<()> {
        if !self.table_exists(table).await? {
            tracing::info!(
                "Skipping removal of table {} from publication, because table does not exist in PostgreSQL",
                table
            );
        }
        self.publication
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&table.with_default_schema(crate::config::DEFAULT_SCHEMA));
        Ok(())
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableId>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT tablename FROM pg_tables WHERE schemaname = $1 ORDER BY tablename",
                &[&schema],
            )
            .await
            .map_err(|e| source_error(&format!("Failed to list tables in schema {}", schema), e))?;

        Ok(rows
            .iter()
            .map(|row| TableId::new(schema, row.get::<_, String>(0)))
            .collect())
    }

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema> {
        let client = self.client().await?;
        read_table_schema(client.as_ref(), table).await
    }

    async fn table_exists(&self, table: &TableId) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = $2)",
                &[&schema_of(table), &table.name],
            )
            .await
            .map_err(|e| source_error("Failed to check table existence", e))?;
        Ok(row.get(0))
    }

    async fn snapshot(&self, table: &TableId) -> Result<TableSnapshot> {
        let mut client = connect(&self.params).await.map_err(connect_error)?;
        if !self.table_exists(table).await? {
            return Err(SyncError::SourceTableMissing {
                table: table.to_string(),
            });
        }
        if !can_select(&client, schema_of(table), &table.name)
            .await
            .map_err(query_error)?
        {
            return Err(SyncError::SchemaMismatch {
                table: table.to_string(),
                reason: "missing SELECT privilege".to_string(),
            });
        }
        // Read before the snapshot starts: every commit at or below this position is
        // visible to it. Commits landing in between are replayed over the baseline.
        let lsn: String = client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await
            .map_err(|e| source_error("Failed to read current WAL position", e))?
            .get(0);
        let position =
            Position::from_lsn(&lsn).map_err(|e| SyncError::SourceUnavailable(format!("{:#}", e)))?;

        let tx = client
            .build_transaction()
            .isolation_level(IsolationLevel::RepeatableRead)
            .read_only(true)
            .start()
            .await
            .map_err(|e| source_error("Failed to start snapshot transaction", e))?;

        let schema = read_table_schema(&tx, table).await?;
        if !schema.has_primary_key() {
            return Err(SyncError::SchemaMismatch {
                table: table.to_string(),
                reason: "table has no primary key".to_string(),
            });
        }

        let select_list: Vec<String> = schema
            .columns
            .iter()
            .map(|c| {
                let cast = match ValueKind::of(&c.type_name) {
                    ValueKind::Int => "int8",
                    ValueKind::Float => "float8",
                    ValueKind::Bool => "bool",
                    ValueKind::Bytes => "bytea",
                    ValueKind::Text => "text",
                };
                format!("{}::{}", quote_ident(&c.name), cast)
            })
            .collect();
        let order_by: Vec<String> = schema.primary_key.iter().map(|c| quote_ident(c)).collect();
        let query = format!(
            "SELECT {} FROM {}.{} ORDER BY {}",
            select_list.join(", "),
            quote_ident(schema_of(table)),
            quote_ident(&table.name),
            order_by.join(", ")
        );

        let pg_rows = tx.query(&query, &[]).await.map_err(|e| {
            if is_undefined_table(&e) {
                SyncError::SourceTableMissing {
                    table: table.to_string(),
                }
            } else {
                source_error(&format!("Failed to read snapshot of {}", table), e)
            }
        })?;
        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in &pg_rows {
            rows.push(snapshot_row(pg_row, &schema.columns)?);
        }

        tx.commit()
            .await
            .map_err(|e| source_error("Failed to finish snapshot transaction", e))?;

        tracing::info!(
            "Snapshot of {} read {} rows at {}",
            table,
            rows.len(),
            position
        );
        Ok(TableSnapshot {
            position,
            schema,
            rows,
        })
    }

    async fn drop_stream(&self) -> Result<()> {
        let client = self.client().await?;
        client
            .execute(
                "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot],
            )
            .await
            .map_err(|e| source_error("Failed to drop replication slot", e))?;
        tracing::info!("Dropped replication slot: {}", self.slot);
        Ok(())
    }
}

/// Columns (rendered with `format_type`, matching wal2json) and primary key of a table.
async fn read_table_schema<C>(client: &C, table: &TableId) -> Result<TableSchema>
where
    C: tokio_postgres::GenericClient + Sync,
{
    let schema = schema_of(table);
    let rows = client
        .query(
            "SELECT a.attname, format_type(a.atttypid, a.atttypmod), NOT a.attnotnull
             FROM pg_attribute a
             JOIN pg_class c ON c.oid = a.attrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE n.nspname = $1 AND c.relname = $2 AND a.attnum > 0 AND NOT a.attisdropped
             ORDER BY a.attnum",
            &[&schema, &table.name],
        )
        .await
        .map_err(|e| source_error(&format!("Failed to get columns for {}", table), e))?;

    if rows.is_empty() {
        return Err(SyncError::SourceTableMissing {
            table: table.to_string(),
        });
    }

    let columns = rows
        .iter()
        .map(|row| ColumnDef::new(row.get::<_, String>(0), row.get::<_, String>(1), row.get(2)))
        .collect();

    let pk_rows = client
        .query(
            "SELECT a.attname
             FROM pg_index i
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey)
             JOIN pg_class c ON c.oid = i.indrelid
             JOIN pg_namespace n ON n.oid = c.relnamespace
             WHERE i.indisprimary
               AND n.nspname = $1
               AND c.relname = $2
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&schema, &table.name],
        )
        .await
        .map_err(|e| source_error(&format!("Failed to get primary key for {}", table), e))?;

    Ok(TableSchema::new(
        columns,
        pk_rows.iter().map(|row| row.get(0)).collect(),
    ))
}

fn snapshot_row(pg_row: &tokio_postgres::Row, columns: &[ColumnDef]) -> Result<Row> {
    let mut fields = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        let value = match ValueKind::of(&column.type_name) {
            ValueKind::Int => pg_row.try_get::<_, Option<i64>>(idx).map(Value::from),
            ValueKind::Float => pg_row.try_get::<_, Option<f64>>(idx).map(Value::from),
            ValueKind::Bool => pg_row.try_get::<_, Option<bool>>(idx).map(Value::from),
            ValueKind::Bytes => pg_row.try_get::<_, Option<Vec<u8>>>(idx).map(Value::from),
            ValueKind::Text => pg_row.try_get::<_, Option<String>>(idx).map(Value::from),
        }
        .map_err(|e| source_error(&format!("Failed to decode column {}", column.name), e))?;
        fields.push(Field::new(&column.name, &column.type_name, value));
    }
    Ok(Row::new(fields))
}

struct PgStream {
    client: Client,
    slot: String,
    publication: Arc<RwLock<BTreeSet<TableId>>>,
    cursor: Position,
    buffer: VecDeque<StreamItem>,
    poll_interval: Duration,
}

impl PgStream {
    /// Peek at the slot and queue every complete transaction after the cursor.
    async fn fetch(&mut self) -> Result<()> {
        let tables = {
            let publication = self.publication.read().unwrap_or_else(PoisonError::into_inner);
            add_tables_filter(&publication)
        };
        let Some(tables) = tables else {
            return Ok(());
        };

        let rows = self
            .client
            .query(
                "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
                 'format-version', '2', 'include-pk', '1', 'include-lsn', '1', \
                 'include-transaction', '1', 'add-tables', $3)",
                &[&self.slot, &PEEK_LIMIT, &tables],
            )
            .await
            .map_err(|e| source_error("Failed to get changes from replication slot", e))?;

        let mut assembler = TransactionAssembler::default();
        for row in rows {
            let lsn: String = row.get(0);
            let data: String = row.get(1);
            let record: Wal2JsonRecord = match serde_json::from_str(&data) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!("Failed to parse wal2json data at {}: {}", lsn, e);
                    continue;
                }
            };
            let row_position = Position::from_lsn(&lsn)
                .map_err(|e| SyncError::SourceUnavailable(format!("{:#}", e)))?;
            if let Some((position, items)) = assembler.push(record, row_position) {
                if position > self.cursor {
                    self.cursor = position;
                    self.buffer.extend(items);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeStream for PgStream {
    async fn next(&mut self) -> Result<StreamItem> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Ok(item);
            }
            if self.client.is_closed() {
                return Err(SyncError::SourceUnavailable(
                    "replication connection closed".to_string(),
                ));
            }
            self.fetch().await?;
            if self.buffer.is_empty() {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }
}

/// Value of wal2json's `add-tables` option; `None` when nothing is published.
fn add_tables_filter(publication: &BTreeSet<TableId>) -> Option<String> {
    if publication.is_empty() {
        return None;
    }
    let escape = |s: &str| {
        let mut out = String::with_capacity(s.len());
        for ch in s.chars() {
            if matches!(ch, ' ' | '\'' | ',' | '.' | '*' | '\\') {
                out.push('\\');
            }
            out.push(ch);
        }
        out
    };
    Some(
        publication
            .iter()
            .map(|id| format!("{}.{}", escape(schema_of(id)), escape(&id.name)))
            .collect::<Vec<_>>()
            .join(","),
    )
}

#[derive(Debug, Deserialize)]
struct Wal2JsonRecord {
    action: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Vec<Wal2JsonColumn>,
    #[serde(default)]
    identity: Vec<Wal2JsonColumn>,
    #[serde(default)]
    nextlsn: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Wal2JsonColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    #[serde(default)]
    value: serde_json::Value,
}

impl Wal2JsonColumn {
    fn into_field(self) -> Field {
        let value = json_to_value(&self.type_name, self.value);
        Field::new(self.name, self.type_name, value)
    }
}

fn json_to_value(type_name: &str, json: serde_json::Value) -> Value {
    use serde_json::Value as Json;
    match (ValueKind::of(type_name), json) {
        (_, Json::Null) => Value::Null,
        (ValueKind::Int, Json::Number(n)) => n
            .as_i64()
            .map(Value::Int)
            .unwrap_or_else(|| Value::Text(n.to_string())),
        (ValueKind::Float, Json::Number(n)) => n
            .as_f64()
            .map(Value::Float)
            .unwrap_or_else(|| Value::Text(n.to_string())),
        (ValueKind::Float, Json::String(s)) => s
            .parse::<f64>()
            .map(Value::Float)
            .unwrap_or(Value::Text(s)),
        (ValueKind::Bool, Json::Bool(b)) => Value::Bool(b),
        (ValueKind::Bytes, Json::String(s)) => match decode_bytea_hex(&s) {
            Some(bytes) => Value::Bytes(bytes),
            None => Value::Text(s),
        },
        (_, Json::String(s)) => Value::Text(s),
        (_, other) => Value::Text(other.to_string()),
    }
}

/// Decode PostgreSQL's hex `bytea` output (`\x0a0b`).
fn decode_bytea_hex(s: &str) -> Option<Vec<u8>> {
    let hex = s.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Groups wal2json records into transactions that share their commit position.
#[derive(Default)]
struct TransactionAssembler {
    changes: Vec<(TableId, ChangeKind)>,
}

impl TransactionAssembler {
    /// Feed one record; returns the finished transaction on commit.
    fn push(
        &mut self,
        record: Wal2JsonRecord,
        row_position: Position,
    ) -> Option<(Position, Vec<StreamItem>)> {
        match record.action.as_str() {
            "B" => {
                self.changes.clear();
                None
            }
            "C" => {
                let position = record
                    .nextlsn
                    .as_deref()
                    .and_then(|lsn| Position::from_lsn(lsn).ok())
                    .unwrap_or(row_position);
                let mut items: Vec<StreamItem> = self
                    .changes
                    .drain(..)
                    .map(|(table, kind)| {
                        StreamItem::Change(ChangeEvent::new(table, position, kind))
                    })
                    .collect();
                items.push(StreamItem::EndOfBatch(position));
                Some((position, items))
            }
            "I" | "U" | "D" => {
                let table = TableId::new(
                    record.schema.clone().unwrap_or_default(),
                    record.table.clone().unwrap_or_default(),
                );
                let columns = Row::new(
                    record
                        .columns
                        .into_iter()
                        .map(Wal2JsonColumn::into_field)
                        .collect(),
                );
                let identity: Vec<Field> = record
                    .identity
                    .into_iter()
                    .map(Wal2JsonColumn::into_field)
                    .collect();
                let kind = match record.action.as_str() {
                    "I" => ChangeKind::Insert { row: columns },
                    "U" => ChangeKind::Update {
                        row: columns,
                        old_key: if identity.is_empty() {
                            None
                        } else {
                            Some(Row::new(identity))
                        },
                    },
                    _ => ChangeKind::Delete {
                        key: Row::new(identity),
                    },
                };
                self.changes.push((table, kind));
                None
            }
            "T" => {
                tracing::warn!(
                    "Ignoring TRUNCATE of {}.{}: not replicated",
                    record.schema.unwrap_or_default(),
                    record.table.unwrap_or_default()
                );
                None
            }
            _ => None,
        }
    }
}
