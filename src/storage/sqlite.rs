// ABOUTME: SQLite-backed managed tables with the checkpoint in the same database file
// ABOUTME: Each CommitBatch runs as one SQLite transaction on a blocking thread

use super::{CommitBatch, RowOp, TableData, TargetStorage};
use crate::source::{Row, Value, ValueKind};
use crate::table::TableSchema;
use crate::utils::quote_ident;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Transaction};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS _mirror_checkpoint (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    payload     TEXT NOT NULL,
    updated_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS _mirror_schemas (
    table_name  TEXT PRIMARY KEY,
    schema      TEXT NOT NULL
);
"#;

fn column_affinity(type_name: &str) -> &'static str {
    match ValueKind::of(type_name) {
        ValueKind::Bool | ValueKind::Int => "INTEGER",
        ValueKind::Float => "REAL",
        ValueKind::Bytes => "BLOB",
        ValueKind::Text => "TEXT",
    }
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Float(f) => SqlValue::Real(*f),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn from_sql(kind: ValueKind, value: ValueRef<'_>) -> Value {
    match (kind, value) {
        (_, ValueRef::Null) => Value::Null,
        (ValueKind::Bool, ValueRef::Integer(i)) => Value::Bool(i != 0),
        (ValueKind::Float, ValueRef::Integer(i)) => Value::Float(i as f64),
        (_, ValueRef::Integer(i)) => Value::Int(i),
        (_, ValueRef::Real(f)) => Value::Float(f),
        (ValueKind::Bytes, ValueRef::Text(b)) | (_, ValueRef::Blob(b)) => Value::Bytes(b.to_vec()),
        (_, ValueRef::Text(t)) => Value::Text(String::from_utf8_lossy(t).into_owned()),
    }
}

fn create_table_sql(name: &str, schema: &TableSchema) -> String {
    let mut definitions: Vec<String> = schema
        .columns
        .iter()
        .map(|c| format!("{} {}", quote_ident(&c.name), column_affinity(&c.type_name)))
        .collect();
    let pk: Vec<String> = schema.primary_key.iter().map(|c| quote_ident(c)).collect();
    definitions.push(format!("PRIMARY KEY ({})", pk.join(", ")));
    format!("CREATE TABLE {} ({})", quote_ident(name), definitions.join(", "))
}

/// Insert `row`, or overwrite the columns it carries when the key already exists.
/// Columns the row leaves out keep their stored values.
fn upsert_sql(name: &str, primary_key: &[String], row: &Row) -> String {
    let columns: Vec<String> = row.fields().iter().map(|f| quote_ident(&f.name)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{}", i)).collect();
    let pk: Vec<String> = primary_key.iter().map(|c| quote_ident(c)).collect();
    let updates: Vec<String> = row
        .fields()
        .iter()
        .filter(|f| !primary_key.contains(&f.name))
        .map(|f| format!("{0} = excluded.{0}", quote_ident(&f.name)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
        quote_ident(name),
        columns.join(", "),
        placeholders.join(", "),
        pk.join(", "),
        action
    )
}

fn delete_sql(name: &str, key: &Row) -> String {
    let predicates: Vec<String> = key
        .fields()
        .iter()
        .enumerate()
        .map(|(i, f)| format!("{} = ?{}", quote_ident(&f.name), i + 1))
        .collect();
    format!(
        "DELETE FROM {} WHERE {}",
        quote_ident(name),
        predicates.join(" AND ")
    )
}

fn load_schema(conn: &Connection, table: &str) -> Result<Option<TableSchema>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT schema FROM _mirror_schemas WHERE table_name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    raw.map(|json| serde_json::from_str(&json).context("corrupt stored table schema"))
        .transpose()
}

fn drop_table(tx: &Transaction<'_>, name: &str) -> Result<()> {
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
    tx.execute("DELETE FROM _mirror_schemas WHERE table_name = ?1", [name])?;
    Ok(())
}

fn replace_table(tx: &Transaction<'_>, table: &TableData) -> Result<()> {
    drop_table(tx, &table.name)?;
    tx.execute_batch(&create_table_sql(&table.name, &table.schema))
        .with_context(|| format!("failed to create table {}", table.name))?;
    tx.execute(
        "INSERT INTO _mirror_schemas(table_name, schema) VALUES (?1, ?2)",
        params![table.name, serde_json::to_string(&table.schema)?],
    )?;

    if let Some(first) = table.rows.first() {
        let mut stmt = tx.prepare(&upsert_sql(&table.name, &table.schema.primary_key, first))?;
        for row in &table.rows {
            stmt.execute(params_from_iter(row.values().map(to_sql)))?;
        }
    }
    Ok(())
}

fn apply_op(tx: &Transaction<'_>, schemas: &BTreeMap<String, TableSchema>, op: &RowOp) -> Result<()> {
    match op {
        RowOp::Upsert { table, row } => {
            let primary_key = match schemas.get(table) {
                Some(schema) => schema.primary_key.clone(),
                None => {
                    load_schema(tx, table)?
                        .ok_or_else(|| anyhow!("table {} does not exist", table))?
                        .primary_key
                }
            };
            let mut stmt = tx.prepare_cached(&upsert_sql(table, &primary_key, row))?;
            stmt.execute(params_from_iter(row.values().map(to_sql)))
                .with_context(|| format!("failed to upsert into {}", table))?;
        }
        RowOp::Delete { table, key } => {
            let mut stmt = tx.prepare_cached(&delete_sql(table, key))?;
            stmt.execute(params_from_iter(key.values().map(to_sql)))
                .with_context(|| format!("failed to delete from {}", table))?;
        }
    }
    Ok(())
}

fn commit_blocking(conn: &mut Connection, batch: CommitBatch) -> Result<()> {
    let tx = conn.transaction()?;
    for name in &batch.drop_tables {
        drop_table(&tx, name)?;
    }
    for table in &batch.replace_tables {
        replace_table(&tx, table)?;
    }
    for op in &batch.operations {
        apply_op(&tx, &batch.schemas, op)?;
    }
    tx.execute(
        "INSERT INTO _mirror_checkpoint(id, payload) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, updated_at = CURRENT_TIMESTAMP",
        [&batch.checkpoint],
    )?;
    tx.commit().context("failed to commit SQLite transaction")?;
    Ok(())
}

/// Managed tables stored in one SQLite database file.
pub struct SqliteStorage {
    path: Option<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create storage directory {}", parent.display())
            })?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open storage database {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "wal")
            .context("failed to enable WAL for storage database")?;
        conn.pragma_update(None, "synchronous", "full")
            .context("failed to set synchronous mode for storage database")?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .context("failed to initialize storage schema")?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        })
        .await
        .context("SQLite worker thread panicked")?
    }

    /// Names of the managed tables currently stored.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT table_name FROM _mirror_schemas ORDER BY table_name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
        .await
    }
}

#[async_trait]
impl TargetStorage for SqliteStorage {
    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        self.with_conn(move |conn| commit_blocking(conn, batch)).await
    }

    async fn load_checkpoint(&self) -> Result<Option<String>> {
        self.with_conn(|conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM _mirror_checkpoint WHERE id = 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(payload)
        })
        .await
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {}", quote_ident(&table)),
                    [],
                    |row| row.get(0),
                )
                .with_context(|| format!("failed to count rows of {}", table))?;
            Ok(count as u64)
        })
        .await
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Row>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let schema = load_schema(conn, &table)?
                .ok_or_else(|| anyhow!("table {} does not exist", table))?;
            let columns: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();
            let order: Vec<String> = schema.primary_key.iter().map(|c| quote_ident(c)).collect();
            let kinds: Vec<ValueKind> = schema
                .columns
                .iter()
                .map(|c| ValueKind::of(&c.type_name))
                .collect();
            let sql = format!(
                "SELECT {} FROM {} ORDER BY {}",
                columns.join(", "),
                quote_ident(&table),
                order.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let mut values = Vec::with_capacity(kinds.len());
                for (i, kind) in kinds.iter().enumerate() {
                    values.push(from_sql(*kind, row.get_ref(i)?));
                }
                out.push(Row::from_values(&schema.columns, values));
            }
            Ok(out)
        })
        .await
    }

    async fn destroy(&self) -> Result<()> {
        self.with_conn(|conn| {
            let names: Vec<String> = {
                let mut stmt = conn.prepare("SELECT table_name FROM _mirror_schemas")?;
                let names = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                names
            };
            let tx = conn.transaction()?;
            for name in &names {
                drop_table(&tx, name)?;
            }
            tx.execute("DELETE FROM _mirror_checkpoint", [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::ColumnDef;

    fn schema() -> TableSchema {
        TableSchema::new(
            vec![
                ColumnDef::new("id", "int8", false),
                ColumnDef::new("active", "boolean", true),
                ColumnDef::new("score", "double precision", true),
                ColumnDef::new("payload", "bytea", true),
            ],
            vec!["id".to_string()],
        )
    }

    #[test]
    fn test_create_table_sql_uses_affinity() {
        let sql = create_table_sql("users", &schema());
        assert_eq!(
            sql,
            "CREATE TABLE \"users\" (\"id\" INTEGER, \"active\" INTEGER, \"score\" REAL, \"payload\" BLOB, PRIMARY KEY (\"id\"))"
        );
    }

    #[test]
    fn test_delete_sql_composite_key() {
        let key = Row::from_values(
            &[
                ColumnDef::new("order_id", "int8", false),
                ColumnDef::new("item_id", "int8", false),
            ],
            vec![Value::Int(1), Value::Int(2)],
        );
        assert_eq!(
            delete_sql("items", &key),
            "DELETE FROM \"items\" WHERE \"order_id\" = ?1 AND \"item_id\" = ?2"
        );
    }

    #[test]
    fn test_upsert_sql_only_overwrites_carried_columns() {
        let narrow = Row::new(vec![
            crate::source::Field::new("id", "int8", Value::Int(1)),
            crate::source::Field::new("score", "double precision", Value::Float(1.0)),
        ]);
        assert_eq!(
            upsert_sql("users", &["id".to_string()], &narrow),
            "INSERT INTO \"users\" (\"id\", \"score\") VALUES (?1, ?2) ON CONFLICT (\"id\") DO UPDATE SET \"score\" = excluded.\"score\""
        );

        let key_only = Row::new(vec![crate::source::Field::new("id", "int8", Value::Int(1))]);
        assert!(upsert_sql("users", &["id".to_string()], &key_only).ends_with("DO NOTHING"));
    }

    #[tokio::test]
    async fn test_narrow_upsert_keeps_stored_columns() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let full = Row::from_values(
            &schema().columns,
            vec![
                Value::Int(1),
                Value::Bool(true),
                Value::Float(2.5),
                Value::Bytes(vec![0xbe, 0xef]),
            ],
        );
        storage
            .commit(CommitBatch {
                replace_tables: vec![TableData {
                    name: "users".into(),
                    schema: schema(),
                    rows: vec![full],
                }],
                checkpoint: "cp1".into(),
                ..CommitBatch::default()
            })
            .await
            .unwrap();

        // No schema in the batch: the stored one supplies the key.
        let narrow = Row::new(vec![
            crate::source::Field::new("id", "int8", Value::Int(1)),
            crate::source::Field::new("active", "boolean", Value::Bool(false)),
        ]);
        storage
            .commit(CommitBatch {
                operations: vec![RowOp::Upsert {
                    table: "users".into(),
                    row: narrow,
                }],
                checkpoint: "cp2".into(),
                ..CommitBatch::default()
            })
            .await
            .unwrap();

        let expected = Row::from_values(
            &schema().columns,
            vec![
                Value::Int(1),
                Value::Bool(false),
                Value::Float(2.5),
                Value::Bytes(vec![0xbe, 0xef]),
            ],
        );
        assert_eq!(storage.read_rows("users").await.unwrap(), vec![expected]);
    }

    #[test]
    fn test_open_uses_durable_settings() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = SqliteStorage::open(dir.path().join("nested").join("mirror.db")).unwrap();
        let conn = storage.conn.lock().unwrap();
        let synchronous: i64 = conn
            .query_row("PRAGMA synchronous", [], |row| row.get(0))
            .unwrap();
        assert_eq!(synchronous, 2);
        let journal: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(journal, "wal");
    }

    #[tokio::test]
    async fn test_values_survive_storage() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let row = Row::from_values(
            &schema().columns,
            vec![
                Value::Int(1),
                Value::Bool(true),
                Value::Float(2.5),
                Value::Bytes(vec![0xde, 0xad]),
            ],
        );
        storage
            .commit(CommitBatch {
                replace_tables: vec![TableData {
                    name: "users".into(),
                    schema: schema(),
                    rows: vec![row.clone()],
                }],
                checkpoint: "cp".into(),
                ..CommitBatch::default()
            })
            .await
            .unwrap();

        assert_eq!(storage.read_rows("users").await.unwrap(), vec![row]);
        assert_eq!(storage.table_names().await.unwrap(), vec!["users".to_string()]);
        let conn = storage.conn.lock().unwrap();
        assert_eq!(load_schema(&conn, "users").unwrap(), Some(schema()));
    }
}
