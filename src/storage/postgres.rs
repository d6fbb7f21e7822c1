// ABOUTME: PostgreSQL-backed managed tables living in one target schema
// ABOUTME: Batches upserts with INSERT ... ON CONFLICT DO UPDATE inside one transaction per commit

use super::{CommitBatch, RowOp, TableData, TargetStorage};
use crate::config::ConnectionParams;
use crate::source::{Row, Value, ValueKind};
use crate::table::TableSchema;
use crate::utils::quote_ident;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, Transaction};

/// PostgreSQL allows at most 65535 bind parameters per statement.
const MAX_PARAMS: usize = 65000;

type Param = Box<dyn ToSql + Sync + Send>;

fn column_type(type_name: &str) -> &'static str {
    match ValueKind::of(type_name) {
        ValueKind::Int => "bigint",
        ValueKind::Float => "double precision",
        ValueKind::Bool => "boolean",
        ValueKind::Bytes => "bytea",
        ValueKind::Text => "text",
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
    }
}

/// Convert a value into a bind parameter typed for its target column.
fn to_param(kind: ValueKind, value: &Value) -> Param {
    match (kind, value) {
        (ValueKind::Int, Value::Null) => Box::new(None::<i64>),
        (ValueKind::Float, Value::Null) => Box::new(None::<f64>),
        (ValueKind::Bool, Value::Null) => Box::new(None::<bool>),
        (ValueKind::Bytes, Value::Null) => Box::new(None::<Vec<u8>>),
        (ValueKind::Text, Value::Null) => Box::new(None::<String>),
        (ValueKind::Int, Value::Int(i)) => Box::new(*i),
        (ValueKind::Int, Value::Float(f)) => Box::new(*f as i64),
        (ValueKind::Int, Value::Bool(b)) => Box::new(i64::from(*b)),
        (ValueKind::Float, Value::Float(f)) => Box::new(*f),
        (ValueKind::Float, Value::Int(i)) => Box::new(*i as f64),
        (ValueKind::Bool, Value::Bool(b)) => Box::new(*b),
        (ValueKind::Bool, Value::Int(i)) => Box::new(*i != 0),
        (ValueKind::Bytes, Value::Bytes(b)) => Box::new(b.clone()),
        (ValueKind::Bytes, Value::Text(s)) => Box::new(s.as_bytes().to_vec()),
        (_, other) => Box::new(text_of(other)),
    }
}

fn row_params(row: &Row) -> Vec<Param> {
    row.fields()
        .iter()
        .map(|f| to_param(ValueKind::of(&f.type_name), &f.value))
        .collect()
}

/// Build an upsert query for the given table and batch size.
///
/// ```sql
/// INSERT INTO "schema"."table" ("col1", "col2")
/// VALUES ($1, $2), ($3, $4)
/// ON CONFLICT ("pk_col") DO UPDATE SET "col2" = EXCLUDED."col2"
/// ```
fn build_upsert_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    all_columns: &[String],
    num_rows: usize,
) -> String {
    let quoted_columns: Vec<String> = all_columns.iter().map(|c| quote_ident(c)).collect();
    let quoted_pk_columns: Vec<String> =
        primary_key_columns.iter().map(|c| quote_ident(c)).collect();

    let num_cols = all_columns.len();
    let value_rows: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_cols)
                .map(|col_idx| format!("${}", row_idx * num_cols + col_idx + 1))
                .collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();

    let update_columns: Vec<String> = all_columns
        .iter()
        .filter(|c| !primary_key_columns.contains(c))
        .map(|c| format!("{} = EXCLUDED.{}", quote_ident(c), quote_ident(c)))
        .collect();

    let update_clause = if update_columns.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", update_columns.join(", "))
    };

    format!(
        "INSERT INTO {}.{} ({}) VALUES {} ON CONFLICT ({}) {}",
        quote_ident(schema),
        quote_ident(table),
        quoted_columns.join(", "),
        value_rows.join(", "),
        quoted_pk_columns.join(", "),
        update_clause
    )
}

/// Build a delete query for multiple rows by primary key.
///
/// A composite key turns into `WHERE ("pk1", "pk2") IN (($1, $2), ($3, $4))`.
fn build_delete_query(
    schema: &str,
    table: &str,
    primary_key_columns: &[String],
    num_rows: usize,
) -> String {
    let num_pk_cols = primary_key_columns.len();
    let pk_cols: Vec<String> = primary_key_columns.iter().map(|c| quote_ident(c)).collect();

    let tuples: Vec<String> = (0..num_rows)
        .map(|row_idx| {
            let placeholders: Vec<String> = (0..num_pk_cols)
                .map(|col_idx| format!("${}", row_idx * num_pk_cols + col_idx + 1))
                .collect();
            if num_pk_cols == 1 {
                placeholders.join(", ")
            } else {
                format!("({})", placeholders.join(", "))
            }
        })
        .collect();

    let target = if num_pk_cols == 1 {
        pk_cols.join(", ")
    } else {
        format!("({})", pk_cols.join(", "))
    };

    format!(
        "DELETE FROM {}.{} WHERE {} IN ({})",
        quote_ident(schema),
        quote_ident(table),
        target,
        tuples.join(", ")
    )
}

fn key_of(row: &Row, primary_key: &[String]) -> Result<String> {
    let key = row
        .project(primary_key)
        .ok_or_else(|| anyhow!("row is missing primary key columns {:?}", primary_key))?;
    Ok(serde_json::to_string(&key.values().collect::<Vec<_>>())?)
}

/// Consecutive operations of one kind against one table.
enum Run<'a> {
    Upsert {
        table: &'a str,
        rows: Vec<&'a Row>,
        index: HashMap<String, usize>,
    },
    Delete {
        table: &'a str,
        keys: Vec<&'a Row>,
    },
}

/// Rows of one upsert statement must carry the same columns.
fn same_columns(a: &Row, b: &Row) -> bool {
    a.len() == b.len() && a.fields().iter().zip(b.fields()).all(|(x, y)| x.name == y.name)
}

/// Group operations into runs that can each be sent as batched statements.
///
/// An upsert run keeps only the last row per key, as one statement may not
/// touch a row twice. A row with a different column set starts a new run.
fn group_runs<'a>(
    operations: &'a [RowOp],
    schemas: &HashMap<&str, &'a TableSchema>,
) -> Result<Vec<Run<'a>>> {
    let mut runs: Vec<Run<'a>> = Vec::new();
    for op in operations {
        match op {
            RowOp::Upsert { table, row } => {
                let schema = schemas
                    .get(table.as_str())
                    .ok_or_else(|| anyhow!("no schema supplied for table {}", table))?;
                let key = key_of(row, &schema.primary_key)?;
                if let Some(Run::Upsert {
                    table: current,
                    rows,
                    index,
                }) = runs.last_mut()
                {
                    if *current == table.as_str() && same_columns(rows[0], row) {
                        match index.get(&key) {
                            Some(&at) => rows[at] = row,
                            None => {
                                index.insert(key, rows.len());
                                rows.push(row);
                            }
                        }
                        continue;
                    }
                }
                let mut index = HashMap::new();
                index.insert(key, 0);
                runs.push(Run::Upsert {
                    table,
                    rows: vec![row],
                    index,
                });
            }
            RowOp::Delete { table, key } => {
                if let Some(Run::Delete {
                    table: current,
                    keys,
                }) = runs.last_mut()
                {
                    if *current == table.as_str() {
                        keys.push(key);
                        continue;
                    }
                }
                runs.push(Run::Delete {
                    table,
                    keys: vec![key],
                });
            }
        }
    }
    Ok(runs)
}

/// Managed tables stored in a schema of a PostgreSQL database.
pub struct PostgresStorage {
    client: Mutex<Client>,
    schema: String,
}

impl PostgresStorage {
    pub async fn connect(params: &ConnectionParams, schema: &str) -> Result<Self> {
        let client = crate::postgres::connect_with_retry(params).await?;
        Self::new(client, schema).await
    }

    pub async fn new(client: Client, schema: &str) -> Result<Self> {
        crate::utils::validate_identifier(schema)?;
        let ddl = format!(
            "CREATE SCHEMA IF NOT EXISTS {schema};
             CREATE TABLE IF NOT EXISTS {schema}._mirror_checkpoint (
                 id integer PRIMARY KEY CHECK (id = 1),
                 payload text NOT NULL,
                 updated_at timestamptz NOT NULL DEFAULT now()
             );
             CREATE TABLE IF NOT EXISTS {schema}._mirror_schemas (
                 table_name text PRIMARY KEY,
                 schema text NOT NULL
             );",
            schema = quote_ident(schema)
        );
        client
            .batch_execute(&ddl)
            .await
            .with_context(|| format!("Failed to initialize target schema {}", schema))?;
        Ok(Self {
            client: Mutex::new(client),
            schema: schema.to_string(),
        })
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    async fn drop_table(&self, tx: &Transaction<'_>, name: &str) -> Result<()> {
        tx.batch_execute(&format!("DROP TABLE IF EXISTS {}", self.qualified(name)))
            .await
            .with_context(|| format!("Failed to drop table {}", name))?;
        tx.execute(
            &format!(
                "DELETE FROM {}._mirror_schemas WHERE table_name = $1",
                quote_ident(&self.schema)
            ),
            &[&name],
        )
        .await?;
        Ok(())
    }

    async fn replace_table(&self, tx: &Transaction<'_>, table: &TableData) -> Result<()> {
        self.drop_table(tx, &table.name).await?;

        let mut definitions: Vec<String> = table
            .schema
            .columns
            .iter()
            .map(|c| format!("{} {}", quote_ident(&c.name), column_type(&c.type_name)))
            .collect();
        let pk: Vec<String> = table
            .schema
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect();
        definitions.push(format!("PRIMARY KEY ({})", pk.join(", ")));
        tx.batch_execute(&format!(
            "CREATE TABLE {} ({})",
            self.qualified(&table.name),
            definitions.join(", ")
        ))
        .await
        .with_context(|| format!("Failed to create table {}", table.name))?;

        let schema_json = serde_json::to_string(&table.schema)?;
        tx.execute(
            &format!(
                "INSERT INTO {}._mirror_schemas(table_name, schema) VALUES ($1, $2)",
                quote_ident(&self.schema)
            ),
            &[&table.name, &schema_json],
        )
        .await?;

        let rows: Vec<&Row> = table.rows.iter().collect();
        self.upsert_rows(tx, &table.name, &table.schema.primary_key, &rows)
            .await
    }

    async fn upsert_rows(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        primary_key: &[String],
        rows: &[&Row],
    ) -> Result<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let columns: Vec<String> = first.fields().iter().map(|f| f.name.clone()).collect();
        let batch_size = std::cmp::max(1, MAX_PARAMS / columns.len().max(1));

        for chunk in rows.chunks(batch_size) {
            let query =
                build_upsert_query(&self.schema, table, primary_key, &columns, chunk.len());
            let owned: Vec<Param> = chunk.iter().flat_map(|row| row_params(row)).collect();
            let params: Vec<&(dyn ToSql + Sync)> = owned
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(&query, &params)
                .await
                .with_context(|| format!("Failed to upsert batch into {}", table))?;
        }
        Ok(())
    }

    async fn delete_rows(
        &self,
        tx: &Transaction<'_>,
        table: &str,
        primary_key: &[String],
        keys: &[&Row],
    ) -> Result<()> {
        let batch_size = std::cmp::max(1, MAX_PARAMS / primary_key.len().max(1));
        for chunk in keys.chunks(batch_size) {
            let query = build_delete_query(&self.schema, table, primary_key, chunk.len());
            let mut owned: Vec<Param> = Vec::new();
            for key in chunk {
                let projected = key
                    .project(primary_key)
                    .ok_or_else(|| anyhow!("delete key for {} misses primary key columns", table))?;
                owned.extend(row_params(&projected));
            }
            let params: Vec<&(dyn ToSql + Sync)> = owned
                .iter()
                .map(|v| v.as_ref() as &(dyn ToSql + Sync))
                .collect();
            tx.execute(&query, &params)
                .await
                .with_context(|| format!("Failed to delete rows from {}", table))?;
        }
        Ok(())
    }

    async fn load_schema(&self, client: &Client, table: &str) -> Result<TableSchema> {
        let row = client
            .query_opt(
                &format!(
                    "SELECT schema FROM {}._mirror_schemas WHERE table_name = $1",
                    quote_ident(&self.schema)
                ),
                &[&table],
            )
            .await?
            .ok_or_else(|| anyhow!("table {} does not exist", table))?;
        let json: String = row.get(0);
        serde_json::from_str(&json).context("corrupt stored table schema")
    }
}

#[async_trait]
impl TargetStorage for PostgresStorage {
    async fn commit(&self, batch: CommitBatch) -> Result<()> {
        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .context("Failed to begin target transaction")?;

        for name in &batch.drop_tables {
            self.drop_table(&tx, name).await?;
        }
        for table in &batch.replace_tables {
            self.replace_table(&tx, table).await?;
        }

        let mut schemas: HashMap<&str, &TableSchema> = batch
            .replace_tables
            .iter()
            .map(|t| (t.name.as_str(), &t.schema))
            .collect();
        schemas.extend(batch.schemas.iter().map(|(k, v)| (k.as_str(), v)));

        for run in group_runs(&batch.operations, &schemas)? {
            match run {
                Run::Upsert { table, rows, .. } => {
                    let pk = &schemas
                        .get(table)
                        .ok_or_else(|| anyhow!("no schema supplied for table {}", table))?
                        .primary_key;
                    self.upsert_rows(&tx, table, pk, &rows).await?;
                }
                Run::Delete { table, keys } => {
                    let pk = &schemas
                        .get(table)
                        .ok_or_else(|| anyhow!("no schema supplied for table {}", table))?
                        .primary_key;
                    self.delete_rows(&tx, table, pk, &keys).await?;
                }
            }
        }

        tx.execute(
            &format!(
                "INSERT INTO {}._mirror_checkpoint(id, payload) VALUES (1, $1)
                 ON CONFLICT (id) DO UPDATE SET payload = EXCLUDED.payload, updated_at = now()",
                quote_ident(&self.schema)
            ),
            &[&batch.checkpoint],
        )
        .await
        .context("Failed to write checkpoint")?;

        tx.commit()
            .await
            .context("Failed to commit target transaction")?;
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<String>> {
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT payload FROM {}._mirror_checkpoint WHERE id = 1",
                    quote_ident(&self.schema)
                ),
                &[],
            )
            .await
            .context("Failed to read checkpoint")?;
        Ok(row.map(|r| r.get(0)))
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let client = self.client.lock().await;
        let row = client
            .query_one(
                &format!("SELECT COUNT(*)::bigint FROM {}", self.qualified(table)),
                &[],
            )
            .await
            .with_context(|| format!("Failed to count rows of {}", table))?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn read_rows(&self, table: &str) -> Result<Vec<Row>> {
        let client = self.client.lock().await;
        let schema = self.load_schema(&client, table).await?;
        let columns: Vec<String> = schema.columns.iter().map(|c| quote_ident(&c.name)).collect();
        let order: Vec<String> = schema.primary_key.iter().map(|c| quote_ident(c)).collect();
        let query = format!(
            "SELECT {} FROM {} ORDER BY {}",
            columns.join(", "),
            self.qualified(table),
            order.join(", ")
        );
        let rows = client
            .query(&query, &[])
            .await
            .with_context(|| format!("Failed to read rows of {}", table))?;

        let mut out = Vec::with_capacity(rows.len());
        for pg_row in &rows {
            let mut values = Vec::with_capacity(schema.columns.len());
            for (idx, column) in schema.columns.iter().enumerate() {
                let value = match ValueKind::of(&column.type_name) {
                    ValueKind::Int => Value::from(pg_row.try_get::<_, Option<i64>>(idx)?),
                    ValueKind::Float => Value::from(pg_row.try_get::<_, Option<f64>>(idx)?),
                    ValueKind::Bool => Value::from(pg_row.try_get::<_, Option<bool>>(idx)?),
                    ValueKind::Bytes => Value::from(pg_row.try_get::<_, Option<Vec<u8>>>(idx)?),
                    ValueKind::Text => Value::from(pg_row.try_get::<_, Option<String>>(idx)?),
                };
                values.push(value);
            }
            out.push(Row::from_values(&schema.columns, values));
        }
        Ok(out)
    }

    async fn destroy(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(&format!(
                "DROP SCHEMA IF EXISTS {} CASCADE",
                quote_ident(&self.schema)
            ))
            .await
            .with_context(|| format!("Failed to drop target schema {}", self.schema))?;
        Ok(())
    }
}
