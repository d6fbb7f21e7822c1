// ABOUTME: Integration tests for the SQLite managed-table storage
// ABOUTME: Verifies durability across reopen and all-or-nothing commits

use database_mirror::source::{Row, Value};
use database_mirror::storage::{CommitBatch, RowOp, SqliteStorage, TableData, TargetStorage};
use database_mirror::{ColumnDef, TableSchema};
use tempfile::TempDir;

fn line_items_schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnDef::new("order_id", "int8", false),
            ColumnDef::new("line", "int4", false),
            ColumnDef::new("sku", "text", true),
            ColumnDef::new("paid", "bool", true),
            ColumnDef::new("blob", "bytea", true),
        ],
        vec!["order_id".to_string(), "line".to_string()],
    )
}

fn line(order_id: i64, number: i64, sku: &str) -> Row {
    Row::from_values(
        &line_items_schema().columns,
        vec![
            Value::Int(order_id),
            Value::Int(number),
            sku.into(),
            Value::Bool(number % 2 == 0),
            Value::Bytes(vec![order_id as u8, number as u8]),
        ],
    )
}

fn key(order_id: i64, number: i64) -> Row {
    line(order_id, number, "")
        .project(&["order_id".to_string(), "line".to_string()])
        .unwrap()
}

fn baseline(rows: Vec<Row>, checkpoint: &str) -> CommitBatch {
    CommitBatch {
        replace_tables: vec![TableData {
            name: "line_items".to_string(),
            schema: line_items_schema(),
            rows,
        }],
        checkpoint: checkpoint.to_string(),
        ..CommitBatch::default()
    }
}

fn changes(operations: Vec<RowOp>, checkpoint: &str) -> CommitBatch {
    let mut batch = CommitBatch {
        operations,
        checkpoint: checkpoint.to_string(),
        ..CommitBatch::default()
    };
    batch
        .schemas
        .insert("line_items".to_string(), line_items_schema());
    batch
}

#[tokio::test]
async fn test_commits_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("mirror.db");

    {
        let storage = SqliteStorage::open(&path).unwrap();
        assert_eq!(storage.path(), Some(path.as_path()));
        storage
            .commit(baseline(vec![line(2, 1, "b"), line(1, 2, "a2"), line(1, 1, "a1")], "cp-1"))
            .await
            .unwrap();
        storage
            .commit(changes(
                vec![
                    RowOp::Upsert {
                        table: "line_items".to_string(),
                        row: line(1, 2, "a2-updated"),
                    },
                    RowOp::Delete {
                        table: "line_items".to_string(),
                        key: key(2, 1),
                    },
                    RowOp::Upsert {
                        table: "line_items".to_string(),
                        row: line(3, 1, "c"),
                    },
                ],
                "cp-2",
            ))
            .await
            .unwrap();
    }

    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.load_checkpoint().await.unwrap().as_deref(), Some("cp-2"));
    assert_eq!(storage.table_names().await.unwrap(), vec!["line_items"]);

    let rows = storage.read_rows("line_items").await.unwrap();
    assert_eq!(
        rows,
        vec![line(1, 1, "a1"), line(1, 2, "a2-updated"), line(3, 1, "c")]
    );
}

#[tokio::test]
async fn test_failed_batch_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let storage = SqliteStorage::open(dir.path().join("mirror.db")).unwrap();
    storage
        .commit(baseline(vec![line(1, 1, "a")], "cp-1"))
        .await
        .unwrap();

    // The second operation targets a table that does not exist
    let bad = changes(
        vec![
            RowOp::Upsert {
                table: "line_items".to_string(),
                row: line(9, 9, "should not land"),
            },
            RowOp::Upsert {
                table: "missing".to_string(),
                row: line(1, 1, "x"),
            },
        ],
        "cp-bad",
    );
    assert!(storage.commit(bad).await.is_err());

    assert_eq!(storage.load_checkpoint().await.unwrap().as_deref(), Some("cp-1"));
    assert_eq!(storage.row_count("line_items").await.unwrap(), 1);

    // A failed baseline keeps the previous copy of the table
    let mut broken = baseline(vec![line(5, 5, "new")], "cp-bad");
    broken.operations.push(RowOp::Delete {
        table: "missing".to_string(),
        key: key(5, 5),
    });
    assert!(storage.commit(broken).await.is_err());
    assert_eq!(
        storage.read_rows("line_items").await.unwrap(),
        vec![line(1, 1, "a")]
    );
}

#[tokio::test]
async fn test_drop_and_destroy() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
        .commit(baseline(vec![line(1, 1, "a")], "cp-1"))
        .await
        .unwrap();
    let mut other = baseline(Vec::new(), "cp-2");
    other.replace_tables[0].name = "archive".to_string();
    storage.commit(other).await.unwrap();
    assert_eq!(
        storage.table_names().await.unwrap(),
        vec!["archive", "line_items"]
    );
    assert_eq!(storage.row_count("archive").await.unwrap(), 0);

    storage
        .commit(CommitBatch {
            drop_tables: vec!["line_items".to_string()],
            checkpoint: "cp-3".to_string(),
            ..CommitBatch::default()
        })
        .await
        .unwrap();
    assert_eq!(storage.table_names().await.unwrap(), vec!["archive"]);
    assert!(storage.row_count("line_items").await.is_err());

    storage.destroy().await.unwrap();
    assert!(storage.table_names().await.unwrap().is_empty());
    assert!(storage.load_checkpoint().await.unwrap().is_none());
}
