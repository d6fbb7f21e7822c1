// ABOUTME: Recovery tests - rebuilding databases from their persisted checkpoint
// ABOUTME: Covers missing and corrupt checkpoints, and identical contents across restarts

use database_mirror::checkpoint::Checkpoint;
use database_mirror::source::{MemorySource, Row, Value};
use database_mirror::storage::{MemoryStorage, SqliteStorage, TargetStorage};
use database_mirror::{
    ColumnDef, ConnectionParams, Settings, SyncDatabase, SyncError, TableId, TableSchema,
    TableState,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::{sleep, Instant};

fn schema() -> TableSchema {
    TableSchema::new(
        vec![
            ColumnDef::new("id", "int8", false),
            ColumnDef::new("name", "text", true),
            ColumnDef::new("score", "float8", true),
        ],
        vec!["id".to_string()],
    )
}

fn settings() -> Settings {
    Settings::from_pairs([
        ("flush_interval_ms", "20"),
        ("backoff_initial_ms", "10"),
        ("backoff_max_ms", "100"),
    ])
    .unwrap()
}

fn descriptor() -> database_mirror::ConnectionDescriptor {
    ConnectionParams::from_url("postgresql://mirror@localhost/shop")
        .unwrap()
        .descriptor(None)
}

fn seeded_source() -> MemorySource {
    let source = MemorySource::new();
    for name in ["accounts", "payments"] {
        let id = TableId::new("public", name);
        source.create_table(&id, schema()).unwrap();
        for i in 0..25 {
            source
                .insert(
                    &id,
                    vec![Value::Int(i), format!("{}-{}", name, i).into(), Value::Float(i as f64 / 2.0)],
                )
                .unwrap();
        }
    }
    source
}

async fn contents(storage: &dyn TargetStorage, tables: &[&str]) -> BTreeMap<String, Vec<Row>> {
    let mut out = BTreeMap::new();
    for table in tables {
        out.insert(table.to_string(), storage.read_rows(table).await.unwrap());
    }
    out
}

async fn wait_for_commit(database: &SyncDatabase, target: database_mirror::Position) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while database.status().await.committed_position < target {
        assert!(Instant::now() < deadline, "position {} never committed", target);
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_recover_without_checkpoint_fails() {
    let source = MemorySource::new();
    let storage = MemoryStorage::new();
    let err = SyncDatabase::recover("mirror", Arc::new(source), Arc::new(storage))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::RecoveryFailed(_)));
    assert!(err.to_string().contains("no checkpoint found"));
}

#[tokio::test]
async fn test_recover_rejects_corrupt_checkpoint() {
    let source = seeded_source();
    let storage = MemoryStorage::new();
    SyncDatabase::create(
        "mirror",
        settings(),
        descriptor(),
        Arc::new(source.clone()),
        Arc::new(storage.clone()),
    )
    .await
    .unwrap();
    let raw = storage.load_checkpoint().await.unwrap().unwrap();

    storage.set_raw_checkpoint(Some("{not json".to_string()));
    let err = SyncDatabase::recover("mirror", Arc::new(source.clone()), Arc::new(storage.clone()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, SyncError::RecoveryFailed(_)));

    // Editing the payload without fixing the checksum is detected
    storage.set_raw_checkpoint(Some(raw.replace("accounts", "accountz")));
    let err = SyncDatabase::recover("mirror", Arc::new(source.clone()), Arc::new(storage.clone()))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("checksum mismatch"), "{}", err);

    // A checkpoint written by another database is refused
    storage.set_raw_checkpoint(Some(raw.clone()));
    let err = SyncDatabase::recover("other", Arc::new(source.clone()), Arc::new(storage.clone()))
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("belongs to database mirror"), "{}", err);

    storage.set_raw_checkpoint(Some(raw));
    let recovered = SyncDatabase::recover("mirror", Arc::new(source), Arc::new(storage))
        .await
        .unwrap();
    assert_eq!(recovered.show_tables().await, vec!["accounts", "payments"]);
}

#[tokio::test]
async fn test_restart_preserves_contents_and_positions() {
    let source = seeded_source();
    let storage = MemoryStorage::new();
    let database = SyncDatabase::create(
        "mirror",
        settings(),
        descriptor(),
        Arc::new(source.clone()),
        Arc::new(storage.clone()),
    )
    .await
    .unwrap();

    let handle = database.start();
    let accounts = TableId::new("public", "accounts");
    source
        .update(&accounts, vec![Value::Int(3), "changed".into(), Value::Null])
        .unwrap();
    let last = source.delete(&accounts, vec![Value::Int(4)]).unwrap();
    wait_for_commit(&database, last).await;
    handle.shutdown().await.unwrap();

    let before = contents(&storage, &["accounts", "payments"]).await;
    let status_before = database.status().await;

    let recovered = SyncDatabase::recover("mirror", Arc::new(source.clone()), Arc::new(storage.clone()))
        .await
        .unwrap();
    let status_after = recovered.status().await;
    assert_eq!(status_after.committed_position, status_before.committed_position);
    assert_eq!(status_after.tables.len(), status_before.tables.len());
    for (a, b) in status_after.tables.iter().zip(status_before.tables.iter()) {
        assert_eq!(a.local_name, b.local_name);
        assert_eq!(a.state, b.state);
        assert_eq!(a.last_applied_position, b.last_applied_position);
    }

    // Nothing new at the source: a restart changes nothing
    let handle = recovered.start();
    sleep(Duration::from_millis(100)).await;
    handle.shutdown().await.unwrap();
    assert_eq!(contents(&storage, &["accounts", "payments"]).await, before);
    assert_eq!(before["accounts"].len(), 24);
}

#[tokio::test]
async fn test_sqlite_database_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("mirror.db");
    let source = seeded_source();

    {
        let storage = Arc::new(SqliteStorage::open(&path).unwrap());
        let database = SyncDatabase::create(
            "mirror",
            settings(),
            descriptor(),
            Arc::new(source.clone()),
            storage,
        )
        .await
        .unwrap();
        let handle = database.start();
        let last = source
            .insert(
                &TableId::new("public", "payments"),
                vec![Value::Int(100), "late".into(), Value::Float(1.5)],
            )
            .unwrap();
        wait_for_commit(&database, last).await;
        handle.shutdown().await.unwrap();
    }

    let storage = Arc::new(SqliteStorage::open(&path).unwrap());
    let before = contents(storage.as_ref(), &["accounts", "payments"]).await;
    assert_eq!(before["payments"].len(), 26);
    assert_eq!(
        before["payments"].last().unwrap().get("score"),
        Some(&Value::Float(1.5))
    );

    let recovered = SyncDatabase::recover("mirror", Arc::new(source.clone()), storage.clone())
        .await
        .unwrap();
    let status = recovered.status().await;
    assert!(status
        .tables
        .iter()
        .all(|t| t.state == TableState::Syncing));

    let handle = recovered.start();
    let last = source
        .delete(&TableId::new("public", "accounts"), vec![Value::Int(0)])
        .unwrap();
    wait_for_commit(&recovered, last).await;
    handle.shutdown().await.unwrap();
    assert_eq!(storage.row_count("accounts").await.unwrap(), 24);
    assert_eq!(
        contents(storage.as_ref(), &["payments"]).await["payments"],
        before["payments"]
    );
}

#[tokio::test]
async fn test_interrupted_snapshot_is_retried_after_restart() {
    let source = seeded_source();
    let storage = MemoryStorage::new();
    SyncDatabase::create(
        "mirror",
        settings(),
        descriptor(),
        Arc::new(source.clone()),
        Arc::new(storage.clone()),
    )
    .await
    .unwrap();

    // Simulate a crash while the baseline of `payments` was being copied
    let raw = storage.load_checkpoint().await.unwrap().unwrap();
    let mut checkpoint = Checkpoint::decode("mirror", &raw).unwrap();
    for table in checkpoint.tables.iter_mut() {
        if table.local_name == "payments" {
            table.state = TableState::Snapshotting;
            table.schema = None;
        }
    }
    storage.set_raw_checkpoint(Some(checkpoint.encode().unwrap()));

    let payments = TableId::new("public", "payments");
    source.delete(&payments, vec![Value::Int(0)]).unwrap();

    let database = SyncDatabase::recover("mirror", Arc::new(source.clone()), Arc::new(storage.clone()))
        .await
        .unwrap();
    let status = database.status().await;
    let state = status
        .tables
        .iter()
        .find(|t| t.local_name == "payments")
        .map(|t| t.state);
    assert_eq!(state, Some(TableState::Initializing));

    let handle = database.start();
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let status = database.status().await;
        if status
            .tables
            .iter()
            .all(|t| t.state == TableState::Syncing)
        {
            break;
        }
        assert!(Instant::now() < deadline, "baseline was never reloaded");
        sleep(Duration::from_millis(20)).await;
    }
    let last = source
        .insert(&payments, vec![Value::Int(500), "new".into(), Value::Null])
        .unwrap();
    wait_for_commit(&database, last).await;
    handle.shutdown().await.unwrap();

    assert_eq!(storage.row_count("payments").await.unwrap(), 25);
    assert_eq!(
        storage.row_count("payments").await.unwrap(),
        source.row_count(&payments) as u64
    );
}
