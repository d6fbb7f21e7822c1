// ABOUTME: Snapshot loader - consistent bulk copies of tracked tables
// ABOUTME: Checks mirrored layouts against the source and runs several copies concurrently

use crate::error::{Result, SyncError};
use crate::source::{ChangeSource, TableSnapshot};
use crate::table::{TableId, TableSchema};
use futures::stream::{self, Stream, StreamExt};
use std::sync::Arc;

/// One table to copy: its local name and source identity.
#[derive(Debug, Clone)]
pub struct SnapshotRequest {
    pub local_name: String,
    pub table: TableId,
    /// Opaque token handed back with the result
    pub ticket: u64,
}

#[derive(Clone)]
pub struct SnapshotLoader {
    source: Arc<dyn ChangeSource>,
    concurrency: usize,
}

impl SnapshotLoader {
    pub fn new(source: Arc<dyn ChangeSource>, concurrency: usize) -> Self {
        Self {
            source,
            concurrency: concurrency.max(1),
        }
    }

    /// Copy one table and check that it can be mirrored.
    pub async fn load(&self, table: &TableId) -> Result<TableSnapshot> {
        tracing::info!("Snapshotting table {}", table);
        let snapshot = self.source.snapshot(table).await?;

        if !snapshot.schema.has_primary_key() {
            return Err(SyncError::SchemaMismatch {
                table: table.to_string(),
                reason: "table has no primary key".to_string(),
            });
        }

        tracing::info!(
            "Snapshot of {} holds {} rows at position {}",
            table,
            snapshot.rows.len(),
            snapshot.position
        );
        Ok(snapshot)
    }

    /// Copy several tables, at most `concurrency` at a time, yielding results as they finish.
    pub fn load_many(
        &self,
        requests: Vec<SnapshotRequest>,
    ) -> impl Stream<Item = (SnapshotRequest, Result<TableSnapshot>)> + Send + '_ {
        stream::iter(requests)
            .map(move |request| async move {
                let result = self.load(&request.table).await;
                (request, result)
            })
            .buffer_unordered(self.concurrency)
    }
}

/// Compare the live source layout of `table` with the one its baseline recorded.
///
/// Returns the difference, if any. Columns renamed or retyped while no stream was
/// open are never announced on it.
pub async fn layout_drift(
    source: &dyn ChangeSource,
    table: &TableId,
    recorded: &TableSchema,
) -> Result<Option<String>> {
    let live = source.table_schema(table).await?;
    let declared = live
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.type_name.as_str()));
    if let Some(reason) = recorded.shape_difference(declared) {
        return Ok(Some(reason));
    }
    if live.primary_key != recorded.primary_key {
        return Ok(Some(format!(
            "primary key is ({}), expected ({})",
            live.primary_key.join(", "),
            recorded.primary_key.join(", ")
        )));
    }
    Ok(None)
}
