// ABOUTME: SyncDatabase - the aggregate root and its control-plane commands
// ABOUTME: create, recover, start, attach, detach, settings, inspection and drop

use crate::apply::ApplyEngine;
use crate::checkpoint::Checkpoint;
use crate::config::{render_create, ConnectionDescriptor, Settings};
use crate::error::{Result, SyncError};
use crate::position::Position;
use crate::registry::TableRegistry;
use crate::snapshot::{layout_drift, SnapshotLoader, SnapshotRequest};
use crate::source::{ChangeEvent, ChangeSource, TableSnapshot};
use crate::storage::{CommitBatch, TableData, TargetStorage};
use crate::table::{TableId, TableSchema, TableState, TrackedTable};
use crate::utils::{validate_identifier, Backoff};
use crate::worker::SyncWorker;
use futures::StreamExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::JoinHandle;

/// Everything guarded by the database lock.
#[derive(Debug, Clone)]
pub(crate) struct DatabaseState {
    pub(crate) registry: TableRegistry,
    pub(crate) settings: Settings,
    pub(crate) connection: ConnectionDescriptor,
    pub(crate) committed_position: Position,
    pub(crate) acknowledged_position: Position,
    /// Events held for tables still waiting for their baseline, by local name.
    pub(crate) pending: BTreeMap<String, Vec<ChangeEvent>>,
    /// Snapshot in flight per local name; a result with a stale ticket is dropped.
    snapshot_tickets: BTreeMap<String, u64>,
    next_ticket: u64,
    created_at: chrono::DateTime<chrono::Utc>,
    pub(crate) dropped: bool,
}

impl DatabaseState {
    fn from_checkpoint(checkpoint: Checkpoint, registry: TableRegistry) -> Self {
        Self {
            registry,
            settings: checkpoint.settings,
            connection: checkpoint.connection,
            committed_position: checkpoint.committed_position,
            acknowledged_position: checkpoint.acknowledged_position,
            pending: BTreeMap::new(),
            snapshot_tickets: BTreeMap::new(),
            next_ticket: 0,
            created_at: checkpoint.created_at,
            dropped: false,
        }
    }

    pub(crate) fn checkpoint(&self, name: &str) -> Checkpoint {
        let mut checkpoint = Checkpoint::new(
            name,
            self.connection.clone(),
            self.settings.clone(),
            self.committed_position,
        );
        checkpoint.acknowledged_position = self.acknowledged_position;
        checkpoint.created_at = self.created_at;
        checkpoint.set_tables(&self.registry);
        checkpoint
    }

    fn refresh_tables_list(&mut self) {
        let names = self.registry.visible();
        self.settings.refresh_tables_list(names);
    }

    fn invalidate_snapshot(&mut self, local_name: &str) {
        self.snapshot_tickets.remove(local_name);
        self.pending.remove(local_name);
    }
}

/// Per-table line of [`DatabaseStatus`].
#[derive(Debug, Clone, Serialize)]
pub struct TableStatus {
    pub local_name: String,
    pub source: String,
    pub state: TableState,
    pub last_applied_position: Position,
    pub quarantine_reason: Option<String>,
}

/// Administrative view of one database.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStatus {
    pub name: String,
    pub committed_position: Position,
    pub acknowledged_position: Position,
    pub tables: Vec<TableStatus>,
}

struct Inner {
    name: String,
    source: Arc<dyn ChangeSource>,
    storage: Arc<dyn TargetStorage>,
    state: Mutex<DatabaseState>,
    shutdown: StdMutex<Option<broadcast::Sender<()>>>,
}

/// A mirror database: tracked tables, their local copies and the stream feeding them.
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct SyncDatabase {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncDatabase")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

/// Running worker of a database. Dropping the handle does not stop it.
pub struct SyncHandle {
    shutdown: broadcast::Sender<()>,
    worker: JoinHandle<Result<()>>,
    baselines: JoinHandle<()>,
}

impl SyncHandle {
    /// Stop the worker and wait for it. An uncommitted buffer is abandoned.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        if let Err(e) = self.baselines.await {
            tracing::warn!("Baseline task ended abnormally: {}", e);
        }
        match self.worker.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::storage(anyhow::anyhow!("sync worker panicked: {}", e))),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Wait for the worker to end on its own (fatal error or drop).
    pub async fn join(self) -> Result<()> {
        let _ = self.baselines.await;
        match self.worker.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::storage(anyhow::anyhow!("sync worker panicked: {}", e))),
        }
    }
}

impl SyncDatabase {
    fn from_state(
        name: &str,
        source: Arc<dyn ChangeSource>,
        storage: Arc<dyn TargetStorage>,
        state: DatabaseState,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                source,
                storage,
                state: Mutex::new(state),
                shutdown: StdMutex::new(None),
            }),
        }
    }

    /// Create a new database, track its initial tables and load their baselines.
    pub async fn create(
        name: &str,
        settings: Settings,
        connection: ConnectionDescriptor,
        source: Arc<dyn ChangeSource>,
        storage: Arc<dyn TargetStorage>,
    ) -> Result<Self> {
        validate_identifier(name).map_err(|e| SyncError::invalid(e.to_string()))?;
        settings.validate()?;

        if storage
            .load_checkpoint()
            .await
            .map_err(SyncError::storage)?
            .is_some()
        {
            return Err(SyncError::AlreadyExists(format!("Database {}", name)));
        }

        let start = source.init_stream().await?;
        tracing::info!("Replication stream for {} starts at position {}", name, start);

        let tables = match settings.explicit_tables() {
            Some(tables) => {
                for table in &tables {
                    if !source.table_exists(table).await? {
                        return Err(SyncError::SourceTableMissing {
                            table: table.to_string(),
                        });
                    }
                }
                tables
            }
            None => {
                let schemas = match &settings.schema_list {
                    Some(list) => list.clone(),
                    None => vec![settings.default_schema().to_string()],
                };
                let mut tables = Vec::new();
                for schema in &schemas {
                    tables.extend(source.list_tables(schema).await?);
                }
                tables
            }
        };

        let mut registry = TableRegistry::new();
        for table in tables {
            let local_name = settings.local_name(&table);
            registry.track(TrackedTable::new(table, local_name))?;
        }
        for table in registry.publication() {
            source.publish(&table).await?;
        }

        let now = chrono::Utc::now();
        let state = DatabaseState {
            registry,
            settings,
            connection,
            committed_position: start,
            acknowledged_position: start,
            pending: BTreeMap::new(),
            snapshot_tickets: BTreeMap::new(),
            next_ticket: 0,
            created_at: now,
            dropped: false,
        };
        let checkpoint = state.checkpoint(name).encode()?;
        storage
            .commit(CommitBatch::checkpoint_only(checkpoint))
            .await
            .map_err(SyncError::storage)?;

        let database = Self::from_state(name, source, storage, state);
        let locals: Vec<String> = {
            let state = database.lock().await;
            state.registry.list().map(|t| t.local_name.clone()).collect()
        };
        tracing::info!("Created database {} with {} tables", name, locals.len());

        for (local_name, result) in database.snapshot_tables(locals).await {
            if let Err(e) = result {
                tracing::warn!("Initial snapshot of {} failed: {}", local_name, e);
            }
        }
        Ok(database)
    }

    /// Rebuild a database from its last committed checkpoint.
    pub async fn recover(
        name: &str,
        source: Arc<dyn ChangeSource>,
        storage: Arc<dyn TargetStorage>,
    ) -> Result<Self> {
        let raw = storage
            .load_checkpoint()
            .await
            .map_err(|e| SyncError::RecoveryFailed(format!("database {}: {:#}", name, e)))?
            .ok_or_else(|| {
                SyncError::RecoveryFailed(format!("database {}: no checkpoint found", name))
            })?;
        let mut checkpoint = Checkpoint::decode(name, &raw)?;

        let tables = std::mem::take(&mut checkpoint.tables);
        let mut registry = TableRegistry::from_tables(tables)
            .map_err(|e| SyncError::RecoveryFailed(format!("database {}: {}", name, e)))?;
        for table in registry.list_mut() {
            if table.state == TableState::Snapshotting {
                table.reset();
            }
        }

        for table in registry.publication() {
            source.publish(&table).await?;
        }

        tracing::info!(
            "Recovered database {} at position {} with {} tables",
            name,
            checkpoint.committed_position,
            registry.len()
        );
        let state = DatabaseState::from_checkpoint(checkpoint, registry);
        Ok(Self::from_state(name, source, storage, state))
    }

    /// Spawn the sync worker and the baseline loader for tables still without one.
    pub fn start(&self) -> SyncHandle {
        let (shutdown, worker_rx) = broadcast::channel(1);
        let baseline_rx = shutdown.subscribe();
        *self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(shutdown.clone());

        let worker = SyncWorker::new(self.clone());
        let worker = tokio::spawn(async move { worker.run(worker_rx).await });

        let database = self.clone();
        let baselines = tokio::spawn(async move { database.load_missing_baselines(baseline_rx).await });

        SyncHandle {
            shutdown,
            worker,
            baselines,
        }
    }

    /// Stop the worker, remove every local table and the replication slot.
    pub async fn drop_database(&self) -> Result<()> {
        if let Some(shutdown) = self
            .inner
            .shutdown
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = shutdown.send(());
        }

        {
            let mut state = self.lock().await;
            state.dropped = true;
            self.inner
                .storage
                .destroy()
                .await
                .map_err(SyncError::storage)?;
        }
        self.inner.source.drop_stream().await?;
        tracing::info!("Dropped database {}", self.inner.name);
        Ok(())
    }

    /// Start mirroring one more source table.
    pub async fn attach_table(&self, name: &str) -> Result<()> {
        let table = {
            let state = self.lock().await;
            let table = state.settings.resolve_table(name);
            self.ensure_not_attached(&state, &table)?;
            table
        };

        if !self.inner.source.table_exists(&table).await? {
            return Err(SyncError::SourceTableMissing {
                table: name.to_string(),
            });
        }

        let local_name = {
            let mut state = self.lock().await;
            self.ensure_not_attached(&state, &table)?;
            let backup = state.clone();
            let local_name = state.settings.local_name(&table);
            match state.registry.lookup_mut(&local_name) {
                Some(existing) => existing.reset(),
                None => state
                    .registry
                    .track(TrackedTable::new(table.clone(), local_name.clone()))?,
            }
            state.invalidate_snapshot(&local_name);
            state.refresh_tables_list();

            if let Err(e) = self.inner.source.publish(&table).await {
                *state = backup;
                return Err(e);
            }
            if let Err(e) = self.persist(&mut state, backup, CommitBatch::default()).await {
                self.restore_publication(&table, false).await;
                return Err(e);
            }
            local_name
        };

        tracing::info!("Attached table {} to database {}", local_name, self.inner.name);

        for (snapshotted, result) in self.snapshot_tables(vec![local_name.clone()]).await {
            if let Err(e) = result {
                if e.is_transient() {
                    self.quarantine(&snapshotted, &e.to_string()).await?;
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn ensure_not_attached(&self, state: &DatabaseState, table: &TableId) -> Result<()> {
        let local_name = state.settings.local_name(table);
        match state.registry.lookup(&local_name) {
            Some(existing) if existing.is_visible() => Err(SyncError::AlreadyExists(format!(
                "Table {}.{}",
                self.inner.name, local_name
            ))),
            _ => Ok(()),
        }
    }

    /// Stop mirroring a table. With `permanently` its local copy is dropped too.
    pub async fn detach_table(&self, name: &str, permanently: bool) -> Result<()> {
        let mut state = self.lock().await;
        let table = state.settings.resolve_table(name);
        let local_name = state.settings.local_name(&table);
        let (table, published) = match state.registry.lookup(&local_name) {
            None => {
                tracing::info!(
                    "Table {} is not attached to database {}, nothing to detach",
                    local_name,
                    self.inner.name
                );
                return Ok(());
            }
            Some(existing) if !existing.is_visible() && !permanently => {
                tracing::info!("Table {} is already detached", local_name);
                return Ok(());
            }
            Some(existing) => (existing.id.clone(), existing.is_visible()),
        };

        let backup = state.clone();
        let mut batch = CommitBatch::default();
        if permanently {
            state.registry.untrack(&local_name)?;
            batch.drop_tables.push(local_name.clone());
        } else if let Some(existing) = state.registry.lookup_mut(&local_name) {
            existing.detach();
        }
        state.invalidate_snapshot(&local_name);
        state.refresh_tables_list();

        if published {
            if let Err(e) = self.inner.source.unpublish(&table).await {
                *state = backup;
                return Err(e);
            }
        }
        if let Err(e) = self.persist(&mut state, backup, batch).await {
            if published {
                self.restore_publication(&table, true).await;
            }
            return Err(e);
        }

        if permanently {
            tracing::info!(
                "Permanently detached table {} from database {}",
                local_name,
                self.inner.name
            );
        } else {
            tracing::info!("Detached table {} from database {}", local_name, self.inner.name);
        }
        Ok(())
    }

    /// Put the publication of `table` back after the registry change failed to commit.
    async fn restore_publication(&self, table: &TableId, published: bool) {
        let restored = if published {
            self.inner.source.publish(table).await
        } else {
            self.inner.source.unpublish(table).await
        };
        if let Err(e) = restored {
            tracing::warn!("Failed to restore publication of {}: {}", table, e);
        }
    }

    /// Change a tunable setting; structural settings are fixed after creation.
    pub async fn modify_setting(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.lock().await;
        let backup = state.clone();
        state.settings.set_tunable(key, value)?;
        self.persist(&mut state, backup, CommitBatch::default()).await?;
        tracing::info!("Database {}: set {} = {}", self.inner.name, key, value);
        Ok(())
    }

    /// Non-detached local table names in lexicographic order.
    pub async fn show_tables(&self) -> Vec<String> {
        self.lock().await.registry.visible()
    }

    /// `CREATE DATABASE` statement recreating this database, without credentials.
    pub async fn show_create(&self) -> String {
        let state = self.lock().await;
        render_create(&self.inner.name, &state.connection, &state.settings)
    }

    pub async fn status(&self) -> DatabaseStatus {
        let state = self.lock().await;
        DatabaseStatus {
            name: self.inner.name.clone(),
            committed_position: state.committed_position,
            acknowledged_position: state.acknowledged_position,
            tables: state
                .registry
                .list()
                .map(|t| TableStatus {
                    local_name: t.local_name.clone(),
                    source: t.id.to_string(),
                    state: t.state,
                    last_applied_position: t.last_applied_position,
                    quarantine_reason: t.quarantine_reason.clone(),
                })
                .collect(),
        }
    }

    pub async fn settings(&self) -> Settings {
        self.lock().await.settings.clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn storage(&self) -> &Arc<dyn TargetStorage> {
        &self.inner.storage
    }

    pub(crate) fn source(&self) -> &Arc<dyn ChangeSource> {
        &self.inner.source
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, DatabaseState> {
        self.inner.state.lock().await
    }

    /// Commit `batch` with a checkpoint of the current state, or restore `backup`.
    pub(crate) async fn persist(
        &self,
        state: &mut DatabaseState,
        backup: DatabaseState,
        mut batch: CommitBatch,
    ) -> Result<()> {
        if state.dropped {
            *state = backup;
            return Err(SyncError::storage(anyhow::anyhow!(
                "database {} has been dropped",
                self.inner.name
            )));
        }
        batch.checkpoint = match state.checkpoint(&self.inner.name).encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                *state = backup;
                return Err(e);
            }
        };
        if let Err(e) = self.inner.storage.commit(batch).await {
            *state = backup;
            return Err(SyncError::storage(e));
        }
        Ok(())
    }

    async fn quarantine(&self, local_name: &str, reason: &str) -> Result<()> {
        let mut state = self.lock().await;
        let backup = state.clone();
        match state.registry.lookup_mut(local_name) {
            Some(table) if table.is_visible() => table.quarantine(reason),
            _ => return Ok(()),
        }
        state.invalidate_snapshot(local_name);
        tracing::warn!("Table {} is skipped from replication: {}", local_name, reason);
        self.persist(&mut state, backup, CommitBatch::default()).await
    }

    /// Quarantine synced tables whose source layout no longer matches their baseline.
    pub(crate) async fn verify_layouts(&self) -> Result<()> {
        let synced: Vec<(String, TableId, TableSchema)> = {
            let state = self.lock().await;
            state
                .registry
                .list()
                .filter(|t| t.state == TableState::Syncing)
                .filter_map(|t| Some((t.local_name.clone(), t.id.clone(), t.schema.clone()?)))
                .collect()
        };

        for (local_name, table, recorded) in synced {
            let reason = match layout_drift(self.inner.source.as_ref(), &table, &recorded).await {
                Ok(None) => continue,
                Ok(Some(difference)) => format!("source layout changed: {}", difference),
                Err(e) if e.is_table_scoped() => e.to_string(),
                Err(e) => return Err(e),
            };

            let mut state = self.lock().await;
            let unchanged = state
                .registry
                .lookup(&local_name)
                .map(|t| t.state == TableState::Syncing && t.schema.as_ref() == Some(&recorded))
                .unwrap_or(false);
            if !unchanged {
                continue;
            }
            let backup = state.clone();
            if let Some(tracked) = state.registry.lookup_mut(&local_name) {
                tracked.quarantine(reason.clone());
            }
            tracing::warn!("Table {} is skipped from replication: {}", local_name, reason);
            self.persist(&mut state, backup, CommitBatch::default()).await?;
        }
        Ok(())
    }

    /// Snapshot every listed table that is still `Initializing`.
    ///
    /// Baselines are committed one by one as they finish. Table-scoped failures
    /// quarantine the table; transient failures leave it `Initializing`.
    pub(crate) async fn snapshot_tables(&self, locals: Vec<String>) -> Vec<(String, Result<()>)> {
        let (requests, concurrency) = {
            let mut state = self.lock().await;
            let mut requests = Vec::new();
            for local_name in locals {
                let ticket = state.next_ticket;
                let Some(table) = state.registry.lookup_mut(&local_name) else {
                    continue;
                };
                if table.state != TableState::Initializing {
                    continue;
                }
                table.begin_snapshot();
                let request = SnapshotRequest {
                    local_name: local_name.clone(),
                    table: table.id.clone(),
                    ticket,
                };
                state.next_ticket += 1;
                state.snapshot_tickets.insert(local_name, ticket);
                requests.push(request);
            }
            (requests, state.settings.snapshot_concurrency)
        };

        let loader = SnapshotLoader::new(Arc::clone(&self.inner.source), concurrency);
        let mut results = Vec::new();
        let mut snapshots = loader.load_many(requests);
        while let Some((request, result)) = snapshots.next().await {
            let outcome = self.finish_snapshot(&request, result).await;
            results.push((request.local_name, outcome));
        }
        results
    }

    async fn finish_snapshot(
        &self,
        request: &SnapshotRequest,
        result: Result<TableSnapshot>,
    ) -> Result<()> {
        let mut state = self.lock().await;
        let local_name = request.local_name.as_str();
        let current = state.snapshot_tickets.get(local_name) == Some(&request.ticket)
            && state
                .registry
                .lookup(local_name)
                .map(|t| t.state == TableState::Snapshotting)
                .unwrap_or(false);
        if !current {
            tracing::debug!("Discarding stale snapshot of {}", local_name);
            return Ok(());
        }
        state.snapshot_tickets.remove(local_name);

        let snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(e) if e.is_table_scoped() => {
                let backup = state.clone();
                if let Some(table) = state.registry.lookup_mut(local_name) {
                    table.quarantine(e.to_string());
                }
                state.pending.remove(local_name);
                tracing::warn!("Table {} is skipped from replication: {}", local_name, e);
                if let Err(commit_err) = self.persist(&mut state, backup, CommitBatch::default()).await {
                    tracing::error!("Failed to record quarantine of {}: {}", local_name, commit_err);
                }
                return Err(e);
            }
            Err(e) => {
                if let Some(table) = state.registry.lookup_mut(local_name) {
                    table.state = TableState::Initializing;
                }
                return Err(e);
            }
        };

        let backup = state.clone();
        let rows = snapshot.rows.len();
        let schema = snapshot.schema.clone();
        if let Some(table) = state.registry.lookup_mut(local_name) {
            table.finish_snapshot(snapshot.schema, snapshot.position);
        }

        let plan = {
            let state = &mut *state;
            let mut engine = ApplyEngine::new(&mut state.registry, &mut state.pending);
            engine.replay_pending(local_name);
            engine.finish()
        };

        let batch = CommitBatch {
            replace_tables: vec![TableData {
                name: local_name.to_string(),
                schema,
                rows: snapshot.rows,
            }],
            schemas: plan.schemas,
            operations: plan.operations,
            ..CommitBatch::default()
        };
        if let Err(e) = self.persist(&mut state, backup, batch).await {
            if let Some(table) = state.registry.lookup_mut(local_name) {
                table.state = TableState::Initializing;
            }
            tracing::error!("Failed to commit baseline of {}: {}", local_name, e);
            return Err(e);
        }

        tracing::info!(
            "Table {} synced: {} rows at position {}, {} deferred changes replayed",
            local_name,
            rows,
            snapshot.position,
            plan.stats.applied
        );
        Ok(())
    }

    /// Load baselines for tables left `Initializing`, retrying transient failures.
    async fn load_missing_baselines(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut backoff = {
            let state = self.lock().await;
            Backoff::new(
                Duration::from_millis(state.settings.backoff_initial_ms),
                Duration::from_millis(state.settings.backoff_max_ms),
            )
        };

        loop {
            let waiting: Vec<String> = {
                let state = self.lock().await;
                if state.dropped {
                    return;
                }
                state
                    .registry
                    .list()
                    .filter(|t| t.state == TableState::Initializing)
                    .map(|t| t.local_name.clone())
                    .collect()
            };
            if waiting.is_empty() {
                return;
            }

            let results = self.snapshot_tables(waiting).await;
            if !results
                .iter()
                .any(|(_, r)| matches!(r, Err(e) if e.is_transient()))
            {
                return;
            }

            let delay = backoff.next_delay();
            tracing::warn!(
                "Retrying baseline snapshots of database {} in {:?}",
                self.inner.name,
                delay
            );
            tokio::select! {
                biased;
                _ = shutdown.recv() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
