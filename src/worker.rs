// ABOUTME: SyncWorker - consumes the change stream of one database
// ABOUTME: Buffers whole transactions, commits them with the checkpoint, then acknowledges the source

use crate::apply::ApplyEngine;
use crate::config::Settings;
use crate::database::SyncDatabase;
use crate::error::{Result, SyncError};
use crate::position::Position;
use crate::source::{ChangeStream, StreamItem};
use crate::storage::CommitBatch;
use crate::utils::Backoff;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, sleep_until, Instant};

/// Tunables the worker re-reads after every flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FlushPolicy {
    max_block_size: usize,
    flush_interval: Duration,
    backoff_initial: Duration,
    backoff_max: Duration,
}

impl From<&Settings> for FlushPolicy {
    fn from(settings: &Settings) -> Self {
        Self {
            max_block_size: settings.max_block_size,
            flush_interval: Duration::from_millis(settings.flush_interval_ms),
            backoff_initial: Duration::from_millis(settings.backoff_initial_ms),
            backoff_max: Duration::from_millis(settings.backoff_max_ms),
        }
    }
}

impl FlushPolicy {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max)
    }
}

/// Stream items received but not committed yet.
#[derive(Debug, Default)]
struct Buffer {
    items: Vec<StreamItem>,
    /// Change events in `items`
    changes: usize,
    /// Length of the prefix ending at the last end-of-batch marker, and its position
    boundary: Option<(usize, Position)>,
    /// Change events inside that prefix
    changes_at_boundary: usize,
    /// When the oldest unflushed item arrived
    started: Option<Instant>,
}

impl Buffer {
    /// Append an item; true when it closes a transaction.
    fn push(&mut self, item: StreamItem) -> bool {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        let closes = match &item {
            StreamItem::Change(_) => {
                self.changes += 1;
                false
            }
            StreamItem::EndOfBatch(position) => {
                self.boundary = Some((self.items.len() + 1, *position));
                self.changes_at_boundary = self.changes;
                true
            }
        };
        self.items.push(item);
        closes
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every complete transaction, returning it with its end position.
    fn take_complete(&mut self) -> Option<(Vec<StreamItem>, Position)> {
        let (end, position) = self.boundary.take()?;
        let rest = self.items.split_off(end);
        let complete = std::mem::replace(&mut self.items, rest);
        self.changes -= self.changes_at_boundary;
        self.changes_at_boundary = 0;
        self.started = if self.items.is_empty() {
            None
        } else {
            Some(Instant::now())
        };
        Some((complete, position))
    }
}

/// Stream consumer of one database.
pub struct SyncWorker {
    database: SyncDatabase,
}

impl SyncWorker {
    pub fn new(database: SyncDatabase) -> Self {
        Self { database }
    }

    /// Run until shutdown, reconnecting with backoff whenever the stream fails.
    ///
    /// Returns an error only when the source can no longer serve the committed position.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let name = self.database.name().to_string();
        let mut policy = FlushPolicy::from(&self.database.lock().await.settings);
        let mut backoff = policy.backoff();

        tracing::info!(
            "Starting sync worker for database {} (max_block_size={}, flush_interval={:?})",
            name,
            policy.max_block_size,
            policy.flush_interval
        );

        loop {
            match self.stream(&mut shutdown, &mut policy, &mut backoff).await {
                Ok(()) => break,
                Err(e @ SyncError::StreamGap { .. }) => {
                    tracing::error!("Sync worker for database {} cannot resume: {}", name, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    if e.is_transient() {
                        tracing::warn!(
                            "Stream of database {} interrupted: {}. Reconnecting in {:?} (attempt {})",
                            name,
                            e,
                            delay,
                            backoff.attempts()
                        );
                    } else {
                        tracing::error!(
                            "Sync cycle of database {} failed: {}. Retrying in {:?}",
                            name,
                            e,
                            delay
                        );
                    }
                    tokio::select! {
                        biased;
                        _ = shutdown.recv() => break,
                        _ = sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!("Sync worker for database {} stopped", name);
        Ok(())
    }

    /// Open the stream at the committed position and consume it until it fails.
    ///
    /// `Ok` means shutdown was requested.
    async fn stream(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
        policy: &mut FlushPolicy,
        backoff: &mut Backoff,
    ) -> Result<()> {
        let (from, acknowledged) = {
            let state = self.database.lock().await;
            if state.dropped {
                return Ok(());
            }
            (state.committed_position, state.acknowledged_position)
        };
        if from > acknowledged {
            self.acknowledge(from).await;
        }
        // Layout changes made while no stream was open are never announced on it.
        self.database.verify_layouts().await?;

        let mut stream: Box<dyn ChangeStream> = tokio::select! {
            biased;
            _ = shutdown.recv() => return Ok(()),
            opened = self.database.source().open(from) => opened?,
        };
        tracing::info!(
            "Streaming changes for database {} from position {}",
            self.database.name(),
            from
        );
        backoff.reset();

        let mut buffer = Buffer::default();
        loop {
            let deadline = buffer.started.map(|started| started + policy.flush_interval);
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    if !buffer.is_empty() {
                        tracing::debug!(
                            "Abandoning {} uncommitted stream items",
                            buffer.items.len()
                        );
                    }
                    return Ok(());
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if buffer.boundary.is_some() {
                        self.flush(&mut buffer, policy, backoff).await?;
                    } else {
                        buffer.started = Some(Instant::now());
                    }
                }
                item = stream.next() => {
                    if buffer.push(item?) && buffer.changes >= policy.max_block_size {
                        self.flush(&mut buffer, policy, backoff).await?;
                    }
                }
            }
        }
    }

    /// Commit every complete transaction in the buffer, then acknowledge it.
    async fn flush(
        &self,
        buffer: &mut Buffer,
        policy: &mut FlushPolicy,
        backoff: &mut Backoff,
    ) -> Result<()> {
        let Some((items, boundary)) = buffer.take_complete() else {
            return Ok(());
        };

        let (stats, operations) = {
            let mut state = self.database.lock().await;
            if state.dropped {
                return Ok(());
            }
            let backup = state.clone();
            let plan = {
                let state = &mut *state;
                let mut engine = ApplyEngine::new(&mut state.registry, &mut state.pending);
                for item in items {
                    if let StreamItem::Change(event) = item {
                        engine.apply(event);
                    }
                }
                engine.finish()
            };
            state.committed_position = state.committed_position.max(boundary);

            let operations = plan.operations.len();
            let batch = CommitBatch {
                schemas: plan.schemas,
                operations: plan.operations,
                ..CommitBatch::default()
            };
            self.database.persist(&mut state, backup, batch).await?;

            let refreshed = FlushPolicy::from(&state.settings);
            if refreshed != *policy {
                tracing::info!("Database {} picked up new settings", self.database.name());
                if refreshed.backoff_initial != policy.backoff_initial
                    || refreshed.backoff_max != policy.backoff_max
                {
                    *backoff = refreshed.backoff();
                }
                *policy = refreshed;
            }
            (plan.stats, operations)
        };

        tracing::debug!(
            "Database {} committed up to {}: {} operations ({} applied, {} skipped, {} deferred)",
            self.database.name(),
            boundary,
            operations,
            stats.applied,
            stats.skipped,
            stats.deferred
        );
        for (table, reason) in &stats.quarantined {
            tracing::debug!("Quarantined {} during flush: {}", table, reason);
        }

        self.acknowledge(boundary).await;
        Ok(())
    }

    /// Tell the source it may reclaim history up to `position`.
    ///
    /// A failure is only logged; the next stream open acknowledges again.
    async fn acknowledge(&self, position: Position) {
        match self.database.source().acknowledge(position).await {
            Ok(()) => {
                let mut state = self.database.lock().await;
                if position > state.acknowledged_position {
                    state.acknowledged_position = position;
                }
            }
            Err(e) => tracing::warn!(
                "Failed to acknowledge position {} for database {}: {}",
                position,
                self.database.name(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChangeEvent, ChangeKind, Row};
    use crate::table::TableId;

    fn change(position: u64) -> StreamItem {
        StreamItem::Change(ChangeEvent::new(
            TableId::new("public", "t"),
            Position(position),
            ChangeKind::Insert { row: Row::default() },
        ))
    }

    #[test]
    fn test_buffer_takes_only_complete_transactions() {
        let mut buffer = Buffer::default();
        assert!(!buffer.push(change(1)));
        assert!(buffer.push(StreamItem::EndOfBatch(Position(1))));
        assert!(!buffer.push(change(2)));
        assert_eq!(buffer.changes, 2);

        let (items, position) = buffer.take_complete().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(position, Position(1));
        assert_eq!(buffer.items.len(), 1);
        assert_eq!(buffer.changes, 1);
        assert!(buffer.started.is_some());
        assert!(buffer.take_complete().is_none());

        assert!(buffer.push(StreamItem::EndOfBatch(Position(2))));
        let (items, position) = buffer.take_complete().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(position, Position(2));
        assert!(buffer.is_empty());
        assert!(buffer.started.is_none());
    }

    #[test]
    fn test_flush_policy_from_settings() {
        let mut settings = Settings::default();
        settings.set_tunable("flush_interval_ms", "250").unwrap();
        let policy = FlushPolicy::from(&settings);
        assert_eq!(policy.flush_interval, Duration::from_millis(250));
        assert_eq!(policy.max_block_size, settings.max_block_size);
    }
}
