// ABOUTME: Change stream client - the boundary to the replicated source database
// ABOUTME: Defines the ChangeSource/ChangeStream traits and hosts the adapters

pub mod event;
pub mod memory;
pub mod postgres;

pub use event::{ChangeEvent, ChangeKind, Field, Row, StreamItem, Value, ValueKind};
pub use memory::MemorySource;
pub use postgres::PgSource;

use crate::error::Result;
use crate::position::Position;
use crate::table::{TableId, TableSchema};
use async_trait::async_trait;

/// A consistent copy of one table and the position it is consistent with.
#[derive(Debug, Clone)]
pub struct TableSnapshot {
    pub position: Position,
    pub schema: TableSchema,
    pub rows: Vec<Row>,
}

/// Ordered, restartable sequence of stream items.
///
/// Every change of one source transaction carries the position of that
/// transaction's commit, and the transaction ends with `EndOfBatch` at the same
/// position. Positions never decrease.
#[async_trait]
pub trait ChangeStream: Send {
    /// Suspends until the next item is available.
    ///
    /// Fails with `SourceUnavailable` once the connection is lost; the stream is
    /// unusable afterwards and must be reopened.
    async fn next(&mut self) -> Result<StreamItem>;
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Make sure the replication slot exists and return the position it delivers from.
    async fn init_stream(&self) -> Result<Position>;

    /// Stream every item strictly after `from`.
    async fn open(&self, from: Position) -> Result<Box<dyn ChangeStream>>;

    /// Let the source reclaim history up to and including `position`.
    async fn acknowledge(&self, position: Position) -> Result<()>;

    async fn publish(&self, table: &TableId) -> Result<()>;

    /// Remove a table from the publication. A table that no longer exists is not an error.
    async fn unpublish(&self, table: &TableId) -> Result<()>;

    async fn list_tables(&self, schema: &str) -> Result<Vec<TableId>>;

    async fn table_schema(&self, table: &TableId) -> Result<TableSchema>;

    async fn table_exists(&self, table: &TableId) -> Result<bool>;

    async fn snapshot(&self, table: &TableId) -> Result<TableSnapshot>;

    /// Remove the replication slot.
    async fn drop_stream(&self) -> Result<()>;
}
