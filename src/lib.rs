// ABOUTME: Library root for database-mirror
// ABOUTME: Mirrors PostgreSQL tables into local managed tables through logical replication

pub mod apply;
pub mod checkpoint;
pub mod config;
pub mod database;
pub mod error;
pub mod lock;
pub mod position;
pub mod postgres;
pub mod registry;
pub mod snapshot;
pub mod source;
pub mod storage;
pub mod table;
pub mod utils;
pub mod worker;

pub use config::{ConnectionDescriptor, ConnectionParams, FileConfig, Settings};
pub use database::{DatabaseStatus, SyncDatabase, SyncHandle, TableStatus};
pub use error::{Result, SyncError};
pub use position::Position;
pub use table::{ColumnDef, TableId, TableSchema, TableState};
