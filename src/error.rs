// ABOUTME: Error taxonomy for the mirror engine
// ABOUTME: Separates transient source failures from table-scoped and fatal errors

use crate::position::Position;

pub type Result<T> = std::result::Result<T, SyncError>;

/// Every failure the engine reports to its callers.
///
/// Table-scoped errors (`SchemaMismatch`, `SourceTableMissing`) never abort the
/// replication stream; `SourceUnavailable` pauses it until the source comes back;
/// `RecoveryFailed` is fatal for the database instance.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("schema mismatch for table {table}: {reason}")]
    SchemaMismatch { table: String, reason: String },

    #[error("PostgreSQL table {table} does not exist")]
    SourceTableMissing { table: String },

    #[error("table {0} is already tracked")]
    AlreadyTracked(String),

    #[error("table {0} is not tracked")]
    NotTracked(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Changing setting `{0}` is not allowed")]
    ImmutableSetting(String),

    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    #[error("source no longer retains changes after position {requested} (oldest available: {oldest})")]
    StreamGap {
        requested: Position,
        oldest: Position,
    },

    #[error("local storage error: {0:#}")]
    Storage(#[source] anyhow::Error),
}

impl SyncError {
    /// Errors that are retried with backoff instead of surfaced.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::SourceUnavailable(_))
    }

    /// Errors that affect a single table and lead to its quarantine.
    pub fn is_table_scoped(&self) -> bool {
        matches!(
            self,
            SyncError::SchemaMismatch { .. } | SyncError::SourceTableMissing { .. }
        )
    }

    pub fn storage(err: anyhow::Error) -> Self {
        SyncError::Storage(err)
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        SyncError::SourceUnavailable(err.to_string())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        SyncError::InvalidConfiguration(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::SourceUnavailable("reset".into()).is_transient());
        assert!(!SyncError::NotTracked("t".into()).is_transient());
        assert!(!SyncError::RecoveryFailed("x".into()).is_transient());
    }

    #[test]
    fn test_table_scoped_classification() {
        let missing = SyncError::SourceTableMissing {
            table: "users".into(),
        };
        assert!(missing.is_table_scoped());
        assert_eq!(missing.to_string(), "PostgreSQL table users does not exist");
        assert!(!SyncError::invalid("bad").is_table_scoped());
    }

    #[test]
    fn test_immutable_setting_message() {
        let err = SyncError::ImmutableSetting("tables_list".into());
        assert_eq!(
            err.to_string(),
            "Changing setting `tables_list` is not allowed"
        );
    }
}
