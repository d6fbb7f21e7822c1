// ABOUTME: Checkpoint format - the persisted {positions, tables, settings} of one database
// ABOUTME: JSON payload wrapped in an envelope carrying a SHA-256 checksum

use crate::config::{ConnectionDescriptor, Settings};
use crate::error::{Result, SyncError};
use crate::position::Position;
use crate::registry::TableRegistry;
use crate::table::TrackedTable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Version of the checkpoint format.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Everything needed to rebuild a database after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Version of the checkpoint format for future migrations
    pub version: u32,
    pub database: String,
    /// Source connection without credentials
    pub connection: ConnectionDescriptor,
    pub settings: Settings,
    /// Every change at or below this position is reflected in the local tables
    pub committed_position: Position,
    /// Highest position the source has been told it may reclaim
    pub acknowledged_position: Position,
    pub tables: Vec<TrackedTable>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload: String,
}

fn checksum(payload: &str) -> String {
    let digest = Sha256::digest(payload.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn recovery_failed(name: &str, reason: impl std::fmt::Display) -> SyncError {
    SyncError::RecoveryFailed(format!("database {}: {}", name, reason))
}

impl Checkpoint {
    pub fn new(
        database: &str,
        connection: ConnectionDescriptor,
        settings: Settings,
        start: Position,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            version: CHECKPOINT_VERSION,
            database: database.to_string(),
            connection,
            settings,
            committed_position: start,
            acknowledged_position: start,
            tables: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the recorded tables with the registry contents.
    pub fn set_tables(&mut self, registry: &TableRegistry) {
        self.tables = registry.list().cloned().collect();
    }

    pub fn encode(&self) -> Result<String> {
        let payload = serde_json::to_string(self)
            .map_err(|e| SyncError::storage(anyhow::Error::new(e).context("encode checkpoint")))?;
        let envelope = Envelope {
            checksum: checksum(&payload),
            payload,
        };
        serde_json::to_string(&envelope)
            .map_err(|e| SyncError::storage(anyhow::Error::new(e).context("encode checkpoint")))
    }

    /// Decode and verify a stored checkpoint for database `name`.
    pub fn decode(name: &str, raw: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(raw)
            .map_err(|e| recovery_failed(name, format!("unreadable checkpoint: {}", e)))?;
        if checksum(&envelope.payload) != envelope.checksum {
            return Err(recovery_failed(name, "checkpoint checksum mismatch"));
        }

        let version: serde_json::Value = serde_json::from_str(&envelope.payload)
            .map_err(|e| recovery_failed(name, format!("unreadable checkpoint: {}", e)))?;
        match version.get("version").and_then(serde_json::Value::as_u64) {
            Some(v) if v == u64::from(CHECKPOINT_VERSION) => {}
            Some(v) => {
                return Err(recovery_failed(
                    name,
                    format!("unsupported checkpoint version {}", v),
                ))
            }
            None => return Err(recovery_failed(name, "checkpoint has no version")),
        }

        let checkpoint: Checkpoint = serde_json::from_value(version)
            .map_err(|e| recovery_failed(name, format!("invalid checkpoint: {}", e)))?;
        if checkpoint.database != name {
            return Err(recovery_failed(
                name,
                format!("checkpoint belongs to database {}", checkpoint.database),
            ));
        }
        Ok(checkpoint)
    }
}
