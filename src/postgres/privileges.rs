// ABOUTME: Source prerequisite checks for logical replication
// ABOUTME: Verifies REPLICATION privilege, wal_level and per-table SELECT access

use anyhow::{Context, Result};
use tokio_postgres::Client;

/// What the connected role and server allow for logical decoding.
#[derive(Debug, Clone)]
pub struct SourceReadiness {
    /// Role has the REPLICATION attribute.
    pub has_replication: bool,
    /// Superusers bypass the other requirements.
    pub is_superuser: bool,
    pub wal_level: String,
}

impl SourceReadiness {
    /// Human-readable reasons the source cannot stream changes. Empty when ready.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !self.has_replication && !self.is_superuser {
            problems.push("role lacks the REPLICATION privilege".to_string());
        }
        if self.wal_level != "logical" {
            problems.push(format!(
                "wal_level is '{}', logical replication requires 'logical'",
                self.wal_level
            ));
        }
        problems
    }

    pub fn is_ready(&self) -> bool {
        self.problems().is_empty()
    }
}

/// Query `pg_roles` and `wal_level` for the current user.
pub async fn check_source_readiness(client: &Client) -> Result<SourceReadiness> {
    let row = client
        .query_one(
            "SELECT rolreplication, rolsuper FROM pg_roles WHERE rolname = current_user",
            &[],
        )
        .await
        .context("Failed to query user privileges")?;

    let wal_level = client
        .query_one("SHOW wal_level", &[])
        .await
        .context("Failed to query wal_level setting")?;

    Ok(SourceReadiness {
        has_replication: row.get(0),
        is_superuser: row.get(1),
        wal_level: wal_level.get(0),
    })
}

/// Whether the current user may SELECT from `schema.table`.
pub async fn can_select(client: &Client, schema: &str, table: &str) -> Result<bool> {
    let row = client
        .query_one(
            "SELECT has_table_privilege(current_user, quote_ident($1) || '.' || quote_ident($2), 'SELECT')",
            &[&schema, &table],
        )
        .await
        .with_context(|| format!("Failed to check SELECT privilege on {}.{}", schema, table))?;
    Ok(row.get(0))
}
