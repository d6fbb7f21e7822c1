// ABOUTME: CLI entry point for database-mirror
// ABOUTME: Loads the TOML configuration and routes subcommands to the control plane

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use database_mirror::config::TargetSection;
use database_mirror::lock::InstanceLock;
use database_mirror::source::{ChangeSource, PgSource};
use database_mirror::storage::{PostgresStorage, SqliteStorage, TargetStorage};
use database_mirror::{ConnectionParams, FileConfig, Settings, SyncDatabase};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "database-mirror")]
#[command(about = "Continuously mirror PostgreSQL tables into local managed tables", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the mirror configuration file
    #[arg(
        long,
        short = 'c',
        global = true,
        env = "DATABASE_MIRROR_CONFIG",
        default_value = "mirror.toml"
    )]
    config: PathBuf,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database: track the initial tables and copy their baselines
    Create,
    /// Stream changes until interrupted
    Run,
    /// Start mirroring one more source table
    Attach {
        /// Table name (`schema.table` in multi-schema databases)
        table: String,
    },
    /// Stop mirroring a table
    Detach {
        table: String,
        /// Also drop the local copy and forget the table
        #[arg(long)]
        permanently: bool,
    },
    /// Change a tunable setting
    Set { key: String, value: String },
    /// List the mirrored tables
    Tables,
    /// Print the CREATE DATABASE statement for this database
    ShowCreate,
    /// Show positions and per-table state
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Remove local tables, the checkpoint and the replication slot
    Drop {
        /// Skip the confirmation requirement
        #[arg(short = 'y', long)]
        yes: bool,
    },
}

async fn open_storage(config: &FileConfig) -> anyhow::Result<Arc<dyn TargetStorage>> {
    let storage: Arc<dyn TargetStorage> = match &config.target {
        TargetSection::Sqlite => {
            let path = config
                .state_dir()?
                .join(format!("{}.db", config.database.name));
            Arc::new(SqliteStorage::open(path)?)
        }
        TargetSection::SqliteFile { path } => Arc::new(SqliteStorage::open(path)?),
        TargetSection::Postgres { url, schema } => {
            let params = ConnectionParams::from_url(url)?;
            Arc::new(PostgresStorage::connect(&params, schema).await?)
        }
    };
    Ok(storage)
}

fn open_source(params: ConnectionParams, config: &FileConfig) -> Arc<dyn ChangeSource> {
    Arc::new(PgSource::new(params, config.slot_name()))
}

/// `run` and every command that changes the database hold this for their lifetime.
fn lock(config: &FileConfig) -> anyhow::Result<InstanceLock> {
    InstanceLock::acquire(&config.state_dir()?, &config.database.name)
}

async fn recover(config: &FileConfig) -> anyhow::Result<SyncDatabase> {
    let (params, _) = config.source_connection()?;
    let source = open_source(params, config);
    let storage = open_storage(config).await?;
    let database = SyncDatabase::recover(&config.database.name, source, storage)
        .await
        .with_context(|| format!("Failed to open database {}", config.database.name))?;
    Ok(database)
}

async fn run(database: SyncDatabase) -> anyhow::Result<()> {
    let handle = database.start();
    tracing::info!("Mirroring database {}. Press Ctrl+C to stop", database.name());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received shutdown signal");
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(1)) => {
                if handle.is_finished() {
                    break;
                }
            }
        }
    }

    handle.shutdown().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG takes precedence over --log
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = FileConfig::load(&cli.config)?;

    match cli.command {
        Commands::Create => {
            let _lock = lock(&config)?;
            let settings = Settings::from_pairs(config.settings_pairs()?)?;
            let (params, descriptor) = config.source_connection()?;
            let source = open_source(params, &config);
            let storage = open_storage(&config).await?;
            let database =
                SyncDatabase::create(&config.database.name, settings, descriptor, source, storage)
                    .await?;
            println!("Created database {}", database.name());
            for table in database.show_tables().await {
                println!("  {}", table);
            }
        }
        Commands::Run => {
            let _lock = lock(&config)?;
            let database = recover(&config).await?;
            run(database).await?;
        }
        Commands::Attach { table } => {
            let _lock = lock(&config)?;
            let database = recover(&config).await?;
            database.attach_table(&table).await?;
            println!("Attached {}", table);
        }
        Commands::Detach { table, permanently } => {
            let _lock = lock(&config)?;
            let database = recover(&config).await?;
            database.detach_table(&table, permanently).await?;
            println!("Detached {}", table);
        }
        Commands::Set { key, value } => {
            let _lock = lock(&config)?;
            let database = recover(&config).await?;
            database.modify_setting(&key, &value).await?;
            println!("{} = {}", key, value);
        }
        Commands::Tables => {
            let database = recover(&config).await?;
            for table in database.show_tables().await {
                println!("{}", table);
            }
        }
        Commands::ShowCreate => {
            let database = recover(&config).await?;
            println!("{}", database.show_create().await);
        }
        Commands::Status { json } => {
            let database = recover(&config).await?;
            let status = database.status().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                println!("Database: {}", status.name);
                println!("  Committed position:    {}", status.committed_position);
                println!("  Acknowledged position: {}", status.acknowledged_position);
                for table in &status.tables {
                    print!(
                        "  {:<40} {:<13} {}",
                        table.local_name, table.state, table.last_applied_position
                    );
                    match &table.quarantine_reason {
                        Some(reason) => println!("  ({})", reason),
                        None => println!(),
                    }
                }
            }
        }
        Commands::Drop { yes } => {
            if !yes {
                bail!(
                    "Refusing to drop database {} without --yes",
                    config.database.name
                );
            }
            let _lock = lock(&config)?;
            let database = recover(&config).await?;
            database.drop_database().await?;
            println!("Dropped database {}", config.database.name);
        }
    }

    Ok(())
}
