//! clickhouse-backup command line
//!
//! Freezes ClickHouse tables, ships the snapshot to S3 and brings it back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clickhouse_backup::backup::BackupWorkflow;
use clickhouse_backup::config::Config;
use clickhouse_backup::database::{ClickHouse, DatabaseClient};
use clickhouse_backup::storage::S3;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, rename_all = "kebab-case")]
struct Args {
    /// Config file path
    #[arg(long, short, global = true, default_value = "/etc/clickhouse-backup/config.yml")]
    config: PathBuf,

    /// Log what would happen without changing anything
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Print the tables that can be frozen
    Tables,
    /// Freeze tables into the shadow directory
    Freeze {
        /// Table patterns, e.g. `sales.*`
        tables: Vec<String>,
    },
    /// Upload 'metadata' and 'shadow' to s3. Extra files on s3 are deleted
    Upload,
    /// Download 'metadata' and 'shadow' from s3 into the backup directory
    Download {
        /// Archive to download, required by the archive strategy
        archive: Option<String>,
    },
    /// Create databases and tables from the downloaded metadata
    CreateTables,
    /// Copy data from 'backup' to 'detached' and ATTACH it
    Restore {
        /// Table patterns, e.g. `sales.orders`
        tables: Vec<String>,
        /// Only restore these freeze increments
        #[arg(long, short, value_delimiter = ',')]
        increments: Vec<u32>,
        /// Move partitions instead of copying them
        #[arg(long = "move", short)]
        move_data: bool,
    },
    /// Print the default config
    DefaultConfig,
    /// Remove the contents of the shadow directory
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    if let Command::DefaultConfig = args.command {
        print!("{}", Config::default_yaml()?);
        return Ok(());
    }

    let config = Config::load(&args.config)
        .with_context(|| format!("can't load config {}", args.config.display()))?;
    let database = Arc::new(ClickHouse::new(config.clickhouse.clone(), args.dry_run)?);
    let storage = Arc::new(S3::new(config.s3.clone(), args.dry_run).await?);
    let workflow = BackupWorkflow::new(config, database.clone(), storage).with_dry_run(args.dry_run);

    let outcome = run(&workflow, args.command).await;
    database.close().await?;
    outcome
}

async fn run(workflow: &BackupWorkflow, command: Command) -> Result<()> {
    match command {
        Command::Tables => {
            for table in workflow.tables().await? {
                println!("{}", table.full_name());
            }
        }
        Command::Freeze { tables } => {
            let result = workflow.freeze(&tables).await?;
            info!(tables = result.frozen.len(), "freeze done");
        }
        Command::Upload => {
            let result = workflow.upload().await?;
            if let Some(archive) = result.archive {
                info!(archive = %archive, "upload done");
            }
        }
        Command::Download { archive } => {
            workflow.download(archive.as_deref()).await?;
        }
        Command::CreateTables => {
            let result = workflow.create_tables().await?;
            let mut failed = 0;
            for (outcome, err) in result.failures() {
                error!(table = %outcome.full_name(), error = %err, "can't create table");
                failed += 1;
            }
            info!(created = result.created().count(), failed, "create tables done");
        }
        Command::Restore {
            tables,
            increments,
            move_data,
        } => {
            let result = workflow.restore(&tables, &increments, move_data).await?;
            info!(tables = result.restored.len(), "restore done");
        }
        Command::Clean => workflow.clean().await?,
        Command::DefaultConfig => print!("{}", Config::default_yaml()?),
    }
    Ok(())
}
