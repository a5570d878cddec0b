//! # ClickHouse cold backup
//!
//! Backs up and restores ClickHouse partitions to and from S3-compatible object
//! storage, using the server's own `FREEZE` snapshots to obtain a consistent,
//! hardlink-based point-in-time copy before shipping it offsite.
//!
//! ## Overview
//!
//! A command selects tables, performs the database-side snapshot or DDL step through a
//! [`database::DatabaseClient`], delegates bulk data movement to a
//! [`backup::TransferStrategy`], and optionally prunes old backups with a
//! [`backup::RetentionPolicy`]. Everything is driven by [`backup::BackupWorkflow`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use clickhouse_backup::backup::BackupWorkflow;
//! use clickhouse_backup::config::Config;
//! use clickhouse_backup::database::ClickHouse;
//! use clickhouse_backup::storage::S3;
//!
//! # async fn example() -> clickhouse_backup::Result<()> {
//! let config = Config::default();
//! let database = ClickHouse::new(config.clickhouse.clone(), false)?;
//! let storage = S3::new(config.s3.clone(), false).await?;
//!
//! let workflow = BackupWorkflow::new(config, Arc::new(database), Arc::new(storage));
//! workflow.freeze(&["sales.*".to_string()]).await?;
//! workflow.upload().await?;
//! workflow.clean().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`archive`]: hardlink-aware tar archiving and extraction
//! - [`backup`]: table selection, transfer strategies, retention and the workflow
//! - [`database`]: the ClickHouse collaborator
//! - [`storage`]: the object storage collaborator
//! - [`config`]: configuration model and loading
//! - [`layout`]: on-disk paths under the ClickHouse data directory

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use thiserror::Error;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for backup operations
#[derive(Error, Debug)]
pub enum BackupError {
    /// Database or object storage is unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// A check that must hold before any mutation failed
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// Query or DDL execution failed on the database side
    #[error("Database error: {0}")]
    Database(String),

    /// Object storage request failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Archive creation or extraction failed
    #[error("Archive error: {0}")]
    Archive(#[from] archive::ArchiveError),

    /// Invalid table pattern
    #[error("Selection error: {0}")]
    Selection(#[from] backup::SelectionError),

    /// Configuration could not be loaded or is invalid
    #[error("Config error: {0}")]
    Config(String),

    /// Filesystem error with the operation it happened in
    #[error("{context}: {source}")]
    Io {
        /// What was being done, including the path
        context: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A per-table step failed and aborted the batch
    #[error("table {table}: {source}")]
    Table {
        /// `<database>.<table>` plus increment where relevant
        table: String,
        /// What went wrong
        #[source]
        source: Box<BackupError>,
    },

    /// Join error from blocking tasks
    #[error("Async join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl BackupError {
    /// Wrap an I/O error with a description of the operation and path
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Attach the table an error belongs to
    pub fn for_table(table: impl Into<String>, source: BackupError) -> Self {
        Self::Table {
            table: table.into(),
            source: Box::new(source),
        }
    }

    /// Shorthand for a missing-path style I/O context
    pub(crate) fn at_path(action: &str, path: &std::path::Path, source: std::io::Error) -> Self {
        Self::io(format!("can't {} {}", action, path.display()), source)
    }
}

impl From<serde_yaml::Error> for BackupError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// Hardlink-aware archive engine
pub mod archive;

/// Table selection, transfer strategies, retention and orchestration
pub mod backup;

/// Configuration model and loading
pub mod config;

/// Database collaborator
pub mod database;

/// Paths under the ClickHouse data directory
pub mod layout;

/// Object storage collaborator
pub mod storage;

pub use config::Config;
pub use layout::DataLayout;
