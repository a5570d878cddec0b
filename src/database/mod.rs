//! The database side of a backup: catalog discovery, freeze, DDL replay and partition attach

mod clickhouse;
/// Scanning and staging frozen partitions
pub mod partitions;

pub use clickhouse::ClickHouse;

use std::path::PathBuf;

use async_trait::async_trait;

use crate::backup::{BackupCatalog, BackupTable, RestoreTable, Table};
use crate::Result;

/// Everything the workflow needs from the database server.
///
/// Implementations honor their own dry-run setting: mutating calls log and return `Ok`.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Verify the server is reachable
    async fn connect(&self) -> Result<()>;

    /// Release the connection
    async fn close(&self) -> Result<()>;

    /// Tables eligible for freeze, in server order
    async fn tables(&self) -> Result<Vec<Table>>;

    /// Frozen tables found under `backup/shadow`
    async fn backup_tables(&self) -> Result<BackupCatalog>;

    /// Root of the server's on-disk data
    async fn data_path(&self) -> Result<PathBuf>;

    /// Snapshot every partition of `table` into `shadow/`
    async fn freeze_table(&self, table: &Table) -> Result<()>;

    /// `CREATE DATABASE IF NOT EXISTS`
    async fn create_database(&self, name: &str) -> Result<()>;

    /// Replay a table definition
    async fn create_table(&self, table: &RestoreTable) -> Result<()>;

    /// Stage the table's partitions into its `detached/` directory
    async fn copy_data(&self, table: &BackupTable, move_data: bool) -> Result<()>;

    /// Bring staged partitions online
    async fn attach_partitions(&self, table: &BackupTable) -> Result<()>;
}
