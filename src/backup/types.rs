// Backup System Types - Core data structures shared by the workflow and collaborators

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::{ArchiveStats, ExtractStats};
use crate::BackupError;

/// A live table in the source database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    /// Database name
    pub database: String,
    /// Table name
    pub name: String,
}

impl Table {
    /// Table `database.name`
    pub fn new(database: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
        }
    }

    /// `<database>.<table>`, the string table patterns match against
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

/// Identity of one frozen copy of a table
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupTableId {
    /// Database name
    pub database: String,
    /// Table name
    pub name: String,
    /// Freeze generation under `shadow/`
    pub increment: u32,
}

impl fmt::Display for BackupTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.database, self.name, self.increment)
    }
}

/// One part directory of a frozen table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupPartition {
    /// Part directory name, e.g. `all_1_1_0`
    pub name: String,
    /// Location relative to `backup/shadow`
    pub path: PathBuf,
}

/// A table as captured by one freeze
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupTable {
    /// Database name
    pub database: String,
    /// Table name
    pub name: String,
    /// Freeze generation under `shadow/`
    pub increment: u32,
    /// Partition directories, sorted by name
    pub partitions: Vec<BackupPartition>,
}

impl BackupTable {
    /// Frozen table with no partitions yet
    pub fn new(database: impl Into<String>, name: impl Into<String>, increment: u32) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            increment,
            partitions: Vec::new(),
        }
    }

    /// Catalog key of this table
    pub fn id(&self) -> BackupTableId {
        BackupTableId {
            database: self.database.clone(),
            name: self.name.clone(),
            increment: self.increment,
        }
    }

    /// `<database>.<table>`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

/// Downloaded backup contents, ordered by database, table, then increment
pub type BackupCatalog = BTreeMap<BackupTableId, BackupTable>;

const DISTRIBUTED_ENGINE: &str = "ENGINE = Distributed";

/// A table definition rewritten for replay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreTable {
    /// Database name
    pub database: String,
    /// Table name
    pub name: String,
    /// `CREATE` statement replayed against the server
    pub query: String,
}

impl RestoreTable {
    /// Turn the `ATTACH TABLE ...` statement ClickHouse keeps in `metadata/` into a
    /// `CREATE TABLE ...` statement
    pub fn from_attach(
        database: impl Into<String>,
        name: impl Into<String>,
        definition: &str,
    ) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            query: definition.replacen("ATTACH", "CREATE", 1),
        }
    }

    /// Distributed tables read from other tables and must be created after them
    pub fn is_distributed(&self) -> bool {
        self.query.contains(DISTRIBUTED_ENGINE)
    }

    /// `<database>.<table>`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.name)
    }
}

/// An object in cold storage, keyed relative to the configured prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupObject {
    /// Name relative to the storage prefix
    pub key: String,
    /// Last modification time reported by storage
    pub last_modified: DateTime<Utc>,
    /// Size in bytes
    pub size: u64,
}

/// Tables handed to the freeze primitive
#[derive(Debug, Clone, Default)]
pub struct FreezeResult {
    /// Frozen tables, in catalog order
    pub frozen: Vec<Table>,
}

/// Outcome of creating one table during `create-tables`
#[derive(Debug)]
pub struct TableOutcome {
    /// Database name
    pub database: String,
    /// Table name
    pub table: String,
    /// Whether the table uses the Distributed engine
    pub distributed: bool,
    /// Creation result
    pub result: Result<(), BackupError>,
}

impl TableOutcome {
    /// `<database>.<table>`
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

/// Per-table results of `create-tables`, in execution order
#[derive(Debug, Default)]
pub struct CreateTablesResult {
    /// Every table attempted, in creation order
    pub outcomes: Vec<TableOutcome>,
}

impl CreateTablesResult {
    /// Tables created successfully
    pub fn created(&self) -> impl Iterator<Item = &TableOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    /// Tables that failed, with their errors
    pub fn failures(&self) -> impl Iterator<Item = (&TableOutcome, &BackupError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o, e)))
    }

    /// Whether every table was created
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Objects removed by the retention policy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// Objects removed, oldest first
    pub deleted: Vec<BackupObject>,
    /// Backups left in storage
    pub retained: usize,
}

/// What an upload shipped
#[derive(Debug, Clone, Default)]
pub struct UploadResult {
    /// Remote name of the archive, archive strategy only
    pub archive: Option<String>,
    /// Archive totals, archive strategy only
    pub archive_stats: Option<ArchiveStats>,
    /// Pruning outcome, archive strategy only
    pub cleanup: Option<CleanupResult>,
}

/// What a download fetched
#[derive(Debug, Clone, Default)]
pub struct DownloadResult {
    /// Name of the downloaded archive, archive strategy only
    pub archive: Option<String>,
    /// Extraction totals, archive strategy only
    pub extracted: Option<ExtractStats>,
}

/// Tables whose partitions were staged and attached
#[derive(Debug, Clone, Default)]
pub struct RestoreResult {
    /// Tables whose partitions were attached
    pub restored: Vec<BackupTableId>,
}
