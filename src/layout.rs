//! Directory layout under the ClickHouse data path
//!
//! ```text
//! <data>/shadow/                         freeze staging, source of uploads
//! <data>/metadata/<db>/<table>.sql       live table definitions
//! <data>/backup/metadata/<db>/<table>.sql downloaded definitions
//! <data>/backup/shadow/...               downloaded partitions
//! <data>/data/<db>/<table>/detached/     partitions waiting for ATTACH
//! ```

use std::path::{Path, PathBuf};

/// Remote name of the metadata tree
pub const METADATA: &str = "metadata";
/// Remote name of the shadow tree
pub const SHADOW: &str = "shadow";
/// Database whose definitions are never restored
pub const SYSTEM_DATABASE: &str = "system";

/// Every path the backup tool touches, derived from one data path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLayout {
    data_path: PathBuf,
}

impl DataLayout {
    /// Create a layout rooted at the ClickHouse data directory
    pub fn new(data_path: impl Into<PathBuf>) -> Self {
        Self {
            data_path: data_path.into(),
        }
    }

    /// The ClickHouse data directory
    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    /// Freeze staging area
    pub fn shadow(&self) -> PathBuf {
        self.data_path.join(SHADOW)
    }

    /// Live table definitions
    pub fn metadata(&self) -> PathBuf {
        self.data_path.join(METADATA)
    }

    /// Local landing area for downloads
    pub fn backup(&self) -> PathBuf {
        self.data_path.join("backup")
    }

    /// Downloaded table definitions
    pub fn backup_metadata(&self) -> PathBuf {
        self.backup().join(METADATA)
    }

    /// Downloaded partitions
    pub fn backup_shadow(&self) -> PathBuf {
        self.backup().join(SHADOW)
    }

    /// Staging area ClickHouse scans on `ATTACH PART`
    pub fn detached(&self, database: &str, table: &str) -> PathBuf {
        self.data_path
            .join("data")
            .join(database)
            .join(table)
            .join("detached")
    }
}
