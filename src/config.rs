//! Configuration read once at startup and passed into every operation

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{BackupError, Result};

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// ClickHouse connection
    pub clickhouse: ClickHouseConfig,
    /// Object storage connection
    pub s3: S3Config,
    /// Transfer and retention settings
    pub backup: BackupConfig,
}

/// ClickHouse HTTP interface connection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClickHouseConfig {
    /// User for the HTTP interface
    pub username: String,
    /// Password for the HTTP interface
    pub password: String,
    /// Host name of the server
    pub host: String,
    /// HTTP interface port
    pub port: u16,
    /// Skip asking the server for its data path
    pub data_path: Option<PathBuf>,
    /// Per-request timeout of the HTTP transport
    pub timeout_secs: u64,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            username: "default".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 8123,
            data_path: None,
            timeout_secs: 300,
        }
    }
}

/// S3 or S3-compatible storage parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// Access key id; empty uses the default credential chain
    pub access_key: String,
    /// Secret access key
    pub secret_key: String,
    /// Bucket holding the backups
    pub bucket: String,
    /// Custom endpoint for MinIO/LocalStack
    pub endpoint: Option<String>,
    /// Bucket region
    pub region: String,
    /// Canned ACL applied to uploaded objects
    pub acl: String,
    /// Address buckets as `endpoint/bucket` instead of by subdomain
    pub force_path_style: bool,
    /// Key prefix every remote name is placed under
    pub path: String,
    /// Use plain http for custom endpoints given without a scheme
    pub disable_ssl: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            access_key: String::new(),
            secret_key: String::new(),
            bucket: String::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            acl: "private".to_string(),
            force_path_style: false,
            path: String::new(),
            disable_ssl: false,
        }
    }
}

/// How backups are shipped and how many are kept
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Tree or archive transfer
    pub strategy: BackupStrategy,
    /// Archives kept in storage after an upload; 0 keeps everything
    pub backups_to_keep: usize,
}

/// Transfer strategy selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStrategy {
    /// Mirror `metadata/` and `shadow/` object by object
    #[default]
    Tree,
    /// Ship one tar archive per backup
    Archive,
}

impl std::fmt::Display for BackupStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree => f.write_str("tree"),
            Self::Archive => f.write_str("archive"),
        }
    }
}

impl Config {
    /// Load the YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Reading config from {:?}", path);
        let file = std::fs::File::open(path)
            .map_err(|e| BackupError::Config(format!("cannot open {:?}: {}", path, e)))?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Parse a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Render the default configuration for `default-config`
    pub fn default_yaml() -> Result<String> {
        Ok(serde_yaml::to_string(&Self::default())?)
    }
}
