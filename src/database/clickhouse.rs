//! ClickHouse over its HTTP interface

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::partitions::{scan_backup_catalog, stage_partitions};
use super::DatabaseClient;
use crate::backup::{BackupCatalog, BackupTable, RestoreTable, Table};
use crate::config::ClickHouseConfig;
use crate::layout::{DataLayout, SYSTEM_DATABASE};
use crate::{BackupError, Result};

const USER_HEADER: &str = "X-ClickHouse-User";
const KEY_HEADER: &str = "X-ClickHouse-Key";
const METADATA_SEGMENT: &str = "/metadata/";

#[derive(Debug, Deserialize)]
struct TableRow {
    database: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct MetadataPathRow {
    metadata_path: String,
}

#[derive(Debug, Deserialize)]
struct PartitionRow {
    partition_id: String,
}

/// Stateless client; every call is one HTTP request
#[derive(Debug, Clone)]
pub struct ClickHouse {
    config: ClickHouseConfig,
    client: reqwest::Client,
    endpoint: Url,
    dry_run: bool,
}

impl ClickHouse {
    /// Client for the configured HTTP interface
    pub fn new(config: ClickHouseConfig, dry_run: bool) -> Result<Self> {
        let endpoint = Url::parse(&format!("http://{}:{}/", config.host, config.port))
            .map_err(|e| BackupError::Config(format!("invalid clickhouse address: {}", e)))?;
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackupError::Connection(format!("can't build http client: {}", e)))?;

        Ok(Self {
            config,
            client,
            endpoint,
            dry_run,
        })
    }

    fn url(&self, database: Option<&str>) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(database) = database {
            url.query_pairs_mut().append_pair("database", database);
        }
        url
    }

    async fn execute(&self, query: &str, database: Option<&str>) -> Result<String> {
        debug!(query, "clickhouse query");
        let response = self
            .client
            .post(self.url(database))
            .header(USER_HEADER, &self.config.username)
            .header(KEY_HEADER, &self.config.password)
            .body(query.to_string())
            .send()
            .await
            .map_err(|e| BackupError::Database(format!("can't execute '{}': {}", query, e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| BackupError::Database(format!("can't read response: {}", e)))?;
        if !status.is_success() {
            return Err(BackupError::Database(format!(
                "'{}' failed with {}: {}",
                query,
                status,
                body.trim()
            )));
        }
        Ok(body)
    }

    async fn select<T: DeserializeOwned>(&self, query: &str) -> Result<Vec<T>> {
        let body = self
            .execute(&format!("{} FORMAT JSONEachRow", query), None)
            .await?;
        body.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|e| BackupError::Database(format!("unexpected row {}: {}", line, e)))
            })
            .collect()
    }

    async fn layout(&self) -> Result<DataLayout> {
        Ok(DataLayout::new(self.data_path().await?))
    }
}

#[async_trait]
impl DatabaseClient for ClickHouse {
    async fn connect(&self) -> Result<()> {
        self.execute("SELECT 1", None)
            .await
            .map_err(|e| BackupError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn tables(&self) -> Result<Vec<Table>> {
        let rows: Vec<TableRow> = self
            .select(
                "SELECT database, name FROM system.tables \
                 WHERE is_temporary = 0 AND engine LIKE '%MergeTree'",
            )
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| Table::new(row.database, row.name))
            .collect())
    }

    async fn backup_tables(&self) -> Result<BackupCatalog> {
        let shadow = self.layout().await?.backup_shadow();
        tokio::task::spawn_blocking(move || scan_backup_catalog(&shadow)).await?
    }

    async fn data_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.config.data_path {
            return Ok(path.clone());
        }
        let rows: Vec<MetadataPathRow> = self
            .select(&format!(
                "SELECT metadata_path FROM system.tables \
                 WHERE database = {} AND metadata_path != '' LIMIT 1",
                quote_literal(SYSTEM_DATABASE)
            ))
            .await?;
        rows.first()
            .and_then(|row| data_path_from_metadata(&row.metadata_path))
            .ok_or_else(|| BackupError::Database("no table reports a metadata path".to_string()))
    }

    async fn freeze_table(&self, table: &Table) -> Result<()> {
        let partitions: Vec<PartitionRow> = self
            .select(&format!(
                "SELECT DISTINCT partition_id FROM system.parts \
                 WHERE active AND database = {} AND table = {}",
                quote_literal(&table.database),
                quote_literal(&table.name)
            ))
            .await?;
        let target = qualified(&table.database, &table.name);

        for partition in partitions {
            let id = quote_literal(&partition.partition_id);
            if self.dry_run {
                info!(table = %target, partition = %partition.partition_id, "dry-run: skip freeze");
                continue;
            }
            let by_id = format!("ALTER TABLE {} FREEZE PARTITION ID {}", target, id);
            if let Err(e) = self.execute(&by_id, None).await {
                warn!(table = %target, error = %e, "FREEZE PARTITION ID failed, retrying by value");
                self.execute(&format!("ALTER TABLE {} FREEZE PARTITION {}", target, id), None)
                    .await?;
            }
        }
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        let query = format!("CREATE DATABASE IF NOT EXISTS {}", quote_identifier(name));
        if self.dry_run {
            info!(query = %query, "dry-run: skip");
            return Ok(());
        }
        self.execute(&query, None).await.map(|_| ())
    }

    async fn create_table(&self, table: &RestoreTable) -> Result<()> {
        if self.dry_run {
            info!(table = %table.full_name(), "dry-run: skip create table");
            return Ok(());
        }
        info!(table = %table.full_name(), "create table");
        self.execute(&table.query, Some(&table.database))
            .await
            .map(|_| ())
    }

    async fn copy_data(&self, table: &BackupTable, move_data: bool) -> Result<()> {
        let layout = self.layout().await?;
        let table = table.clone();
        let dry_run = self.dry_run;
        tokio::task::spawn_blocking(move || stage_partitions(&layout, &table, move_data, dry_run))
            .await?
    }

    async fn attach_partitions(&self, table: &BackupTable) -> Result<()> {
        let target = qualified(&table.database, &table.name);
        for partition in &table.partitions {
            let query = format!(
                "ALTER TABLE {} ATTACH PART {}",
                target,
                quote_literal(&partition.name)
            );
            if self.dry_run {
                info!(query = %query, "dry-run: skip");
                continue;
            }
            self.execute(&query, None).await?;
        }
        Ok(())
    }
}

fn data_path_from_metadata(metadata_path: &str) -> Option<PathBuf> {
    metadata_path
        .find(METADATA_SEGMENT)
        .map(|index| Path::new(&metadata_path[..index]).to_path_buf())
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('\\', "\\\\").replace('`', "\\`"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

fn qualified(database: &str, table: &str) -> String {
    format!("{}.{}", quote_identifier(database), quote_identifier(table))
}
