// Backup Workflow - freeze, ship, replay DDL and attach partitions

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::selector::{select_for_freeze, select_for_restore};
use super::transfer::{strategy_for, TransferStrategy};
use super::types::{
    CreateTablesResult, DownloadResult, FreezeResult, RestoreResult, RestoreTable, Table,
    TableOutcome, UploadResult,
};
use crate::config::Config;
use crate::database::DatabaseClient;
use crate::layout::{DataLayout, SYSTEM_DATABASE};
use crate::storage::ObjectStorage;
use crate::{BackupError, Result};

/// Runs the user-facing commands over a database and an object storage.
///
/// Every step runs sequentially; each awaited call finishes before the next starts.
pub struct BackupWorkflow {
    config: Config,
    database: Arc<dyn DatabaseClient>,
    storage: Arc<dyn ObjectStorage>,
    transfer: Box<dyn TransferStrategy>,
    dry_run: bool,
}

impl BackupWorkflow {
    /// Workflow over the given collaborators, not in dry-run mode
    pub fn new(
        config: Config,
        database: Arc<dyn DatabaseClient>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Self {
        let transfer = strategy_for(&config, false);
        Self {
            config,
            database,
            storage,
            transfer,
            dry_run: false,
        }
    }

    /// Skip every local mutation this workflow performs itself. Collaborators carry their
    /// own flag.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self.transfer = strategy_for(&self.config, dry_run);
        self
    }

    /// Replace the strategy chosen from the configuration
    pub fn with_transfer(mut self, transfer: Box<dyn TransferStrategy>) -> Self {
        self.transfer = transfer;
        self
    }

    /// Configuration the workflow was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn connect_database(&self) -> Result<()> {
        self.database
            .connect()
            .await
            .map_err(|e| BackupError::Connection(format!("can't connect to clickhouse: {}", e)))
    }

    async fn connect_storage(&self) -> Result<()> {
        self.storage
            .connect()
            .await
            .map_err(|e| BackupError::Connection(format!("can't connect to s3: {}", e)))
    }

    /// The configured data path, or the one the server reports
    async fn layout(&self) -> Result<DataLayout> {
        if let Some(path) = &self.config.clickhouse.data_path {
            return Ok(DataLayout::new(path));
        }
        self.connect_database().await?;
        let path = self.database.data_path().await.map_err(|e| {
            BackupError::Database(format!(
                "can't get data path from clickhouse: {}; you can set clickhouse.data_path in the config file",
                e
            ))
        })?;
        info!(data_path = %path.display(), "found clickhouse data path");
        Ok(DataLayout::new(path))
    }

    /// All tables eligible for freeze
    pub async fn tables(&self) -> Result<Vec<Table>> {
        self.connect_database().await?;
        self.database
            .tables()
            .await
            .map_err(|e| BackupError::Database(format!("can't get tables: {}", e)))
    }

    /// Freeze the tables matching `patterns` into `shadow/`.
    ///
    /// Refuses to run while `shadow/` holds a previous generation. Stops at the first table
    /// that fails to freeze.
    #[tracing::instrument(skip(self))]
    pub async fn freeze(&self, patterns: &[String]) -> Result<FreezeResult> {
        self.connect_database().await?;
        let layout = self.layout().await?;
        ensure_empty(&layout.shadow()).await?;

        let tables = self
            .database
            .tables()
            .await
            .map_err(|e| BackupError::Database(format!("can't get tables: {}", e)))?;
        let selected = select_for_freeze(&tables, patterns)?;
        if selected.is_empty() {
            info!("There are no tables in ClickHouse, create something to freeze");
            return Ok(FreezeResult::default());
        }

        for table in &selected {
            info!(table = %table.full_name(), "freeze");
            self.database
                .freeze_table(table)
                .await
                .map_err(|e| BackupError::for_table(table.full_name(), e))?;
        }

        Ok(FreezeResult { frozen: selected })
    }

    /// Recreate databases and tables from `backup/metadata`.
    ///
    /// Best effort: a table that fails to create is recorded in the result and the rest
    /// continue. Distributed tables are created after every other table.
    #[tracing::instrument(skip(self))]
    pub async fn create_tables(&self) -> Result<CreateTablesResult> {
        self.connect_database().await?;
        let layout = self.layout().await?;
        let metadata = layout.backup_metadata();
        info!(path = %metadata.display(), "analyze restored metadata");

        let databases = sorted_entries(&metadata)
            .await
            .map_err(|e| BackupError::at_path("read metadata directory", &metadata, e))?;

        let mut result = CreateTablesResult::default();
        let mut distributed = Vec::new();

        for database_dir in databases {
            if !tokio::fs::metadata(&database_dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)
            {
                continue;
            }
            let database = file_name(&database_dir);
            if database == SYSTEM_DATABASE {
                continue;
            }

            info!(database = %database, "found metadata files for database");
            if let Err(e) = self.database.create_database(&database).await {
                warn!(database = %database, error = %e, "can't create database");
            }

            let files = sorted_entries(&database_dir)
                .await
                .map_err(|e| BackupError::at_path("read database directory", &database_dir, e))?;

            for path in files {
                if path.extension().and_then(|e| e.to_str()) != Some("sql") {
                    continue;
                }
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                debug!(path = %path.display(), "found table");

                let definition = match tokio::fs::read_to_string(&path).await {
                    Ok(definition) => definition,
                    Err(e) => {
                        result.outcomes.push(TableOutcome {
                            database: database.clone(),
                            table: name,
                            distributed: false,
                            result: Err(BackupError::at_path("read", &path, e)),
                        });
                        continue;
                    }
                };

                let table = RestoreTable::from_attach(&database, name, &definition);
                if table.is_distributed() {
                    debug!(table = %table.full_name(), "distributed table, saving for later");
                    distributed.push(table);
                    continue;
                }
                let outcome = self.create_table(table, false).await;
                result.outcomes.push(outcome);
            }
        }

        info!(count = distributed.len(), "creating distributed tables");
        for table in distributed {
            let outcome = self.create_table(table, true).await;
            result.outcomes.push(outcome);
        }

        Ok(result)
    }

    async fn create_table(&self, table: RestoreTable, distributed: bool) -> TableOutcome {
        let result = self.database.create_table(&table).await;
        TableOutcome {
            database: table.database,
            table: table.name,
            distributed,
            result,
        }
    }

    /// Ship `metadata/` and `shadow/` with the configured strategy
    #[tracing::instrument(skip(self))]
    pub async fn upload(&self) -> Result<UploadResult> {
        let layout = self.layout().await?;
        self.connect_storage().await?;
        info!(strategy = self.transfer.name(), "upload");
        self.transfer.upload(self.storage.as_ref(), &layout).await
    }

    /// Fetch a backup into `backup/`. The archive strategy needs the archive name.
    #[tracing::instrument(skip(self))]
    pub async fn download(&self, archive: Option<&str>) -> Result<DownloadResult> {
        let layout = self.layout().await?;
        self.connect_storage().await?;
        info!(strategy = self.transfer.name(), "download");
        self.transfer
            .download(self.storage.as_ref(), &layout, archive)
            .await
    }

    /// Stage and attach the downloaded partitions of the matching tables.
    ///
    /// Fail-fast: the first copy or attach error stops the restore.
    #[tracing::instrument(skip(self))]
    pub async fn restore(
        &self,
        patterns: &[String],
        increments: &[u32],
        move_data: bool,
    ) -> Result<RestoreResult> {
        self.connect_database().await?;
        let catalog = self.database.backup_tables().await?;
        let selected = select_for_restore(&catalog, patterns, increments)?;
        if selected.is_empty() {
            info!("Backup doesn't have tables to restore, nothing to do");
            return Ok(RestoreResult::default());
        }

        let mut result = RestoreResult::default();
        for table in selected {
            let label = format!("{} increment {}", table.full_name(), table.increment);
            info!(table = %label, move_data, "restore");
            self.database
                .copy_data(&table, move_data)
                .await
                .map_err(|e| BackupError::for_table(label.clone(), e))?;
            self.database
                .attach_partitions(&table)
                .await
                .map_err(|e| BackupError::for_table(label.clone(), e))?;
            result.restored.push(table.id());
        }

        Ok(result)
    }

    /// Remove everything under `shadow/`
    #[tracing::instrument(skip(self))]
    pub async fn clean(&self) -> Result<()> {
        let layout = self.layout().await?;
        let shadow = layout.shadow();

        match tokio::fs::metadata(&shadow).await {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %shadow.display(), "directory does not exist, nothing to do");
                return Ok(());
            }
            Err(e) => return Err(BackupError::at_path("stat", &shadow, e)),
        }

        info!(path = %shadow.display(), dry_run = self.dry_run, "remove contents from directory");
        if self.dry_run {
            return Ok(());
        }
        clean_dir(&shadow)
            .await
            .map_err(|e| BackupError::at_path("remove contents from", &shadow, e))
    }
}

async fn ensure_empty(shadow: &Path) -> Result<()> {
    let mut entries = match tokio::fs::read_dir(shadow).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(BackupError::at_path("read", shadow, e)),
    };
    let first = entries
        .next_entry()
        .await
        .map_err(|e| BackupError::at_path("read", shadow, e))?;
    if first.is_some() {
        return Err(BackupError::Precondition(format!(
            "{} is not empty, won't execute freeze",
            shadow.display()
        )));
    }
    Ok(())
}

async fn sorted_entries(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        paths.push(entry.path());
    }
    paths.sort();
    Ok(paths)
}

async fn clean_dir(dir: &Path) -> io::Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
