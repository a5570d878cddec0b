//! Interchangeable ways of moving `metadata/` and `shadow/` to and from object storage

use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::retention::RetentionPolicy;
use super::types::{BackupObject, DownloadResult, UploadResult};
use crate::archive::{self, HardlinkArchiver};
use crate::config::{BackupStrategy, Config};
use crate::layout::{DataLayout, METADATA, SHADOW};
use crate::storage::ObjectStorage;
use crate::{BackupError, Result};

/// Archives are recognised in storage by this suffix
pub const ARCHIVE_EXTENSION: &str = ".tar";

/// How local backup directories are moved to and from object storage
#[async_trait]
pub trait TransferStrategy: Send + Sync + std::fmt::Debug {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Ship the local `metadata/` and `shadow/` directories
    async fn upload(&self, storage: &dyn ObjectStorage, layout: &DataLayout) -> Result<UploadResult>;

    /// Fetch a backup into the local `backup/` directory
    async fn download(
        &self,
        storage: &dyn ObjectStorage,
        layout: &DataLayout,
        archive: Option<&str>,
    ) -> Result<DownloadResult>;
}

/// Build the strategy named in the configuration
pub fn strategy_for(config: &Config, dry_run: bool) -> Box<dyn TransferStrategy> {
    match config.backup.strategy {
        BackupStrategy::Tree => Box::new(TreeTransfer),
        BackupStrategy::Archive => Box::new(ArchiveTransfer::new(
            RetentionPolicy::new(config.backup.backups_to_keep),
            dry_run,
        )),
    }
}

/// Mirrors both directories object by object
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeTransfer;

#[async_trait]
impl TransferStrategy for TreeTransfer {
    fn name(&self) -> &'static str {
        "tree"
    }

    async fn upload(&self, storage: &dyn ObjectStorage, layout: &DataLayout) -> Result<UploadResult> {
        info!("upload metadata");
        storage
            .upload_directory(&layout.metadata(), METADATA)
            .await
            .map_err(|e| BackupError::Storage(format!("can't upload metadata: {}", e)))?;

        info!("upload data");
        storage
            .upload_directory(&layout.shadow(), SHADOW)
            .await
            .map_err(|e| BackupError::Storage(format!("can't upload data: {}", e)))?;

        Ok(UploadResult::default())
    }

    async fn download(
        &self,
        storage: &dyn ObjectStorage,
        layout: &DataLayout,
        archive: Option<&str>,
    ) -> Result<DownloadResult> {
        if let Some(name) = archive {
            warn!(archive = name, "archive name is ignored by the tree strategy");
        }
        download_metadata(storage, layout).await?;
        storage
            .download_tree(SHADOW, &layout.backup_shadow())
            .await
            .map_err(|e| BackupError::Storage(format!("can't download shadow: {}", e)))?;

        Ok(DownloadResult::default())
    }
}

/// Ships one tar archive per backup and prunes old archives afterwards
#[derive(Debug, Clone)]
pub struct ArchiveTransfer {
    retention: RetentionPolicy,
    dry_run: bool,
}

impl ArchiveTransfer {
    /// Archive strategy pruning with `retention`
    pub fn new(retention: RetentionPolicy, dry_run: bool) -> Self {
        Self { retention, dry_run }
    }

    async fn archives(&self, storage: &dyn ObjectStorage) -> Result<Vec<BackupObject>> {
        let objects = storage.list_objects("").await?;
        Ok(objects
            .into_iter()
            .filter(|o| o.key.ends_with(ARCHIVE_EXTENSION))
            .collect())
    }
}

#[async_trait]
impl TransferStrategy for ArchiveTransfer {
    fn name(&self) -> &'static str {
        "archive"
    }

    #[tracing::instrument(skip_all)]
    async fn upload(&self, storage: &dyn ObjectStorage, layout: &DataLayout) -> Result<UploadResult> {
        let roots = [layout.shadow(), layout.metadata()];

        let mut result = if self.dry_run {
            info!(dry_run = true, "archive data (discarded)");
            let stats =
                tokio::task::spawn_blocking(move || archive::archive_dirs(io::sink(), &roots))
                    .await??;
            UploadResult {
                archive_stats: Some(stats),
                ..UploadResult::default()
            }
        } else {
            let file = tempfile::Builder::new()
                .prefix(&format!("{}-", Utc::now().format("%Y-%m-%dT%H-%M-%S")))
                .suffix(ARCHIVE_EXTENSION)
                .tempfile()
                .map_err(|e| BackupError::io("can't create temporary archive", e))?;
            let name = file
                .path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| BackupError::Precondition("temporary archive has no name".into()))?;

            info!(archive = %name, "archive data");
            let (file, stats) = tokio::task::spawn_blocking(move || {
                let stats = HardlinkArchiver::new().archive(BufWriter::new(file.as_file()), &roots)?;
                Ok::<_, BackupError>((file, stats))
            })
            .await??;

            info!(archive = %name, "upload data");
            storage
                .upload_file(file.path(), &name)
                .await
                .map_err(|e| BackupError::Storage(format!("can't upload archive {}: {}", name, e)))?;
            // The temporary file is removed when `file` drops.
            drop(file);

            UploadResult {
                archive: Some(name),
                archive_stats: Some(stats),
                ..UploadResult::default()
            }
        };

        let mut listing = self.archives(storage).await?;
        if self.dry_run {
            // Count the archive a real run would have uploaded
            listing.push(BackupObject {
                key: format!(
                    "{}-dry-run{}",
                    Utc::now().format("%Y-%m-%dT%H-%M-%S"),
                    ARCHIVE_EXTENSION
                ),
                last_modified: Utc::now(),
                size: 0,
            });
        }
        let cleanup = self
            .retention
            .prune(storage, listing, self.dry_run)
            .await
            .map_err(|e| BackupError::Storage(format!("can't remove old backups: {}", e)))?;
        result.cleanup = Some(cleanup);

        Ok(result)
    }

    #[tracing::instrument(skip(self, storage, layout))]
    async fn download(
        &self,
        storage: &dyn ObjectStorage,
        layout: &DataLayout,
        archive: Option<&str>,
    ) -> Result<DownloadResult> {
        let name = archive.ok_or_else(|| {
            BackupError::Precondition(
                "an archive name is required to download with the archive strategy".to_string(),
            )
        })?;

        download_metadata(storage, layout).await?;

        let backup_dir = layout.backup();
        let local = storage
            .download_archive(name, &backup_dir)
            .await
            .map_err(|e| BackupError::Storage(format!("error downloading {}: {}", name, e)))?;

        if self.dry_run {
            info!(archive = name, dry_run = true, "skip extraction");
            return Ok(DownloadResult {
                archive: Some(name.to_string()),
                extracted: None,
            });
        }

        let archive_path = local.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            let file = File::open(&archive_path)
                .map_err(|e| BackupError::at_path("open archive", &archive_path, e))?;
            Ok::<_, BackupError>(archive::extract(BufReader::new(file), &backup_dir)?)
        })
        .await?;
        remove_local_archive(&local).await;

        Ok(DownloadResult {
            archive: Some(name.to_string()),
            extracted: Some(extracted?),
        })
    }
}

async fn download_metadata(storage: &dyn ObjectStorage, layout: &DataLayout) -> Result<()> {
    storage
        .download_tree(METADATA, &layout.backup_metadata())
        .await
        .map_err(|e| BackupError::Storage(format!("can't download metadata: {}", e)))
}

async fn remove_local_archive(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "can't remove downloaded archive");
        }
    }
}
