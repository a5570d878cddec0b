//! Object storage backends for shipping backups offsite

#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use s3::S3;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::backup::BackupObject;
use crate::Result;

/// Remote names are relative to the backend's configured prefix.
///
/// Implementations honor their own dry-run setting: uploads, downloads and deletes are logged
/// instead of performed, listings still hit the backend.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Verify the bucket is reachable
    async fn connect(&self) -> Result<()>;

    /// Mirror a local directory to `remote/`, deleting remote objects without a local file
    async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()>;

    /// Upload one file to `remote`
    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()>;

    /// Fetch every object under `remote/` into `local`
    async fn download_tree(&self, remote: &str, local: &Path) -> Result<()>;

    /// Fetch one object into `local_dir`, returning the written path
    async fn download_archive(&self, remote: &str, local_dir: &Path) -> Result<PathBuf>;

    /// Objects whose names start with `prefix`, prefix stripped
    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>>;

    /// Delete objects in batches
    async fn delete_objects(&self, objects: &[BackupObject]) -> Result<()>;
}
