use tracing::info;

use super::types::{BackupObject, CleanupResult};
use crate::storage::ObjectStorage;
use crate::Result;

/// Keeps the newest `keep` backups in storage; `keep == 0` disables pruning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    keep: usize,
}

impl RetentionPolicy {
    /// Keep the newest `keep` backups
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }

    /// Whether any pruning happens at all
    pub fn is_enabled(&self) -> bool {
        self.keep >= 1
    }

    /// The oldest objects beyond the newest `keep`, oldest first
    pub fn expired(&self, mut objects: Vec<BackupObject>) -> Vec<BackupObject> {
        if !self.is_enabled() {
            return Vec::new();
        }
        let excess = objects.len().saturating_sub(self.keep);
        objects.sort_by(|a, b| a.last_modified.cmp(&b.last_modified));
        objects.truncate(excess);
        objects
    }

    /// Delete expired objects from `listing` in one batch request
    pub async fn prune(
        &self,
        storage: &dyn ObjectStorage,
        listing: Vec<BackupObject>,
        dry_run: bool,
    ) -> Result<CleanupResult> {
        if !self.is_enabled() {
            info!("Cleaning old backups is not enabled");
            return Ok(CleanupResult {
                deleted: Vec::new(),
                retained: listing.len(),
            });
        }

        let total = listing.len();
        let expired = self.expired(listing);
        let retained = total - expired.len();
        if expired.is_empty() {
            return Ok(CleanupResult {
                deleted: expired,
                retained,
            });
        }

        info!(
            count = expired.len(),
            keep = self.keep,
            dry_run,
            "deleting old backups"
        );
        if !dry_run {
            storage.delete_objects(&expired).await?;
        }

        Ok(CleanupResult {
            deleted: expired,
            retained,
        })
    }
}
