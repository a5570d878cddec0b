//! Local partition bookkeeping: find frozen parts under `backup/shadow` and stage them
//! into `detached/` for `ATTACH PART`
//!
//! Downloaded partitions are laid out as
//! `backup/shadow/<increment>/data/<database>/<table>/<partition>/`.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::backup::{BackupCatalog, BackupPartition, BackupTable};
use crate::layout::DataLayout;
use crate::{BackupError, Result};

const PARTITION_DEPTH: usize = 5;

/// Group every partition directory under `shadow` by (database, table, increment)
pub fn scan_backup_catalog(shadow: &Path) -> Result<BackupCatalog> {
    if !shadow.is_dir() {
        return Err(BackupError::io(
            format!("can't read {}", shadow.display()),
            io::Error::new(io::ErrorKind::NotFound, "backup shadow directory is missing"),
        ));
    }

    let mut catalog = BackupCatalog::new();
    let walker = WalkDir::new(shadow)
        .min_depth(PARTITION_DEPTH)
        .max_depth(PARTITION_DEPTH)
        .sort_by_file_name();

    for entry in walker {
        let entry =
            entry.map_err(|e| BackupError::io(format!("can't scan {}", shadow.display()), e.into()))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(shadow) else {
            continue;
        };
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let [increment, data, database, name, partition] = parts.as_slice() else {
            continue;
        };
        if data != "data" {
            continue;
        }
        let Ok(increment) = increment.parse::<u32>() else {
            warn!(path = %entry.path().display(), "skipping partition outside a numeric increment");
            continue;
        };

        let table = BackupTable::new(database.as_str(), name.as_str(), increment);
        catalog
            .entry(table.id())
            .or_insert(table)
            .partitions
            .push(BackupPartition {
                name: partition.clone(),
                path: relative.to_path_buf(),
            });
    }

    debug!(tables = catalog.len(), "scanned backup catalog");
    Ok(catalog)
}

/// Place every partition of `table` under its `detached/` directory, renaming when
/// `move_data` is set and copying otherwise
pub fn stage_partitions(
    layout: &DataLayout,
    table: &BackupTable,
    move_data: bool,
    dry_run: bool,
) -> Result<()> {
    let detached = layout.detached(&table.database, &table.name);
    match fs::metadata(&detached) {
        Ok(metadata) if !metadata.is_dir() => {
            return Err(BackupError::Precondition(format!(
                "{} should be a directory",
                detached.display()
            )));
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(BackupError::at_path("stat", &detached, e)),
    }

    let shadow = layout.backup_shadow();
    for partition in &table.partitions {
        let source = shadow.join(&partition.path);
        let destination = detached.join(&partition.name);
        info!(
            from = %source.display(),
            to = %destination.display(),
            move_data,
            dry_run,
            "stage partition"
        );
        if dry_run {
            continue;
        }

        fs::create_dir_all(&detached).map_err(|e| BackupError::at_path("create", &detached, e))?;
        if move_data {
            fs::rename(&source, &destination)
                .map_err(|e| BackupError::at_path("move", &source, e))?;
        } else {
            copy_recursively(&source, &destination)
                .map_err(|e| BackupError::at_path("copy", &source, e))?;
        }
    }
    Ok(())
}

fn copy_recursively(source: &Path, destination: &Path) -> io::Result<()> {
    fs::create_dir_all(destination)?;
    for entry in WalkDir::new(source) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if entry.file_type().is_dir() {
            fs::create_dir_all(destination.join(relative))?;
        } else {
            fs::copy(entry.path(), destination.join(relative))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    fn write_part(shadow: &Path, increment: &str, database: &str, table: &str, part: &str) {
        let dir = shadow
            .join(increment)
            .join("data")
            .join(database)
            .join(table)
            .join(part);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("checksums.txt"), part.as_bytes()).unwrap();
    }

    #[test]
    fn test_scan_groups_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let shadow = dir.path();
        write_part(shadow, "1", "sales", "orders", "all_1_1_0");
        write_part(shadow, "1", "sales", "orders", "all_2_2_0");
        write_part(shadow, "2", "sales", "orders", "all_3_3_0");
        write_part(shadow, "1", "analytics", "events", "202401_1_1_0");
        write_part(shadow, "latest", "sales", "orders", "all_9_9_0");

        let catalog = scan_backup_catalog(shadow).unwrap();

        let ids: Vec<String> = catalog.keys().map(|id| id.to_string()).collect();
        assert_eq!(
            ids,
            vec!["analytics.events.1", "sales.orders.1", "sales.orders.2"]
        );
        let orders = catalog.values().nth(1).unwrap();
        let names: Vec<&str> = orders.partitions.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["all_1_1_0", "all_2_2_0"]);
        assert_eq!(
            orders.partitions[0].path,
            PathBuf::from("1/data/sales/orders/all_1_1_0")
        );
    }

    #[test]
    fn test_scan_missing_shadow_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("backup").join("shadow");

        let err = scan_backup_catalog(&missing).unwrap_err();

        assert!(err.to_string().contains(&missing.display().to_string()));
    }

    fn staged_layout() -> (tempfile::TempDir, DataLayout, BackupTable) {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path());
        write_part(&layout.backup_shadow(), "1", "sales", "orders", "all_1_1_0");
        let catalog = scan_backup_catalog(&layout.backup_shadow()).unwrap();
        let table = catalog.into_values().next().unwrap();
        (dir, layout, table)
    }

    #[test]
    fn test_stage_copies() {
        let (_dir, layout, table) = staged_layout();

        stage_partitions(&layout, &table, false, false).unwrap();

        let staged = layout.detached("sales", "orders").join("all_1_1_0");
        assert_eq!(fs::read(staged.join("checksums.txt")).unwrap(), b"all_1_1_0");
        assert!(layout.backup_shadow().join(&table.partitions[0].path).exists());
    }

    #[test]
    fn test_stage_moves() {
        let (_dir, layout, table) = staged_layout();

        stage_partitions(&layout, &table, true, false).unwrap();

        assert!(layout
            .detached("sales", "orders")
            .join("all_1_1_0")
            .join("checksums.txt")
            .exists());
        assert!(!layout.backup_shadow().join(&table.partitions[0].path).exists());
    }

    #[test]
    fn test_stage_rejects_file_destination() {
        let (_dir, layout, table) = staged_layout();
        let detached = layout.detached("sales", "orders");
        fs::create_dir_all(detached.parent().unwrap()).unwrap();
        fs::write(&detached, b"").unwrap();

        let err = stage_partitions(&layout, &table, false, false).unwrap_err();

        assert!(matches!(err, BackupError::Precondition(_)));
    }

    #[test]
    fn test_stage_dry_run_touches_nothing() {
        let (_dir, layout, table) = staged_layout();

        stage_partitions(&layout, &table, true, true).unwrap();

        assert!(!layout.detached("sales", "orders").exists());
        assert!(layout.backup_shadow().join(&table.partitions[0].path).exists());
    }
}
