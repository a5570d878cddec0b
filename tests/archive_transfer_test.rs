// Integration tests for shipping backups through the tree and archive strategies

mod common;

use std::fs;
use std::sync::Arc;

use clickhouse_backup::backup::BackupWorkflow;
use clickhouse_backup::config::BackupStrategy;
use clickhouse_backup::{BackupError, DataLayout};
use common::{config, write, write_part, FakeDatabase, MemoryStorage};
use pretty_assertions::assert_eq;

fn workflow(
    data_path: &std::path::Path,
    strategy: BackupStrategy,
    backups_to_keep: usize,
) -> (BackupWorkflow, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::default());
    let workflow = BackupWorkflow::new(
        config(data_path, strategy, backups_to_keep),
        Arc::new(FakeDatabase::new(data_path)),
        storage.clone(),
    );
    (workflow, storage)
}

/// Two increments of the same table sharing one part file, as consecutive freezes do
fn write_frozen_data(layout: &DataLayout) {
    let first = write_part(&layout.shadow(), 1, "sales", "orders", "all_1_1_0");
    let second = layout.shadow().join("2/data/sales/orders/all_1_1_0");
    fs::create_dir_all(&second).unwrap();
    fs::hard_link(first.join("data.bin"), second.join("data.bin")).unwrap();
    write(
        &layout.metadata().join("sales").join("orders.sql"),
        b"ATTACH TABLE orders (id UInt64) ENGINE = MergeTree ORDER BY id",
    );
}

#[tokio::test]
async fn test_archive_round_trip_keeps_hard_links() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_frozen_data(&layout);
    let (workflow, storage) = workflow(dir.path(), BackupStrategy::Archive, 0);

    let uploaded = workflow.upload().await.unwrap();

    let name = uploaded.archive.expect("archive name");
    assert!(name.ends_with(".tar"));
    assert_eq!(storage.keys(), vec![name.clone()]);
    let stats = uploaded.archive_stats.unwrap();
    assert_eq!((stats.files, stats.hard_links), (2, 1));

    let downloaded = workflow.download(Some(&name)).await.unwrap();

    let extracted = downloaded.extracted.unwrap();
    assert_eq!(extracted.files, 2);
    let first = layout.backup_shadow().join("1/data/sales/orders/all_1_1_0/data.bin");
    let second = layout.backup_shadow().join("2/data/sales/orders/all_1_1_0/data.bin");
    assert_eq!(fs::read(&second).unwrap(), b"sales.orders.all_1_1_0");
    assert!(layout.backup_metadata().join("sales/orders.sql").exists());
    assert!(!layout.backup().join(&name).exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        assert_eq!(
            fs::metadata(&first).unwrap().ino(),
            fs::metadata(&second).unwrap().ino()
        );
    }
}

#[tokio::test]
async fn test_archive_download_needs_a_name() {
    let dir = tempfile::tempdir().unwrap();
    let (workflow, _) = workflow(dir.path(), BackupStrategy::Archive, 0);

    let err = workflow.download(None).await.unwrap_err();

    assert!(matches!(err, BackupError::Precondition(_)), "{err}");
    assert!(!DataLayout::new(dir.path()).backup().exists());
}

#[tokio::test]
async fn test_archive_upload_prunes_old_archives() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_frozen_data(&layout);
    let (workflow, storage) = workflow(dir.path(), BackupStrategy::Archive, 2);
    storage.put("2024-01-01.tar", b"oldest");
    storage.put("2024-01-02.tar", b"older");
    storage.put("notes.txt", b"not a backup");

    let uploaded = workflow.upload().await.unwrap();

    let name = uploaded.archive.unwrap();
    let cleanup = uploaded.cleanup.unwrap();
    let deleted: Vec<&str> = cleanup.deleted.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(deleted, vec!["2024-01-01.tar"]);
    assert_eq!(cleanup.retained, 2);

    let mut expected = vec!["2024-01-02.tar".to_string(), name, "notes.txt".to_string()];
    expected.sort();
    assert_eq!(storage.keys(), expected);
}

#[tokio::test]
async fn test_archive_dry_run_uploads_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_frozen_data(&layout);
    let (workflow, storage) = workflow(dir.path(), BackupStrategy::Archive, 1);
    storage.put("2024-01-01.tar", b"oldest");
    storage.put("2024-01-02.tar", b"older");
    let workflow = workflow.with_dry_run(true);

    let uploaded = workflow.upload().await.unwrap();

    assert!(uploaded.archive.is_none());
    assert_eq!(uploaded.archive_stats.unwrap().files, 2);
    let cleanup = uploaded.cleanup.unwrap();
    let deleted: Vec<&str> = cleanup.deleted.iter().map(|o| o.key.as_str()).collect();
    assert_eq!(deleted, vec!["2024-01-01.tar", "2024-01-02.tar"]);
    assert_eq!(cleanup.retained, 1);
    assert_eq!(storage.keys(), vec!["2024-01-01.tar", "2024-01-02.tar"]);
}

#[tokio::test]
async fn test_archive_dry_run_reports_same_pruning_as_real_run() {
    let mut deleted = Vec::new();
    for dry_run in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        write_frozen_data(&DataLayout::new(dir.path()));
        let (workflow, storage) = workflow(dir.path(), BackupStrategy::Archive, 1);
        storage.put("2024-01-01.tar", b"oldest");
        storage.put("2024-01-02.tar", b"older");
        let workflow = workflow.with_dry_run(dry_run);

        let uploaded = workflow.upload().await.unwrap();

        deleted.push(uploaded.cleanup.unwrap().deleted.len());
    }

    assert_eq!(deleted, vec![2, 2]);
}

#[tokio::test]
async fn test_tree_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    write_frozen_data(&layout);
    let (workflow, storage) = workflow(dir.path(), BackupStrategy::Tree, 0);
    storage.put("shadow/9/data/stale/table/all_0_0_0/data.bin", b"stale");

    workflow.upload().await.unwrap();

    assert_eq!(
        storage.keys(),
        vec![
            "metadata/sales/orders.sql",
            "shadow/1/data/sales/orders/all_1_1_0/data.bin",
            "shadow/2/data/sales/orders/all_1_1_0/data.bin",
        ]
    );

    workflow.download(None).await.unwrap();

    assert_eq!(
        fs::read(layout.backup_shadow().join("2/data/sales/orders/all_1_1_0/data.bin")).unwrap(),
        b"sales.orders.all_1_1_0"
    );
    assert!(layout.backup_metadata().join("sales/orders.sql").exists());
}
