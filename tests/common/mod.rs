// Shared in-memory collaborators for workflow integration tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use clickhouse_backup::backup::{BackupCatalog, BackupObject, BackupTable, RestoreTable, Table};
use clickhouse_backup::config::{BackupStrategy, Config};
use clickhouse_backup::database::partitions::{scan_backup_catalog, stage_partitions};
use clickhouse_backup::database::DatabaseClient;
use clickhouse_backup::storage::ObjectStorage;
use clickhouse_backup::{BackupError, DataLayout, Result};
use walkdir::WalkDir;

pub fn config(data_path: &Path, strategy: BackupStrategy, backups_to_keep: usize) -> Config {
    let mut config = Config::default();
    config.clickhouse.data_path = Some(data_path.to_path_buf());
    config.backup.strategy = strategy;
    config.backup.backups_to_keep = backups_to_keep;
    config
}

pub fn write(path: &Path, contents: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, contents).unwrap();
}

/// Lay down one frozen partition under `<root>/<increment>/data/<db>/<table>/<part>/`
pub fn write_part(root: &Path, increment: u32, database: &str, table: &str, part: &str) -> PathBuf {
    let dir = root
        .join(increment.to_string())
        .join("data")
        .join(database)
        .join(table)
        .join(part);
    write(&dir.join("data.bin"), format!("{database}.{table}.{part}").as_bytes());
    dir
}

#[derive(Default)]
pub struct FakeDatabase {
    pub data_path: PathBuf,
    pub tables: Vec<Table>,
    pub fail_freeze: HashSet<String>,
    pub fail_create: HashSet<String>,
    pub fail_copy: HashSet<String>,
    pub frozen: Mutex<Vec<String>>,
    pub databases: Mutex<Vec<String>>,
    pub created: Mutex<Vec<String>>,
    pub copied: Mutex<Vec<String>>,
    pub attached: Mutex<Vec<String>>,
}

impl FakeDatabase {
    pub fn new(data_path: &Path) -> Self {
        Self {
            data_path: data_path.to_path_buf(),
            ..Self::default()
        }
    }

    fn layout(&self) -> DataLayout {
        DataLayout::new(&self.data_path)
    }
}

#[async_trait]
impl DatabaseClient for FakeDatabase {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn tables(&self) -> Result<Vec<Table>> {
        Ok(self.tables.clone())
    }

    async fn backup_tables(&self) -> Result<BackupCatalog> {
        scan_backup_catalog(&self.layout().backup_shadow())
    }

    async fn data_path(&self) -> Result<PathBuf> {
        Ok(self.data_path.clone())
    }

    async fn freeze_table(&self, table: &Table) -> Result<()> {
        if self.fail_freeze.contains(&table.full_name()) {
            return Err(BackupError::Database("Code: 60. Table doesn't exist".to_string()));
        }
        self.frozen.lock().unwrap().push(table.full_name());
        Ok(())
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        self.databases.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn create_table(&self, table: &RestoreTable) -> Result<()> {
        if self.fail_create.contains(&table.full_name()) {
            return Err(BackupError::Database(format!(
                "syntax error in {}",
                table.full_name()
            )));
        }
        assert!(table.query.starts_with("CREATE"), "{}", table.query);
        self.created.lock().unwrap().push(table.full_name());
        Ok(())
    }

    async fn copy_data(&self, table: &BackupTable, move_data: bool) -> Result<()> {
        if self.fail_copy.contains(&table.full_name()) {
            return Err(BackupError::Database("detached is read-only".to_string()));
        }
        self.copied.lock().unwrap().push(table.id().to_string());
        stage_partitions(&self.layout(), table, move_data, false)
    }

    async fn attach_partitions(&self, table: &BackupTable) -> Result<()> {
        self.attached.lock().unwrap().push(table.id().to_string());
        Ok(())
    }
}

struct StoredObject {
    body: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// Object storage keeping everything in a map, stamping writes with a monotonic clock
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    clock: Mutex<DateTime<Utc>>,
    pub deleted: Mutex<Vec<String>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            clock: Mutex::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()),
            deleted: Mutex::new(Vec::new()),
        }
    }
}

impl MemoryStorage {
    fn tick(&self) -> DateTime<Utc> {
        let mut clock = self.clock.lock().unwrap();
        *clock += Duration::minutes(1);
        *clock
    }

    pub fn put(&self, key: &str, body: &[u8]) {
        let last_modified = self.tick();
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                last_modified,
            },
        );
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    fn under(&self, remote: &str) -> Vec<(String, Vec<u8>)> {
        let prefix = format!("{}/", remote);
        self.objects
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(key, object)| {
                key.strip_prefix(&prefix)
                    .map(|relative| (relative.to_string(), object.body.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in WalkDir::new(local).sort_by_file_name() {
            let entry = entry.map_err(|e| BackupError::io("walk", e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(local).unwrap();
            let key = format!("{}/{}", remote, relative.to_string_lossy());
            let body = fs::read(entry.path()).map_err(|e| BackupError::io("read", e))?;
            self.put(&key, &body);
            seen.insert(key);
        }
        let prefix = format!("{}/", remote);
        self.objects
            .lock()
            .unwrap()
            .retain(|key, _| !key.starts_with(&prefix) || seen.contains(key));
        Ok(())
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let body = fs::read(local).map_err(|e| BackupError::io("read", e))?;
        self.put(remote, &body);
        Ok(())
    }

    async fn download_tree(&self, remote: &str, local: &Path) -> Result<()> {
        for (relative, body) in self.under(remote) {
            write(&local.join(relative), &body);
        }
        Ok(())
    }

    async fn download_archive(&self, remote: &str, local_dir: &Path) -> Result<PathBuf> {
        let body = self
            .objects
            .lock()
            .unwrap()
            .get(remote)
            .map(|object| object.body.clone())
            .ok_or_else(|| BackupError::Storage(format!("{} not found", remote)))?;
        let destination = local_dir.join(Path::new(remote).file_name().unwrap());
        write(&destination, &body);
        Ok(destination)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| BackupObject {
                key: key.clone(),
                last_modified: object.last_modified,
                size: object.body.len() as u64,
            })
            .collect())
    }

    async fn delete_objects(&self, objects: &[BackupObject]) -> Result<()> {
        let mut stored = self.objects.lock().unwrap();
        for object in objects {
            stored.remove(&object.key);
            self.deleted.lock().unwrap().push(object.key.clone());
        }
        Ok(())
    }
}
