//! S3-compatible object storage (AWS, MinIO, LocalStack)

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Credentials;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    CompletedMultipartUpload, CompletedPart, Delete, Error as DeleteError, Object, ObjectCannedAcl,
    ObjectIdentifier,
};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::ObjectStorage;
use crate::backup::BackupObject;
use crate::config::S3Config;
use crate::{BackupError, Result};

/// Files at least this large go through multipart upload
const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const PART_SIZE: u64 = 16 * 1024 * 1024;
/// DeleteObjects accepts at most this many keys per request
const DELETE_BATCH: usize = 1000;

fn storage_error<E: std::error::Error>(context: &str, err: E) -> BackupError {
    BackupError::Storage(format!("{}: {}", context, DisplayErrorContext(err)))
}

struct LocalFile {
    path: PathBuf,
    relative: String,
    /// ETag S3 reports for this file once uploaded by `put_file`
    etag: String,
}

/// Object storage backed by an S3 bucket
pub struct S3 {
    client: Client,
    config: S3Config,
    dry_run: bool,
}

impl S3 {
    /// Client built from the default AWS configuration plus `config` overrides
    pub async fn new(config: S3Config, dry_run: bool) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint_url(endpoint, config.disable_ssl));
        }
        if !config.access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                config.access_key.clone(),
                config.secret_key.clone(),
                None,
                None,
                "clickhouse-backup",
            ));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            config,
            dry_run,
        })
    }

    fn key(&self, remote: &str) -> String {
        join_key(&self.config.path, remote)
    }

    /// Key prefix of everything below `remote`, with a trailing `/`
    fn dir_prefix(&self, remote: &str) -> String {
        let key = self.key(remote);
        if key.is_empty() {
            key
        } else {
            format!("{}/", key)
        }
    }

    fn acl(&self) -> ObjectCannedAcl {
        ObjectCannedAcl::from(self.config.acl.as_str())
    }

    async fn list_raw(&self, prefix: &str) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        let mut token = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix)
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| storage_error("can't list objects", e))?;

            objects.extend(response.contents().iter().cloned());
            match response.next_continuation_token() {
                Some(next) => token = Some(next.to_string()),
                None => break,
            }
        }
        Ok(objects)
    }

    async fn put_file(&self, local: &Path, key: &str) -> Result<()> {
        let size = tokio::fs::metadata(local)
            .await
            .map_err(|e| BackupError::at_path("stat", local, e))?
            .len();
        debug!(key, size, "put object");

        if size < MULTIPART_THRESHOLD {
            let body = ByteStream::from_path(local)
                .await
                .map_err(|e| storage_error("can't read upload body", e))?;
            self.client
                .put_object()
                .bucket(&self.config.bucket)
                .key(key)
                .acl(self.acl())
                .body(body)
                .send()
                .await
                .map_err(|e| storage_error(&format!("can't upload {}", key), e))?;
            return Ok(());
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .acl(self.acl())
            .send()
            .await
            .map_err(|e| storage_error("can't create multipart upload", e))?;
        let upload_id = upload
            .upload_id()
            .ok_or_else(|| BackupError::Storage("no upload id returned".to_string()))?;

        let mut file = tokio::fs::File::open(local)
            .await
            .map_err(|e| BackupError::at_path("open", local, e))?;
        let mut parts = Vec::new();
        let mut part_number = 1;
        loop {
            let mut chunk = Vec::with_capacity(PART_SIZE as usize);
            (&mut file)
                .take(PART_SIZE)
                .read_to_end(&mut chunk)
                .await
                .map_err(|e| BackupError::at_path("read", local, e))?;
            if chunk.is_empty() {
                break;
            }

            let part = self
                .client
                .upload_part()
                .bucket(&self.config.bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| storage_error("can't upload part", e))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(part.e_tag().unwrap_or_default())
                    .build(),
            );
            part_number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| storage_error("can't complete multipart upload", e))?;
        Ok(())
    }

    async fn get_file(&self, key: &str, destination: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| storage_error(&format!("can't get {}", key), e))?;

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| BackupError::at_path("create", parent, e))?;
        }
        let mut file = tokio::fs::File::create(destination)
            .await
            .map_err(|e| BackupError::at_path("create", destination, e))?;
        let mut body = response.body;
        while let Some(bytes) = body
            .try_next()
            .await
            .map_err(|e| storage_error(&format!("can't read {}", key), e))?
        {
            file.write_all(&bytes)
                .await
                .map_err(|e| BackupError::at_path("write", destination, e))?;
        }
        file.flush()
            .await
            .map_err(|e| BackupError::at_path("write", destination, e))
    }

    async fn delete_keys(&self, keys: Vec<String>) -> Result<()> {
        for batch in keys.chunks(DELETE_BATCH) {
            let identifiers = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| storage_error("can't build object identifier", e))
                })
                .collect::<Result<Vec<_>>>()?;
            let delete = Delete::builder()
                .set_objects(Some(identifiers))
                .build()
                .map_err(|e| storage_error("can't build delete request", e))?;

            let output = self
                .client
                .delete_objects()
                .bucket(&self.config.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|e| storage_error("batch delete failed", e))?;
            if let Some(failures) = delete_failures(output.errors()) {
                return Err(BackupError::Storage(format!(
                    "batch delete failed for {}",
                    failures
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStorage for S3 {
    async fn connect(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket)
            .send()
            .await
            .map_err(|e| {
                BackupError::Connection(format!(
                    "bucket {}: {}",
                    self.config.bucket,
                    DisplayErrorContext(e)
                ))
            })?;
        Ok(())
    }

    async fn upload_directory(&self, local: &Path, remote: &str) -> Result<()> {
        let prefix = self.dir_prefix(remote);
        let existing: HashMap<String, String> = self
            .list_raw(&prefix)
            .await?
            .into_iter()
            .filter_map(|o| {
                let key = o.key()?.to_string();
                let etag = o.e_tag().unwrap_or_default().trim_matches('"').to_string();
                Some((key, etag))
            })
            .collect();

        let root = local.to_path_buf();
        let files = tokio::task::spawn_blocking(move || local_files(&root))
            .await?
            .map_err(|e| BackupError::at_path("read", local, e))?;

        let mut uploaded = 0;
        let mut keep = HashSet::new();
        for file in files {
            let key = format!("{}{}", prefix, file.relative);
            if existing.get(&key).is_some_and(|etag| *etag == file.etag) {
                debug!(key = %key, "unchanged, skipping");
                keep.insert(key);
                continue;
            }
            info!(key = %key, dry_run = self.dry_run, "upload");
            if !self.dry_run {
                self.put_file(&file.path, &key).await?;
            }
            uploaded += 1;
            keep.insert(key);
        }

        let extra: Vec<String> = existing
            .into_keys()
            .filter(|key| !keep.contains(key))
            .collect();
        info!(
            remote,
            uploaded,
            deleted = extra.len(),
            dry_run = self.dry_run,
            "directory synced"
        );
        if self.dry_run || extra.is_empty() {
            return Ok(());
        }
        self.delete_keys(extra).await
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> Result<()> {
        let key = self.key(remote);
        info!(key = %key, dry_run = self.dry_run, "upload");
        if self.dry_run {
            return Ok(());
        }
        self.put_file(local, &key).await
    }

    async fn download_tree(&self, remote: &str, local: &Path) -> Result<()> {
        let prefix = self.dir_prefix(remote);
        for object in self.list_raw(&prefix).await? {
            let Some(relative) = object.key().and_then(|k| k.strip_prefix(prefix.as_str())) else {
                continue;
            };
            if relative.is_empty() || relative.ends_with('/') {
                continue;
            }
            if !is_safe_relative(relative) {
                return Err(BackupError::Storage(format!(
                    "refusing to download {} outside {}",
                    relative,
                    local.display()
                )));
            }
            let destination = local.join(relative);
            debug!(key = %relative, dry_run = self.dry_run, "download");
            if self.dry_run {
                continue;
            }
            self.get_file(&format!("{}{}", prefix, relative), &destination)
                .await?;
        }
        Ok(())
    }

    async fn download_archive(&self, remote: &str, local_dir: &Path) -> Result<PathBuf> {
        let name = Path::new(remote)
            .file_name()
            .ok_or_else(|| BackupError::Storage(format!("invalid archive name {}", remote)))?;
        let destination = local_dir.join(name);
        let key = self.key(remote);
        info!(key = %key, to = %destination.display(), dry_run = self.dry_run, "download");
        if !self.dry_run {
            self.get_file(&key, &destination).await?;
        }
        Ok(destination)
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<BackupObject>> {
        let root = self.dir_prefix("");
        let search = format!("{}{}", root, prefix.trim_start_matches('/'));
        Ok(self
            .list_raw(&search)
            .await?
            .into_iter()
            .filter_map(|o| {
                let key = o.key()?.strip_prefix(root.as_str())?.to_string();
                let last_modified = o
                    .last_modified()
                    .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                    .unwrap_or_default();
                Some(BackupObject {
                    key,
                    last_modified,
                    size: o.size().unwrap_or_default().max(0) as u64,
                })
            })
            .collect())
    }

    async fn delete_objects(&self, objects: &[BackupObject]) -> Result<()> {
        for object in objects {
            info!(key = %object.key, dry_run = self.dry_run, "delete");
        }
        if self.dry_run || objects.is_empty() {
            return Ok(());
        }
        self.delete_keys(objects.iter().map(|o| self.key(&o.key)).collect())
            .await
    }
}

/// `<prefix>/<name>` with redundant slashes removed
fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    let name = name.trim_matches('/');
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{}/{}", prefix, name),
    }
}

/// Per-key failures DeleteObjects reports inside a successful response
fn delete_failures(errors: &[DeleteError]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    Some(
        errors
            .iter()
            .map(|e| {
                format!(
                    "{} ({}: {})",
                    e.key().unwrap_or("<unknown key>"),
                    e.code().unwrap_or("unknown"),
                    e.message().unwrap_or_default()
                )
            })
            .collect::<Vec<_>>()
            .join(", "),
    )
}

fn endpoint_url(endpoint: &str, disable_ssl: bool) -> String {
    if endpoint.contains("://") {
        endpoint.to_string()
    } else if disable_ssl {
        format!("http://{}", endpoint)
    } else {
        format!("https://{}", endpoint)
    }
}

fn is_safe_relative(key: &str) -> bool {
    Path::new(key)
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
}

/// Plain MD5 below the multipart threshold, the multipart ETag above it
fn local_etag(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    if file.metadata()?.len() < MULTIPART_THRESHOLD {
        let mut hasher = Md5::new();
        io::copy(&mut file, &mut hasher)?;
        return Ok(format!("{:x}", hasher.finalize()));
    }
    multipart_etag(file, PART_SIZE)
}

/// MD5 of the concatenated part digests, suffixed with the part count
fn multipart_etag<R: Read>(mut reader: R, part_size: u64) -> io::Result<String> {
    let mut digests = Md5::new();
    let mut parts = 0;
    loop {
        let mut part = Md5::new();
        let copied = io::copy(&mut Read::take(&mut reader, part_size), &mut part)?;
        if copied == 0 {
            break;
        }
        digests.update(part.finalize());
        parts += 1;
    }
    Ok(format!("{:x}-{}", digests.finalize(), parts))
}

fn local_files(root: &Path) -> io::Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        files.push(LocalFile {
            etag: local_etag(entry.path())?,
            path: entry.into_path(),
            relative,
        });
    }
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_join_key() {
        assert_eq!(join_key("", "shadow"), "shadow");
        assert_eq!(join_key("/backups/", "shadow"), "backups/shadow");
        assert_eq!(join_key("backups", ""), "backups");
        assert_eq!(join_key("backups", "/2024.tar"), "backups/2024.tar");
    }

    #[test]
    fn test_multipart_etag_matches_s3() {
        let etag = multipart_etag(&b"0123456789"[..], 4).unwrap();

        assert_eq!(etag, "61e3716e3a7767581863b67c4e785584-3");
    }

    #[test]
    fn test_local_etag_of_small_file_is_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        assert_eq!(local_etag(&path).unwrap(), "781e5e245d69b566979b86e28d23f2c7");
    }

    #[test]
    fn test_delete_failures_are_reported() {
        assert_eq!(delete_failures(&[]), None);

        let errors = vec![
            DeleteError::builder()
                .key("backups/2024-01-01.tar")
                .code("AccessDenied")
                .message("Access Denied")
                .build(),
            DeleteError::builder().key("backups/2024-01-02.tar").build(),
        ];

        assert_eq!(
            delete_failures(&errors).unwrap(),
            "backups/2024-01-01.tar (AccessDenied: Access Denied), backups/2024-01-02.tar (unknown: )"
        );
    }

    #[test]
    fn test_endpoint_scheme() {
        assert_eq!(endpoint_url("minio:9000", true), "http://minio:9000");
        assert_eq!(endpoint_url("minio:9000", false), "https://minio:9000");
        assert_eq!(endpoint_url("http://minio:9000", false), "http://minio:9000");
    }

    #[test]
    fn test_relative_keys_stay_inside() {
        assert!(is_safe_relative("1/data/sales/orders/all_1_1_0/data.bin"));
        assert!(!is_safe_relative("../etc/passwd"));
        assert!(!is_safe_relative("/etc/passwd"));
    }

    #[test]
    fn test_local_files_hash_and_relative_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sales")).unwrap();
        std::fs::write(dir.path().join("sales").join("orders.sql"), b"hello").unwrap();

        let files = local_files(dir.path()).unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative, "sales/orders.sql");
        assert_eq!(files[0].etag, "5d41402abc4b2a76b9719d911017c592");
    }
}
