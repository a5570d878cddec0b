//! Hardlink-aware tar archives of directory trees
//!
//! ClickHouse `FREEZE` hard-links every part file into `shadow/<increment>/`, so the same
//! bytes appear under many names. [`HardlinkArchiver::archive`] stores the content once per
//! inode and records every further name as a tar hard-link entry pointing at the first one;
//! [`extract`] recreates the link groups on the way back.

/// Inode tracking for hard-link detection
pub mod identity;

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use tar::{EntryType, Header, HeaderMode};
use thiserror::Error;
use tracing::{debug, error, info};
use walkdir::WalkDir;

pub use identity::{FileIdentity, IdentityProvider, IdentityTracker, InodeIdentity};

/// Errors produced while writing or reading an archive
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// A root to archive or extract into is not a directory
    #[error("{} is not a directory", path.display())]
    NotADirectory {
        /// Offending path
        path: PathBuf,
    },

    /// Reading a source file or writing the stream failed
    #[error("can't archive {}: {source}", path.display())]
    Io {
        /// File being processed
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Walking a source tree failed
    #[error("can't walk directory tree: {0}")]
    Walk(#[from] walkdir::Error),

    /// An entry is unsafe or malformed
    #[error("corrupt archive entry '{path}': {reason}")]
    Corrupt {
        /// Entry name as stored in the archive
        path: String,
        /// What is wrong with it
        reason: String,
    },
}

impl ArchiveError {
    fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.display().to_string(),
            reason: reason.into(),
        }
    }
}

/// What an archive run wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// Entries carrying file content
    pub files: usize,
    /// Entries referring to an earlier content entry
    pub hard_links: usize,
}

/// What an extraction materialized
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractStats {
    /// Regular files written
    pub files: usize,
    /// Hard links recreated with `link(2)`
    pub hard_links: usize,
    /// Link entries written as copies because the filesystem refused `link(2)`
    pub copied_links: usize,
}

/// Writes directory trees into a tar stream, one content entry per inode
#[derive(Debug, Clone, Default)]
pub struct HardlinkArchiver<P = InodeIdentity> {
    identity: P,
}

impl HardlinkArchiver<InodeIdentity> {
    /// Archiver that detects hard links by device and inode
    pub fn new() -> Self {
        Self::default()
    }
}

impl<P: IdentityProvider> HardlinkArchiver<P> {
    /// Use a different identity source, e.g. one without hard-link detection
    pub fn with_identity(identity: P) -> Self {
        Self { identity }
    }

    /// Archive every root in order. Entry names are `<root base name>/<relative path>`.
    ///
    /// Identities are tracked across all roots of the call. Any error aborts the run; a
    /// partially written stream must be discarded by the caller.
    pub fn archive<W, R>(&self, output: W, roots: &[R]) -> Result<ArchiveStats, ArchiveError>
    where
        W: Write,
        R: AsRef<Path>,
    {
        let started = Instant::now();
        let mut stats = ArchiveStats::default();

        let result = self.write_roots(output, roots, &mut stats);
        match &result {
            Ok(()) => info!(
                files = stats.files,
                hard_links = stats.hard_links,
                elapsed = ?started.elapsed(),
                "added to tarball"
            ),
            Err(e) => error!(
                files = stats.files,
                hard_links = stats.hard_links,
                elapsed = ?started.elapsed(),
                error = %e,
                "error adding to tarball"
            ),
        }
        result.map(|()| stats)
    }

    fn write_roots<W, R>(
        &self,
        output: W,
        roots: &[R],
        stats: &mut ArchiveStats,
    ) -> Result<(), ArchiveError>
    where
        W: Write,
        R: AsRef<Path>,
    {
        let mut builder = tar::Builder::new(output);
        let mut tracker = IdentityTracker::new();

        for root in roots {
            let root = root.as_ref();
            let base = root_name(root)?;

            for entry in WalkDir::new(root).sort_by_file_name() {
                let entry = entry?;
                if !entry.file_type().is_file() {
                    if !entry.file_type().is_dir() {
                        debug!(path = %entry.path().display(), "skipping non-regular file");
                    }
                    continue;
                }

                let path = entry.path();
                let name = entry_name(&base, root, path);
                let metadata = entry.metadata()?;
                let identity = self
                    .identity
                    .identify(path, &metadata)
                    .map_err(|e| ArchiveError::io(path, e))?;

                let mut header = Header::new_gnu();
                header.set_metadata_in_mode(&metadata, HeaderMode::Complete);

                if let Some(canonical) = identity.as_ref().and_then(|id| tracker.canonical(id)) {
                    header.set_entry_type(EntryType::Link);
                    header.set_size(0);
                    builder
                        .append_link(&mut header, &name, canonical)
                        .map_err(|e| ArchiveError::io(path, e))?;
                    stats.hard_links += 1;
                    continue;
                }

                let file = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
                builder
                    .append_data(&mut header, &name, file)
                    .map_err(|e| ArchiveError::io(path, e))?;
                if let Some(identity) = identity {
                    tracker.register(identity, name);
                }
                stats.files += 1;
            }
        }

        let mut output = builder
            .into_inner()
            .map_err(|e| ArchiveError::io("<archive>", e))?;
        output
            .flush()
            .map_err(|e| ArchiveError::io("<archive>", e))
    }
}

/// Archive roots with inode-based hard-link detection
pub fn archive_dirs<W, R>(output: W, roots: &[R]) -> Result<ArchiveStats, ArchiveError>
where
    W: Write,
    R: AsRef<Path>,
{
    HardlinkArchiver::new().archive(output, roots)
}

fn root_name(root: &Path) -> Result<String, ArchiveError> {
    let metadata = fs::metadata(root).map_err(|e| ArchiveError::io(root, e))?;
    if !metadata.is_dir() {
        return Err(ArchiveError::NotADirectory {
            path: root.to_path_buf(),
        });
    }
    root.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| ArchiveError::NotADirectory {
            path: root.to_path_buf(),
        })
}

// Always '/'-separated so archives are portable.
fn entry_name(base: &str, root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    let mut name = base.to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}

/// Materialize an archive under `destination`, recreating hard links.
///
/// Content entries become files with their stored mode and mtime. Link entries become
/// hard links to the already extracted target, or byte copies if linking fails.
pub fn extract<R: Read>(input: R, destination: impl AsRef<Path>) -> Result<ExtractStats, ArchiveError> {
    let destination = destination.as_ref();
    let mut stats = ExtractStats::default();

    let mut archive = tar::Archive::new(input);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);

    let entries = archive
        .entries()
        .map_err(|e| ArchiveError::io(destination, e))?;

    for entry in entries {
        let mut entry = entry.map_err(|e| ArchiveError::io(destination, e))?;
        let name = entry
            .path()
            .map_err(|e| ArchiveError::io(destination, e))?
            .into_owned();
        let target = destination.join(safe_relative(&name)?);

        match entry.header().entry_type() {
            EntryType::Regular | EntryType::Continuous => {
                create_parent(&target)?;
                entry
                    .unpack(&target)
                    .map_err(|e| ArchiveError::io(&target, e))?;
                stats.files += 1;
            }
            EntryType::Link => {
                let link = entry
                    .link_name()
                    .map_err(|e| ArchiveError::io(&target, e))?
                    .ok_or_else(|| ArchiveError::corrupt(&name, "hard link without target"))?
                    .into_owned();
                let source = destination.join(safe_relative(&link)?);
                create_parent(&target)?;
                if target.exists() {
                    fs::remove_file(&target).map_err(|e| ArchiveError::io(&target, e))?;
                }
                match fs::hard_link(&source, &target) {
                    Ok(()) => stats.hard_links += 1,
                    Err(e) => {
                        debug!(
                            source = %source.display(),
                            target = %target.display(),
                            error = %e,
                            "hard link failed, copying instead"
                        );
                        fs::copy(&source, &target).map_err(|e| ArchiveError::io(&target, e))?;
                        stats.copied_links += 1;
                    }
                }
            }
            EntryType::Directory => {
                fs::create_dir_all(&target).map_err(|e| ArchiveError::io(&target, e))?;
            }
            EntryType::XGlobalHeader | EntryType::XHeader => {}
            other => {
                return Err(ArchiveError::corrupt(
                    &name,
                    format!("unsupported entry type {:?}", other),
                ));
            }
        }
    }

    info!(
        files = stats.files,
        hard_links = stats.hard_links,
        copied_links = stats.copied_links,
        destination = %destination.display(),
        "extracted tarball"
    );
    Ok(stats)
}

fn create_parent(path: &Path) -> Result<(), ArchiveError> {
    match path.parent() {
        Some(parent) => fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e)),
        None => Ok(()),
    }
}

fn safe_relative(name: &Path) -> Result<PathBuf, ArchiveError> {
    let mut relative = PathBuf::new();
    for component in name.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return Err(ArchiveError::corrupt(name, "path escapes the destination")),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ArchiveError::corrupt(name, "empty path"));
    }
    Ok(relative)
}
