//! Filesystem identity used to detect hard links while archiving

use std::collections::HashMap;
use std::fs::Metadata;
use std::io;
use std::path::Path;

/// Opaque identity of the inode behind a directory entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    device: u64,
    inode: u64,
}

impl FileIdentity {
    /// Identity from device and inode numbers
    pub fn new(device: u64, inode: u64) -> Self {
        Self { device, inode }
    }
}

/// Capability that tells which files share content on disk.
///
/// Returning `None` means identity is unknown and the file is always archived as content.
pub trait IdentityProvider: Send + Sync {
    /// Identity of the file at `path`, or `None` when unknown
    fn identify(&self, path: &Path, metadata: &Metadata) -> io::Result<Option<FileIdentity>>;
}

/// Device and inode numbers from `stat(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct InodeIdentity;

#[cfg(unix)]
impl IdentityProvider for InodeIdentity {
    fn identify(&self, _path: &Path, metadata: &Metadata) -> io::Result<Option<FileIdentity>> {
        use std::os::unix::fs::MetadataExt;

        Ok(Some(FileIdentity::new(metadata.dev(), metadata.ino())))
    }
}

#[cfg(not(unix))]
impl IdentityProvider for InodeIdentity {
    fn identify(&self, _path: &Path, _metadata: &Metadata) -> io::Result<Option<FileIdentity>> {
        Ok(None)
    }
}

/// First archive path seen for every identity within one archive run
#[derive(Debug, Default)]
pub struct IdentityTracker {
    canonical: HashMap<FileIdentity, String>,
}

impl IdentityTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Path already holding the content for `identity`, if any
    pub fn canonical(&self, identity: &FileIdentity) -> Option<&str> {
        self.canonical.get(identity).map(String::as_str)
    }

    /// Record `name` as the content holder. The first registration wins.
    pub fn register(&mut self, identity: FileIdentity, name: impl Into<String>) {
        self.canonical.entry(identity).or_insert_with(|| name.into());
    }

    /// Number of distinct identities seen
    pub fn len(&self) -> usize {
        self.canonical.len()
    }

    /// Whether nothing has been registered
    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}
