//! Filesystem capability consumed by the transfer engine.
//!
//! The engine never talks to a disk or a network channel directly; it is
//! handed one `FileSystem` per side (workstation, remote host) at
//! construction. The remote implementation lives with the session layer
//! that owns the secure channel; [`crate::local::LocalFs`] covers the
//! workstation side.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// Metadata for a single path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsMetadata {
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// Modification time, unix epoch seconds.
    pub mtime: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    /// Entry name without any path components.
    pub name: String,
    /// Absolute path of the entry.
    pub path: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
    /// Size in bytes; 0 for directories.
    pub size: u64,
    /// Modification time, unix epoch seconds.
    pub mtime: u64,
}

/// Optional capabilities a filesystem implementation may offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FsCapabilities {
    /// Ranged reads and offset writes are supported, enabling byte-level
    /// resume of interrupted transfers. Without it every interrupted
    /// transfer restarts from offset 0.
    pub range_resume: bool,
}

/// Streaming read handle.
#[async_trait]
pub trait ReadHandle: Send {
    /// Read the next chunk, at most `max_len` bytes. An empty chunk
    /// signals end of file.
    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes>;
}

/// Streaming write handle.
#[async_trait]
pub trait WriteHandle: Send {
    /// Append a chunk at the current position.
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()>;

    /// Flush buffered data and make it durable.
    async fn finish(&mut self) -> Result<()>;
}

/// The filesystem capability.
///
/// All paths are absolute, normalized, `/`-separated. Every operation is
/// fallible with a condition from [`crate::Error`] distinguishing
/// not-found, permission, quota, transient, and unsupported failures.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// List the entries of a directory, directories first, then by name.
    async fn list(&self, dir: &str) -> Result<Vec<FsEntry>>;

    /// Stat a single path.
    async fn stat(&self, path: &str) -> Result<FsMetadata>;

    /// Open a file for reading, positioned at `offset`.
    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadHandle>>;

    /// Open a file for writing, positioned at `offset`. With `truncate`
    /// any existing content is discarded first.
    async fn open_write(
        &self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> Result<Box<dyn WriteHandle>>;

    /// Atomically rename `src` to `dst`.
    async fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Remove a file or an *empty* directory. Directory trees are removed
    /// entry by entry, deepest first, by the caller.
    async fn remove(&self, path: &str) -> Result<()>;

    /// Create a directory and any missing parents.
    async fn mkdir_all(&self, path: &str) -> Result<()>;

    /// Capabilities of this implementation.
    fn capabilities(&self) -> FsCapabilities;

    /// Whether the path exists. Default implementation goes through
    /// [`FileSystem::stat`].
    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(crate::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Sort a listing the way directory panels expect it: directories first,
/// then case-insensitive by name.
pub fn sort_entries(entries: &mut [FsEntry]) {
    entries.sort_by(|a, b| {
        (!a.is_dir, a.name.to_lowercase()).cmp(&(!b.is_dir, b.name.to_lowercase()))
    });
}
