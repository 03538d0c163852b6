//! Local-disk implementation of the filesystem capability.
//!
//! Covers the workstation side of a transfer. Capability paths map onto an
//! optional root directory, which keeps tests hermetic and lets a host
//! application sandbox the engine to a download directory.

use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::fs::{sort_entries, FileSystem, FsCapabilities, FsEntry, FsMetadata, ReadHandle, WriteHandle};

/// Filesystem capability backed by the local disk via `tokio::fs`.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: Option<PathBuf>,
}

impl LocalFs {
    /// Capability over the whole local filesystem; capability paths are
    /// used as absolute platform paths.
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Capability rooted at `root`; capability path `/a/b` maps to
    /// `root/a/b`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        match &self.root {
            Some(root) => root.join(path.trim_start_matches('/')),
            None => PathBuf::from(path),
        }
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new()
    }
}

fn map_io_error(err: std::io::Error, path: &str) -> Error {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::NotFound => Error::NotFound { path: path.to_string() },
        ErrorKind::PermissionDenied => Error::PermissionDenied { path: path.to_string() },
        ErrorKind::StorageFull | ErrorKind::QuotaExceeded => {
            Error::QuotaExceeded { path: path.to_string() }
        }
        ErrorKind::ReadOnlyFilesystem => Error::ReadOnlyFilesystem { path: path.to_string() },
        ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(err),
    }
}

fn mtime_secs(meta: &std::fs::Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct LocalRead {
    file: File,
    path: String,
}

#[async_trait]
impl ReadHandle for LocalRead {
    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        let mut buf = vec![0u8; max_len];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| map_io_error(e, &self.path))?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

struct LocalWrite {
    file: File,
    path: String,
}

#[async_trait]
impl WriteHandle for LocalWrite {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| map_io_error(e, &self.path))
    }

    async fn finish(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| map_io_error(e, &self.path))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| map_io_error(e, &self.path))
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    async fn list(&self, dir: &str) -> Result<Vec<FsEntry>> {
        let resolved = self.resolve(dir);
        let mut rd = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|e| map_io_error(e, dir))?;

        let mut entries = Vec::new();
        while let Some(entry) = rd.next_entry().await.map_err(|e| map_io_error(e, dir))? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await.map_err(|e| map_io_error(e, dir))?;
            entries.push(FsEntry {
                path: crate::path::join(dir, &name),
                name,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                mtime: mtime_secs(&meta),
            });
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FsMetadata> {
        let meta = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|e| map_io_error(e, path))?;
        Ok(FsMetadata {
            size: if meta.is_dir() { 0 } else { meta.len() },
            mtime: mtime_secs(&meta),
            is_dir: meta.is_dir(),
        })
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadHandle>> {
        let mut file = File::open(self.resolve(path))
            .await
            .map_err(|e| map_io_error(e, path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| map_io_error(e, path))?;
        }
        Ok(Box::new(LocalRead {
            file,
            path: path.to_string(),
        }))
    }

    async fn open_write(
        &self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> Result<Box<dyn WriteHandle>> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(self.resolve(path))
            .await
            .map_err(|e| map_io_error(e, path))?;
        if offset > 0 {
            file.seek(std::io::SeekFrom::Start(offset))
                .await
                .map_err(|e| map_io_error(e, path))?;
        }
        Ok(Box::new(LocalWrite {
            file,
            path: path.to_string(),
        }))
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        tokio::fs::rename(self.resolve(src), self.resolve(dst))
            .await
            .map_err(|e| map_io_error(e, src))
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let resolved = self.resolve(path);
        let meta = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| map_io_error(e, path))?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&resolved)
                .await
                .map_err(|e| map_io_error(e, path))
        } else {
            tokio::fs::remove_file(&resolved)
                .await
                .map_err(|e| map_io_error(e, path))
        }
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        tokio::fs::create_dir_all(self.resolve(path))
            .await
            .map_err(|e| map_io_error(e, path))
    }

    fn capabilities(&self) -> FsCapabilities {
        FsCapabilities { range_resume: true }
    }
}
