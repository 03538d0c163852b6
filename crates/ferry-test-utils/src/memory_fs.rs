//! In-memory filesystem capability for testing without real I/O.
//!
//! Implements the full `FileSystem` trait over a path map, with fault
//! injection hooks so tests can script transient failures, permission
//! errors, and mid-transfer channel loss at exact byte offsets.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use ferry_core::fs::{
    sort_entries, FileSystem, FsCapabilities, FsEntry, FsMetadata, ReadHandle, WriteHandle,
};
use ferry_core::{path as fpath, Error, Result};

/// Operation kind a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    List,
    Stat,
    OpenRead,
    OpenWrite,
    Rename,
    Remove,
    MkdirAll,
}

/// Error produced by an injected fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Timeout,
    ChannelClosed,
    PermissionDenied,
    QuotaExceeded,
    NotFound,
}

impl FaultKind {
    fn to_error(self, path: &str) -> Error {
        match self {
            FaultKind::Transient => Error::Transient {
                message: format!("injected fault on {path}"),
            },
            FaultKind::Timeout => Error::Timeout,
            FaultKind::ChannelClosed => Error::ChannelClosed,
            FaultKind::PermissionDenied => Error::PermissionDenied {
                path: path.to_string(),
            },
            FaultKind::QuotaExceeded => Error::QuotaExceeded {
                path: path.to_string(),
            },
            FaultKind::NotFound => Error::NotFound {
                path: path.to_string(),
            },
        }
    }
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    mtimes: HashMap<String, u64>,
    clock: u64,
    caps: FsCapabilities,
    faults: HashMap<(FaultOp, String), VecDeque<FaultKind>>,
    /// Channel loss after this many bytes served by the next read handle.
    read_breaks: HashMap<String, u64>,
    /// Channel loss after this many bytes accepted by the next write
    /// handle. Accepted bytes stay written, matching a real half-finished
    /// upload.
    write_breaks: HashMap<String, u64>,
    op_log: Vec<String>,
}

impl State {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn take_fault(&mut self, op: FaultOp, path: &str) -> Option<FaultKind> {
        let queue = self.faults.get_mut(&(op, path.to_string()))?;
        let kind = queue.pop_front();
        if queue.is_empty() {
            self.faults.remove(&(op, path.to_string()));
        }
        kind
    }

    fn has_children(&self, dir: &str) -> bool {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files.keys().any(|p| p.starts_with(&prefix))
            || self.dirs.iter().any(|p| p.starts_with(&prefix))
    }
}

/// In-memory `FileSystem` with fault injection.
#[derive(Debug, Clone)]
pub struct MemoryFs {
    state: Arc<Mutex<State>>,
}

impl MemoryFs {
    /// Create an empty filesystem with ranged-resume support enabled.
    pub fn new() -> Self {
        let mut state = State {
            caps: FsCapabilities { range_resume: true },
            ..State::default()
        };
        state.dirs.insert("/".to_string());
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Toggle ranged-resume support.
    pub fn set_range_resume(&self, enabled: bool) {
        self.state.lock().unwrap().caps.range_resume = enabled;
    }

    /// Create a file (and its parent directories) with the given contents.
    pub fn add_file(&self, path: &str, contents: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        let mut dir = fpath::parent(path);
        loop {
            state.dirs.insert(dir.clone());
            if dir == "/" {
                break;
            }
            dir = fpath::parent(&dir);
        }
        let now = state.tick();
        state.files.insert(path.to_string(), contents.into());
        state.mtimes.insert(path.to_string(), now);
    }

    /// Create a directory and its parents.
    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let mut dir = path.to_string();
        loop {
            state.dirs.insert(dir.clone());
            if dir == "/" {
                break;
            }
            dir = fpath::parent(&dir);
        }
    }

    /// Contents of a file, if present.
    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    /// Whether a file or directory exists.
    pub fn has_path(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.files.contains_key(path) || state.dirs.contains(path)
    }

    /// All file paths, sorted.
    pub fn file_paths(&self) -> Vec<String> {
        self.state.lock().unwrap().files.keys().cloned().collect()
    }

    /// Inject `times` consecutive failures for `op` on `path`.
    pub fn fail_next(&self, op: FaultOp, path: &str, kind: FaultKind, times: usize) {
        let mut state = self.state.lock().unwrap();
        state
            .faults
            .entry((op, path.to_string()))
            .or_default()
            .extend(std::iter::repeat(kind).take(times));
    }

    /// Drop the channel after the next read handle on `path` has served
    /// this many bytes.
    pub fn interrupt_read_after(&self, path: &str, bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .read_breaks
            .insert(path.to_string(), bytes);
    }

    /// Drop the channel after the next write handle on `path` has accepted
    /// this many bytes. The accepted bytes remain written.
    pub fn interrupt_write_after(&self, path: &str, bytes: u64) {
        self.state
            .lock()
            .unwrap()
            .write_breaks
            .insert(path.to_string(), bytes);
    }

    /// Recorded operations, in order.
    pub fn op_log(&self) -> Vec<String> {
        self.state.lock().unwrap().op_log.clone()
    }
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryRead {
    state: Arc<Mutex<State>>,
    path: String,
    pos: u64,
    break_after: Option<u64>,
    served: u64,
}

#[async_trait]
impl ReadHandle for MemoryRead {
    async fn read_chunk(&mut self, max_len: usize) -> Result<Bytes> {
        if let Some(limit) = self.break_after {
            if self.served >= limit {
                // One-shot: the next open succeeds, like a reconnect.
                self.state.lock().unwrap().read_breaks.remove(&self.path);
                return Err(Error::ChannelClosed);
            }
        }
        let state = self.state.lock().unwrap();
        let data = state.files.get(&self.path).ok_or_else(|| Error::NotFound {
            path: self.path.clone(),
        })?;
        let start = (self.pos as usize).min(data.len());
        let mut end = (start + max_len).min(data.len());
        if let Some(limit) = self.break_after {
            let allowed = (limit - self.served) as usize;
            end = end.min(start + allowed);
        }
        let chunk = Bytes::copy_from_slice(&data[start..end]);
        drop(state);

        self.pos += chunk.len() as u64;
        self.served += chunk.len() as u64;
        Ok(chunk)
    }
}

struct MemoryWrite {
    state: Arc<Mutex<State>>,
    path: String,
    pos: u64,
    break_after: Option<u64>,
    accepted: u64,
}

#[async_trait]
impl WriteHandle for MemoryWrite {
    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let mut take = data.len();
        let mut fail_after = false;
        if let Some(limit) = self.break_after {
            let allowed = (limit.saturating_sub(self.accepted)) as usize;
            if take >= allowed {
                take = allowed;
                fail_after = true;
            }
        }

        {
            let mut state = self.state.lock().unwrap();
            let now = state.tick();
            let file = state.files.entry(self.path.clone()).or_default();
            let start = self.pos as usize;
            if file.len() < start {
                file.resize(start, 0);
            }
            let end = start + take;
            if file.len() < end {
                file.resize(end, 0);
            }
            file[start..end].copy_from_slice(&data[..take]);
            state.mtimes.insert(self.path.clone(), now);
        }

        self.pos += take as u64;
        self.accepted += take as u64;

        if fail_after {
            self.state.lock().unwrap().write_breaks.remove(&self.path);
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl FileSystem for MemoryFs {
    async fn list(&self, dir: &str) -> Result<Vec<FsEntry>> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::List, dir) {
            return Err(kind.to_error(dir));
        }
        if !state.dirs.contains(dir) {
            return Err(Error::NotFound {
                path: dir.to_string(),
            });
        }

        let prefix = if dir == "/" {
            "/".to_string()
        } else {
            format!("{dir}/")
        };
        let mut entries = Vec::new();
        for (p, data) in &state.files {
            if let Some(rest) = p.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(FsEntry {
                        name: rest.to_string(),
                        path: p.clone(),
                        is_dir: false,
                        size: data.len() as u64,
                        mtime: state.mtimes.get(p).copied().unwrap_or(0),
                    });
                }
            }
        }
        for d in &state.dirs {
            if let Some(rest) = d.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') {
                    entries.push(FsEntry {
                        name: rest.to_string(),
                        path: d.clone(),
                        is_dir: true,
                        size: 0,
                        mtime: 0,
                    });
                }
            }
        }
        sort_entries(&mut entries);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FsMetadata> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::Stat, path) {
            return Err(kind.to_error(path));
        }
        if let Some(data) = state.files.get(path) {
            return Ok(FsMetadata {
                size: data.len() as u64,
                mtime: state.mtimes.get(path).copied().unwrap_or(0),
                is_dir: false,
            });
        }
        if state.dirs.contains(path) {
            return Ok(FsMetadata {
                size: 0,
                mtime: 0,
                is_dir: true,
            });
        }
        Err(Error::NotFound {
            path: path.to_string(),
        })
    }

    async fn open_read(&self, path: &str, offset: u64) -> Result<Box<dyn ReadHandle>> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::OpenRead, path) {
            return Err(kind.to_error(path));
        }
        if !state.files.contains_key(path) {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        state.op_log.push(format!("open_read {path} offset={offset}"));
        let break_after = state.read_breaks.get(path).copied();
        Ok(Box::new(MemoryRead {
            state: Arc::clone(&self.state),
            path: path.to_string(),
            pos: offset,
            break_after,
            served: 0,
        }))
    }

    async fn open_write(
        &self,
        path: &str,
        offset: u64,
        truncate: bool,
    ) -> Result<Box<dyn WriteHandle>> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::OpenWrite, path) {
            return Err(kind.to_error(path));
        }
        let parent = fpath::parent(path);
        if !state.dirs.contains(&parent) {
            return Err(Error::NotFound { path: parent });
        }
        state
            .op_log
            .push(format!("open_write {path} offset={offset} truncate={truncate}"));
        if truncate {
            let now = state.tick();
            state.files.insert(path.to_string(), Vec::new());
            state.mtimes.insert(path.to_string(), now);
        }
        let break_after = state.write_breaks.get(path).copied();
        Ok(Box::new(MemoryWrite {
            state: Arc::clone(&self.state),
            path: path.to_string(),
            pos: offset,
            break_after,
            accepted: 0,
        }))
    }

    async fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::Rename, src) {
            return Err(kind.to_error(src));
        }
        state.op_log.push(format!("rename {src} -> {dst}"));

        if let Some(data) = state.files.remove(src) {
            let mtime = state.mtimes.remove(src).unwrap_or(0);
            state.files.insert(dst.to_string(), data);
            state.mtimes.insert(dst.to_string(), mtime);
            return Ok(());
        }
        if state.dirs.remove(src) {
            state.dirs.insert(dst.to_string());
            let prefix = format!("{}/", src.trim_end_matches('/'));
            let moved: Vec<(String, Vec<u8>)> = state
                .files
                .iter()
                .filter(|(p, _)| p.starts_with(&prefix))
                .map(|(p, d)| (p.clone(), d.clone()))
                .collect();
            for (p, d) in moved {
                state.files.remove(&p);
                let new_path = format!("{}{}", dst, &p[src.len()..]);
                state.files.insert(new_path, d);
            }
            let moved_dirs: Vec<String> = state
                .dirs
                .iter()
                .filter(|p| p.starts_with(&prefix))
                .cloned()
                .collect();
            for p in moved_dirs {
                state.dirs.remove(&p);
                state.dirs.insert(format!("{}{}", dst, &p[src.len()..]));
            }
            return Ok(());
        }
        Err(Error::NotFound {
            path: src.to_string(),
        })
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::Remove, path) {
            return Err(kind.to_error(path));
        }
        state.op_log.push(format!("remove {path}"));

        if state.files.remove(path).is_some() {
            state.mtimes.remove(path);
            return Ok(());
        }
        if state.dirs.contains(path) {
            if state.has_children(path) {
                return Err(Error::PathUnavailable {
                    path: path.to_string(),
                    message: "directory not empty".to_string(),
                });
            }
            state.dirs.remove(path);
            return Ok(());
        }
        Err(Error::NotFound {
            path: path.to_string(),
        })
    }

    async fn mkdir_all(&self, path: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.take_fault(FaultOp::MkdirAll, path) {
            return Err(kind.to_error(path));
        }
        if state.files.contains_key(path) {
            return Err(Error::PathUnavailable {
                path: path.to_string(),
                message: "a file exists at this path".to_string(),
            });
        }
        let mut dir = path.to_string();
        loop {
            state.dirs.insert(dir.clone());
            if dir == "/" {
                break;
            }
            dir = fpath::parent(&dir);
        }
        Ok(())
    }

    fn capabilities(&self) -> FsCapabilities {
        self.state.lock().unwrap().caps
    }
}
