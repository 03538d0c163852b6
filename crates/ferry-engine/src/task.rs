//! Transfer task data model.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use ferry_core::FileSystem;

/// Which side of the channel a path lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// The operator's workstation.
    Local,
    /// The remote host behind the secure channel.
    Remote,
}

/// An absolute, normalized path on one side of the channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SidedPath {
    pub side: Side,
    pub path: String,
}

impl SidedPath {
    /// A path on the workstation.
    pub fn local(path: impl AsRef<str>) -> Self {
        Self {
            side: Side::Local,
            path: ferry_core::path::normalize(path.as_ref()),
        }
    }

    /// A path on the remote host.
    pub fn remote(path: impl AsRef<str>) -> Self {
        Self {
            side: Side::Remote,
            path: ferry_core::path::normalize(path.as_ref()),
        }
    }

    /// Same side, different path.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            side: self.side,
            path: path.into(),
        }
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        ferry_core::path::file_name(&self.path)
    }

    /// Parent directory on the same side.
    pub fn parent(&self) -> Self {
        self.with_path(ferry_core::path::parent(&self.path))
    }
}

impl fmt::Display for SidedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.side {
            Side::Local => write!(f, "local:{}", self.path),
            Side::Remote => write!(f, "remote:{}", self.path),
        }
    }
}

/// The filesystem capabilities handed to the engine, one per side.
#[derive(Clone)]
pub struct Sides {
    pub local: Arc<dyn FileSystem>,
    pub remote: Arc<dyn FileSystem>,
}

impl Sides {
    pub fn new(local: Arc<dyn FileSystem>, remote: Arc<dyn FileSystem>) -> Self {
        Self { local, remote }
    }

    /// The capability for one side.
    pub fn fs(&self, side: Side) -> &Arc<dyn FileSystem> {
        match side {
            Side::Local => &self.local,
            Side::Remote => &self.remote,
        }
    }
}

/// What a task does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Copy,
    Move,
    Delete,
}

/// Opaque batch identity, unique per operator-initiated operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub u64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Task identity: batch plus position within the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId {
    pub batch: BatchId,
    pub seq: u32,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.batch, self.seq)
    }
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting to be claimed by a worker.
    Queued,
    /// Claimed; bytes are moving.
    InProgress,
    /// Interrupted (channel loss or operator pause); resumable.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished unsuccessfully after exhausting retries.
    Failed,
    /// Stopped by operator request.
    Cancelled,
}

impl TaskState {
    /// Terminal states never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Queued, InProgress)
                | (Queued, Paused)
                | (Queued, Cancelled)
                | (Queued, Completed) // admission-time skip decision
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Paused)
                | (Paused, InProgress)
                | (Paused, Cancelled)
        )
    }
}

/// One source-to-destination operation with its own state and resume
/// offset.
#[derive(Debug, Clone)]
pub struct TransferTask {
    pub id: TaskId,
    pub verb: Verb,
    pub source: SidedPath,
    /// Absent for Delete.
    pub destination: Option<SidedPath>,
    /// The source is a directory; copy means create the destination
    /// directory, no bytes move.
    pub source_is_dir: bool,
    pub state: TaskState,
    /// Unknown until the source stat completes.
    pub size_bytes: Option<u64>,
    pub bytes_transferred: u64,
    /// Byte position a resumed transfer continues from.
    pub resume_offset: u64,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Completed by skipping (conflict decision), not by transferring.
    pub skipped: bool,
    /// Only claimable once every task with seq <= after_seq is terminal.
    pub after_seq: Option<u32>,
    /// Operator asked for cancellation; observed between chunks.
    pub cancel_requested: bool,
    /// Operator asked for a pause; observed between chunks.
    pub pause_requested: bool,
    /// Operator asked a paused task to continue.
    pub resume_requested: bool,
}

impl TransferTask {
    pub fn new(id: TaskId, verb: Verb, source: SidedPath, destination: Option<SidedPath>) -> Self {
        Self {
            id,
            verb,
            source,
            destination,
            source_is_dir: false,
            state: TaskState::Queued,
            size_bytes: None,
            bytes_transferred: 0,
            resume_offset: 0,
            attempts: 0,
            last_error: None,
            skipped: false,
            after_seq: None,
            cancel_requested: false,
            pause_requested: false,
            resume_requested: false,
        }
    }

    /// Record the source size once known, clamping any stale progress.
    pub fn set_size(&mut self, size: u64) {
        self.size_bytes = Some(size);
        self.bytes_transferred = self.bytes_transferred.min(size);
    }

    /// Record transferred bytes. Progress never exceeds the known size and
    /// the resume offset never moves backwards while in progress.
    pub fn record_progress(&mut self, bytes_transferred: u64, resume_offset: u64) {
        let capped = match self.size_bytes {
            Some(size) => bytes_transferred.min(size),
            None => bytes_transferred,
        };
        self.bytes_transferred = capped;
        self.resume_offset = self.resume_offset.max(resume_offset);
    }

    /// Restart from scratch: a stale partial destination was discarded.
    pub fn reset_progress(&mut self) {
        self.bytes_transferred = 0;
        self.resume_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> TransferTask {
        TransferTask::new(
            TaskId {
                batch: BatchId(1),
                seq: 0,
            },
            Verb::Copy,
            SidedPath::remote("/scratch/a.dat"),
            Some(SidedPath::remote("/scratch/b.dat")),
        )
    }

    #[test]
    fn sided_path_normalizes() {
        let p = SidedPath::remote("/scratch//sub/../a.dat");
        assert_eq!(p.path, "/scratch/a.dat");
        assert_eq!(p.file_name(), "a.dat");
        assert_eq!(p.parent().path, "/scratch");
        assert_eq!(p.to_string(), "remote:/scratch/a.dat");
    }

    #[test]
    fn progress_capped_by_size() {
        let mut t = task();
        t.set_size(100);
        t.record_progress(250, 250);
        assert_eq!(t.bytes_transferred, 100);
    }

    #[test]
    fn resume_offset_is_monotonic() {
        let mut t = task();
        t.record_progress(50, 50);
        t.record_progress(40, 40);
        assert_eq!(t.resume_offset, 50);

        t.reset_progress();
        assert_eq!(t.resume_offset, 0);
    }

    #[test]
    fn late_size_clamps_existing_progress() {
        let mut t = task();
        t.record_progress(500, 500);
        t.set_size(300);
        assert_eq!(t.bytes_transferred, 300);
    }

    #[test]
    fn state_machine_transitions() {
        use TaskState::*;
        assert!(Queued.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Paused));
        assert!(Paused.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));

        assert!(!Completed.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(!Paused.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
    }
}
