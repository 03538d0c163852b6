//! Batches: ordered groups of tasks submitted as one operator action.

use std::time::SystemTime;

use crate::conflict::ConflictPolicy;
use crate::task::{BatchId, TaskId, TaskState, TransferTask};

/// Overall state of a batch, derived from its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    /// No task has started yet.
    Queued,
    /// At least one task is running, or some have finished while others
    /// wait.
    InProgress,
    /// Nothing is running and at least one task is parked resumable.
    Paused,
    /// Every task completed.
    Completed,
    /// Every task is terminal but some failed; per-task errors carry the
    /// details.
    CompletedWithErrors,
    /// Every task is terminal, none failed, at least one was cancelled.
    Cancelled,
}

impl BatchState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchState::Completed | BatchState::CompletedWithErrors | BatchState::Cancelled
        )
    }
}

/// Derive the batch state from task states.
pub fn derive_state(tasks: &[TaskState]) -> BatchState {
    if tasks.iter().all(|s| s.is_terminal()) {
        if tasks.iter().all(|s| *s == TaskState::Completed) {
            return BatchState::Completed;
        }
        if tasks.iter().any(|s| *s == TaskState::Failed) {
            return BatchState::CompletedWithErrors;
        }
        return BatchState::Cancelled;
    }
    if tasks.iter().any(|s| *s == TaskState::InProgress) {
        return BatchState::InProgress;
    }
    if tasks.iter().any(|s| s.is_terminal()) {
        // Partially done, nothing currently claimed.
        return BatchState::InProgress;
    }
    if tasks.iter().any(|s| *s == TaskState::Paused) {
        return BatchState::Paused;
    }
    BatchState::Queued
}

/// An ordered group of tasks admitted together.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    /// Short operator-facing description ("copying", "undo", ...).
    pub label: String,
    pub tasks: Vec<TransferTask>,
    pub created_at: SystemTime,
    /// Default conflict policy; starts as the operator's choice and is
    /// promoted by an apply-to-all prompt answer.
    pub policy: ConflictPolicy,
    /// Whether completed Move tasks feed the undo ledger. Undo batches do
    /// not record a new undo set.
    pub record_undo: bool,
}

impl Batch {
    pub fn new(id: BatchId, label: impl Into<String>, policy: ConflictPolicy) -> Self {
        Self {
            id,
            label: label.into(),
            tasks: Vec::new(),
            created_at: SystemTime::now(),
            policy,
            record_undo: true,
        }
    }

    /// Append a task, assigning the next sequence number.
    pub fn push_task(
        &mut self,
        verb: crate::task::Verb,
        source: crate::task::SidedPath,
        destination: Option<crate::task::SidedPath>,
    ) -> &mut TransferTask {
        let seq = self.tasks.len() as u32;
        let id = TaskId { batch: self.id, seq };
        self.tasks.push(TransferTask::new(id, verb, source, destination));
        self.tasks.last_mut().unwrap()
    }

    /// Current derived state.
    pub fn state(&self) -> BatchState {
        derive_state(&self.tasks.iter().map(|t| t.state).collect::<Vec<_>>())
    }

    pub fn task(&self, seq: u32) -> Option<&TransferTask> {
        self.tasks.get(seq as usize)
    }

    pub fn task_mut(&mut self, seq: u32) -> Option<&mut TransferTask> {
        self.tasks.get_mut(seq as usize)
    }
}

/// Point-in-time copy of a batch for reporting.
#[derive(Debug, Clone)]
pub struct BatchSnapshot {
    pub id: BatchId,
    pub label: String,
    pub state: BatchState,
    pub tasks: Vec<TaskSnapshot>,
}

/// Point-in-time copy of one task for reporting.
#[derive(Debug, Clone)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub verb: crate::task::Verb,
    pub source: crate::task::SidedPath,
    pub destination: Option<crate::task::SidedPath>,
    pub state: TaskState,
    pub size_bytes: Option<u64>,
    pub bytes_transferred: u64,
    pub skipped: bool,
    pub last_error: Option<String>,
}

impl BatchSnapshot {
    pub fn of(batch: &Batch) -> Self {
        Self {
            id: batch.id,
            label: batch.label.clone(),
            state: batch.state(),
            tasks: batch
                .tasks
                .iter()
                .map(|t| TaskSnapshot {
                    id: t.id,
                    verb: t.verb,
                    source: t.source.clone(),
                    destination: t.destination.clone(),
                    state: t.state,
                    size_bytes: t.size_bytes,
                    bytes_transferred: t.bytes_transferred,
                    skipped: t.skipped,
                    last_error: t.last_error.clone(),
                })
                .collect(),
        }
    }

    /// Tasks that ended in failure, with their recorded errors.
    pub fn failures(&self) -> Vec<&TaskSnapshot> {
        self.tasks
            .iter()
            .filter(|t| t.state == TaskState::Failed)
            .collect()
    }
}
