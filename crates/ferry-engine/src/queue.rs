//! The transfer queue: ordered backlog and single owner of task state.
//!
//! Every state transition happens under the queue lock, driven either by a
//! worker reporting an execution outcome or by an operator request. Workers
//! claim one task at a time; claims follow batch admission order (FIFO
//! across batches) and sequence order within a batch, with per-task
//! watermarks holding back work that must wait for earlier tasks to settle
//! (deepest-first deletes, delete-after-copy of cross-side moves).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tracing::{debug, warn};

use ferry_core::Error;

use crate::batch::{Batch, BatchSnapshot, BatchState};
use crate::progress::{TaskEvent, TaskEventSender};
use crate::resume::ResumeStateStore;
use crate::task::{BatchId, SidedPath, TaskId, TaskState, TransferTask, Verb};
use crate::undo::UndoLedger;

/// Everything a worker needs to execute one claimed task.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub verb: Verb,
    pub source: SidedPath,
    pub destination: Option<SidedPath>,
    pub source_is_dir: bool,
    pub resume_offset: u64,
}

/// What a worker observed between chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Cancel,
    Pause,
}

/// Final outcome of one task execution.
#[derive(Debug)]
pub enum TaskOutcome {
    Completed { bytes: u64 },
    Failed { error: Error },
    /// Channel loss or exhausted retries with a valid partial: parked
    /// resumable.
    Interrupted { resume_offset: u64 },
    /// Operator pause honored at a chunk boundary.
    Paused { resume_offset: u64 },
    Cancelled,
}

/// A task whose partial destination needs cleanup after an off-worker
/// cancellation (it was Paused, nobody is running it).
#[derive(Debug, Clone)]
pub struct OrphanedPartial {
    pub destination: SidedPath,
}

struct QueueInner {
    order: Vec<BatchId>,
    batches: HashMap<BatchId, Batch>,
    /// Resume offset at the last durable checkpoint, per in-progress task.
    checkpoints: HashMap<TaskId, u64>,
    shutdown: bool,
}

/// Ordered, mutable backlog of tasks grouped into batches.
pub struct TransferQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    events: TaskEventSender,
    store: Arc<ResumeStateStore>,
    ledger: Arc<UndoLedger>,
    completion: watch::Sender<u64>,
    checkpoint_bytes: u64,
}

impl TransferQueue {
    pub fn new(
        events: TaskEventSender,
        store: Arc<ResumeStateStore>,
        ledger: Arc<UndoLedger>,
        checkpoint_bytes: u64,
    ) -> Arc<Self> {
        let (completion, _) = watch::channel(0);
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                order: Vec::new(),
                batches: HashMap::new(),
                checkpoints: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
            events,
            store,
            ledger,
            completion,
            checkpoint_bytes,
        })
    }

    /// Admit a planned batch. Tasks already settled at admission (skip
    /// decisions) are announced as completed; everything else is
    /// checkpointed as pending.
    pub fn admit(&self, batch: Batch) {
        let mut inner = self.inner.lock().unwrap();
        self.events.emit(TaskEvent::BatchAdmitted {
            batch: batch.id,
            label: batch.label.clone(),
            files_total: batch.tasks.len() as u64,
        });

        for task in &batch.tasks {
            if task.state == TaskState::Completed {
                self.events.emit(TaskEvent::SizeKnown { id: task.id, size: 0 });
                self.events.emit(TaskEvent::StateChanged {
                    id: task.id,
                    state: TaskState::Completed,
                    error: None,
                });
            } else if let Err(e) = self.store.checkpoint(task) {
                warn!(task = %task.id, error = %e, "checkpoint failed at admission");
            }
        }

        debug!(batch = %batch.id, tasks = batch.tasks.len(), label = %batch.label, "batch admitted");
        let id = batch.id;
        inner.order.push(id);
        inner.batches.insert(id, batch);
        self.finish_if_terminal(&mut inner, id);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Claim the next ready task, or `None` once the queue shuts down.
    pub async fn claim_next(&self) -> Option<ClaimedTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock().unwrap();
                if inner.shutdown {
                    return None;
                }
                if let Some(claim) = self.try_claim(&mut inner) {
                    return Some(claim);
                }
            }

            notified.await;
        }
    }

    fn try_claim(&self, inner: &mut QueueInner) -> Option<ClaimedTask> {
        let order = inner.order.clone();
        for batch_id in order {
            let Some(batch) = inner.batches.get_mut(&batch_id) else {
                continue;
            };
            if batch.state().is_terminal() {
                continue;
            }
            let states: Vec<TaskState> = batch.tasks.iter().map(|t| t.state).collect();
            for idx in 0..batch.tasks.len() {
                let claimable = {
                    let task = &batch.tasks[idx];
                    let ready = match task.state {
                        TaskState::Queued => true,
                        TaskState::Paused => task.resume_requested,
                        _ => false,
                    };
                    let unblocked = match task.after_seq {
                        Some(after) => states
                            .iter()
                            .take(after as usize + 1)
                            .all(|s| s.is_terminal()),
                        None => true,
                    };
                    ready && unblocked
                };
                if !claimable {
                    continue;
                }

                let task = &mut batch.tasks[idx];
                task.state = TaskState::InProgress;
                task.resume_requested = false;
                self.events.emit(TaskEvent::StateChanged {
                    id: task.id,
                    state: TaskState::InProgress,
                    error: None,
                });
                inner.checkpoints.insert(task.id, task.resume_offset);
                let task = &batch.tasks[idx];
                return Some(ClaimedTask {
                    id: task.id,
                    verb: task.verb,
                    source: task.source.clone(),
                    destination: task.destination.clone(),
                    source_is_dir: task.source_is_dir,
                    resume_offset: task.resume_offset,
                });
            }
        }
        None
    }

    /// Record the source size once the worker's stat completes.
    pub fn set_size(&self, id: TaskId, size: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = task_mut(&mut inner, id) {
            task.set_size(size);
            self.events.emit(TaskEvent::SizeKnown { id, size });
            if let Err(e) = self.store.checkpoint(task) {
                warn!(task = %id, error = %e, "size checkpoint failed");
            }
        }
    }

    /// Record byte progress; checkpoints durably every
    /// `checkpoint_bytes` of forward motion.
    pub fn update_progress(&self, id: TaskId, bytes_transferred: u64, resume_offset: u64) {
        let mut inner = self.inner.lock().unwrap();
        let checkpoint_due = {
            let Some(task) = task_mut(&mut inner, id) else {
                return;
            };
            task.record_progress(bytes_transferred, resume_offset);
            self.events.emit(TaskEvent::Bytes {
                id,
                bytes_transferred,
            });
            let last = inner.checkpoints.get(&id).copied().unwrap_or(0);
            resume_offset.saturating_sub(last) >= self.checkpoint_bytes
        };
        if checkpoint_due {
            inner.checkpoints.insert(id, resume_offset);
            if let Some(task) = task_ref(&inner, id) {
                if let Err(e) = self.store.checkpoint(task) {
                    warn!(task = %id, error = %e, "progress checkpoint failed");
                }
            }
        }
    }

    /// The transfer restarted from offset zero (stale partial discarded).
    pub fn reset_progress(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = task_mut(&mut inner, id) {
            task.reset_progress();
            self.events.emit(TaskEvent::Bytes {
                id,
                bytes_transferred: 0,
            });
        }
        inner.checkpoints.insert(id, 0);
    }

    /// What the worker should do at the next chunk boundary.
    pub fn control(&self, id: TaskId) -> TaskControl {
        let inner = self.inner.lock().unwrap();
        match task_ref(&inner, id) {
            Some(task) if task.cancel_requested => TaskControl::Cancel,
            Some(task) if task.pause_requested => TaskControl::Pause,
            Some(_) => TaskControl::Continue,
            // The batch disappeared (cancelled wholesale); stop writing.
            None => TaskControl::Cancel,
        }
    }

    /// A worker finished executing a task.
    pub fn report(&self, id: TaskId, outcome: TaskOutcome) {
        let mut inner = self.inner.lock().unwrap();
        let record_undo = inner
            .batches
            .get(&id.batch)
            .map(|b| b.record_undo)
            .unwrap_or(false);

        let Some(task) = task_mut(&mut inner, id) else {
            return;
        };

        let (next, error_text) = match &outcome {
            TaskOutcome::Completed { .. } => (TaskState::Completed, None),
            TaskOutcome::Failed { error } => (TaskState::Failed, Some(error.to_string())),
            TaskOutcome::Interrupted { .. } | TaskOutcome::Paused { .. } => {
                (TaskState::Paused, None)
            }
            TaskOutcome::Cancelled => (TaskState::Cancelled, None),
        };
        if !task.state.can_transition_to(next) {
            warn!(task = %id, from = ?task.state, to = ?next, "dropping invalid transition");
            return;
        }

        match outcome {
            TaskOutcome::Completed { bytes } => {
                task.state = TaskState::Completed;
                task.record_progress(bytes, bytes);
                task.last_error = None;
                let source = task.source.clone();
                let destination = task.destination.clone();
                let verb = task.verb;
                self.clear_record(id);
                if verb == Verb::Move && record_undo {
                    if let Some(dest) = destination {
                        self.ledger.record_move(id.batch, source, dest);
                    }
                }
            }
            TaskOutcome::Failed { .. } => {
                task.state = TaskState::Failed;
                task.last_error = error_text.clone();
                self.clear_record(id);
            }
            TaskOutcome::Interrupted { resume_offset }
            | TaskOutcome::Paused { resume_offset } => {
                task.state = TaskState::Paused;
                task.pause_requested = false;
                task.record_progress(resume_offset, resume_offset);
                if let Err(e) = self.store.checkpoint(task) {
                    warn!(task = %id, error = %e, "pause checkpoint failed");
                }
            }
            TaskOutcome::Cancelled => {
                task.state = TaskState::Cancelled;
                self.clear_record(id);
            }
        }

        self.events.emit(TaskEvent::StateChanged {
            id,
            state: next,
            error: error_text,
        });
        inner.checkpoints.remove(&id);
        // A failed or cancelled task permanently unmeets the prerequisite
        // of anything barred behind it; running those now would act on a
        // source that never made it across (cross-side move deletes).
        if matches!(next, TaskState::Failed | TaskState::Cancelled) {
            for dep in cancel_dependents(&mut inner, id) {
                self.clear_record(dep);
                self.events.emit(TaskEvent::StateChanged {
                    id: dep,
                    state: TaskState::Cancelled,
                    error: None,
                });
            }
        }
        self.finish_if_terminal(&mut inner, id.batch);
        drop(inner);
        // Barrier tasks may have become claimable.
        self.notify.notify_waiters();
    }

    /// Cancel every queued, paused, and in-progress task of a batch.
    ///
    /// Returns partial destinations orphaned by cancelling paused tasks so
    /// the caller can clean them up; in-progress tasks clean their own.
    pub fn cancel_batch(&self, batch: BatchId) -> Vec<OrphanedPartial> {
        let mut inner = self.inner.lock().unwrap();
        let Some(b) = inner.batches.get_mut(&batch) else {
            return Vec::new();
        };
        let mut orphaned = Vec::new();
        let mut transitions = Vec::new();
        for task in b.tasks.iter_mut() {
            match task.state {
                TaskState::Queued => {
                    task.state = TaskState::Cancelled;
                    transitions.push(task.id);
                }
                TaskState::Paused => {
                    task.state = TaskState::Cancelled;
                    transitions.push(task.id);
                    if task.resume_offset > 0 {
                        if let Some(dest) = &task.destination {
                            orphaned.push(OrphanedPartial {
                                destination: dest.clone(),
                            });
                        }
                    }
                }
                TaskState::InProgress => {
                    task.cancel_requested = true;
                }
                _ => {}
            }
        }
        for id in transitions {
            self.clear_record(id);
            self.events.emit(TaskEvent::StateChanged {
                id,
                state: TaskState::Cancelled,
                error: None,
            });
        }
        self.finish_if_terminal(&mut inner, batch);
        drop(inner);
        self.notify.notify_waiters();
        orphaned
    }

    /// Cancel a single task.
    pub fn cancel_task(&self, id: TaskId) -> Vec<OrphanedPartial> {
        let mut inner = self.inner.lock().unwrap();
        let mut orphaned = Vec::new();
        let Some(task) = task_mut(&mut inner, id) else {
            return orphaned;
        };
        match task.state {
            TaskState::Queued | TaskState::Paused => {
                if task.state == TaskState::Paused && task.resume_offset > 0 {
                    if let Some(dest) = &task.destination {
                        orphaned.push(OrphanedPartial {
                            destination: dest.clone(),
                        });
                    }
                }
                task.state = TaskState::Cancelled;
                self.clear_record(id);
                self.events.emit(TaskEvent::StateChanged {
                    id,
                    state: TaskState::Cancelled,
                    error: None,
                });
                for dep in cancel_dependents(&mut inner, id) {
                    self.clear_record(dep);
                    self.events.emit(TaskEvent::StateChanged {
                        id: dep,
                        state: TaskState::Cancelled,
                        error: None,
                    });
                }
                self.finish_if_terminal(&mut inner, id.batch);
            }
            TaskState::InProgress => task.cancel_requested = true,
            _ => {}
        }
        drop(inner);
        self.notify.notify_waiters();
        orphaned
    }

    /// Ask a task to pause. Queued tasks park immediately; in-progress
    /// tasks stop at the next chunk boundary.
    pub fn pause_task(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = task_mut(&mut inner, id) {
            match task.state {
                TaskState::Queued => {
                    task.state = TaskState::Paused;
                    self.events.emit(TaskEvent::StateChanged {
                        id,
                        state: TaskState::Paused,
                        error: None,
                    });
                    if let Err(e) = self.store.checkpoint(task) {
                        warn!(task = %id, error = %e, "pause checkpoint failed");
                    }
                }
                TaskState::InProgress => task.pause_requested = true,
                _ => {}
            }
        }
    }

    /// Ask a paused task to continue.
    pub fn resume_task(&self, id: TaskId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(task) = task_mut(&mut inner, id) {
            if task.state == TaskState::Paused {
                task.resume_requested = true;
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Point-in-time snapshot of a batch.
    pub fn snapshot(&self, batch: BatchId) -> Option<BatchSnapshot> {
        let inner = self.inner.lock().unwrap();
        inner.batches.get(&batch).map(BatchSnapshot::of)
    }

    /// Current derived state of a batch.
    pub fn batch_state(&self, batch: BatchId) -> Option<BatchState> {
        let inner = self.inner.lock().unwrap();
        inner.batches.get(&batch).map(|b| b.state())
    }

    /// Subscribe to batch-completion version bumps.
    pub fn completion_rx(&self) -> watch::Receiver<u64> {
        self.completion.subscribe()
    }

    /// Stop handing out work. Workers finish their current task and exit;
    /// unfinished tasks stay checkpointed for the next start.
    pub fn shutdown(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.shutdown = true;
        drop(inner);
        self.notify.notify_waiters();
    }

    fn clear_record(&self, id: TaskId) {
        if let Err(e) = self.store.clear(id) {
            warn!(task = %id, error = %e, "failed to clear resume record");
        }
    }

    fn finish_if_terminal(&self, inner: &mut QueueInner, batch: BatchId) {
        let Some(b) = inner.batches.get(&batch) else {
            return;
        };
        let state = b.state();
        if !state.is_terminal() {
            return;
        }
        self.ledger
            .batch_finished(batch, state == BatchState::Completed);
        self.events.emit(TaskEvent::BatchFinished { batch, state });
        self.completion.send_modify(|v| *v += 1);
        debug!(batch = %batch, state = ?state, "batch finished");
    }
}

/// Cancel every non-terminal task barred behind `id` (its `after_seq`
/// covers `id.seq`). Returns the tasks flipped to Cancelled; in-progress
/// dependents are flagged and settle through their own report.
fn cancel_dependents(inner: &mut QueueInner, id: TaskId) -> Vec<TaskId> {
    let Some(batch) = inner.batches.get_mut(&id.batch) else {
        return Vec::new();
    };
    let mut cancelled = Vec::new();
    for task in batch.tasks.iter_mut() {
        if task.state.is_terminal() {
            continue;
        }
        let Some(after) = task.after_seq else {
            continue;
        };
        if after >= id.seq {
            match task.state {
                TaskState::Queued | TaskState::Paused => {
                    task.state = TaskState::Cancelled;
                    cancelled.push(task.id);
                }
                TaskState::InProgress => task.cancel_requested = true,
                _ => {}
            }
        }
    }
    cancelled
}

fn task_mut(inner: &mut QueueInner, id: TaskId) -> Option<&mut TransferTask> {
    inner.batches.get_mut(&id.batch)?.task_mut(id.seq)
}

fn task_ref(inner: &QueueInner, id: TaskId) -> Option<&TransferTask> {
    inner.batches.get(&id.batch)?.task(id.seq)
}
