//! The engine facade: the operator-facing control surface.
//!
//! Wires the planner, queue, worker pool, progress aggregator, undo
//! ledger, and resume store together. Hosts construct one `Engine` per
//! authenticated session, hand it a capability per side, and drive it
//! through `enqueue` / `cancel` / `pause` / `resume` / `undo_last_move`,
//! observing progress through the event stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use ferry_core::constants::PARTIAL_SUFFIX;
use ferry_core::{EngineConfig, Error, FileSystem, Result};

use crate::batch::{Batch, BatchSnapshot, BatchState};
use crate::conflict::{ConflictDecision, ConflictPolicy, ConflictPrompt, ConflictResolver, SkipPrompt};
use crate::plan::{Planner, TransferRequest};
use crate::progress::{EngineEvent, GlobalProgress, ProgressAggregator};
use crate::queue::TransferQueue;
use crate::resume::{PersistedTaskRecord, ResumeStateStore};
use crate::task::{BatchId, Sides, TaskId, TaskState, Verb};
use crate::undo::UndoLedger;
use crate::worker::WorkerPool;

/// The batch transfer engine.
pub struct Engine {
    sides: Sides,
    queue: Arc<TransferQueue>,
    store: Arc<ResumeStateStore>,
    ledger: Arc<UndoLedger>,
    planner: Planner,
    resolver: ConflictResolver,
    events: broadcast::Sender<EngineEvent>,
    global: watch::Receiver<GlobalProgress>,
    next_batch: AtomicU64,
    workers: WorkerPool,
    aggregator: JoinHandle<()>,
}

impl Engine {
    /// Build an engine with the headless conflict prompt (skip on
    /// conflict).
    pub fn new(
        config: EngineConfig,
        local: Arc<dyn FileSystem>,
        remote: Arc<dyn FileSystem>,
    ) -> Result<Self> {
        Self::with_prompt(config, local, remote, Arc::new(SkipPrompt))
    }

    /// Build an engine with a host-supplied conflict prompt.
    pub fn with_prompt(
        config: EngineConfig,
        local: Arc<dyn FileSystem>,
        remote: Arc<dyn FileSystem>,
        prompt: Arc<dyn ConflictPrompt>,
    ) -> Result<Self> {
        let store = Arc::new(ResumeStateStore::open(&config.state_dir)?);
        let (sender, events, global, aggregator) = ProgressAggregator::spawn(1024);
        let ledger = Arc::new(UndoLedger::new());
        let queue = TransferQueue::new(
            sender,
            Arc::clone(&store),
            Arc::clone(&ledger),
            config.checkpoint_bytes,
        );
        let sides = Sides::new(local, remote);
        let workers = WorkerPool::spawn(config.clone(), sides.clone(), Arc::clone(&queue));

        // New batch ids start past anything still checkpointed on disk.
        let next_batch = AtomicU64::new(store.max_batch_id().map(|m| m + 1).unwrap_or(1));

        info!(
            concurrency = config.concurrency,
            state_dir = %config.state_dir.display(),
            "transfer engine started"
        );
        Ok(Self {
            planner: Planner::new(
                sides.clone(),
                ConflictResolver::new(Arc::clone(&prompt)),
            ),
            resolver: ConflictResolver::new(prompt),
            sides,
            queue,
            store,
            ledger,
            events,
            global,
            next_batch,
            workers,
            aggregator,
        })
    }

    fn next_batch_id(&self) -> BatchId {
        BatchId(self.next_batch.fetch_add(1, Ordering::SeqCst))
    }

    /// Plan and admit a batch for an operator request.
    ///
    /// Conflicts are resolved here, before admission; returns
    /// `Error::Cancelled` when the operator cancels out of the prompt, in
    /// which case nothing was admitted.
    pub async fn enqueue(&self, request: TransferRequest) -> Result<BatchId> {
        let plan = self.planner.plan(&request).await?;
        let label = match request.verb {
            Verb::Copy => "copying",
            Verb::Move => "moving",
            Verb::Delete => "deleting",
        };

        let batch_id = self.next_batch_id();
        let mut batch = Batch::new(batch_id, label, request.policy);
        for planned in plan {
            let task = batch.push_task(planned.verb, planned.source, planned.destination);
            task.source_is_dir = planned.source_is_dir;
            task.after_seq = planned.after_seq;
            if planned.skip {
                task.state = TaskState::Completed;
                task.skipped = true;
            }
        }

        if request.verb == Verb::Move && !batch.tasks.is_empty() {
            // A new move batch supersedes whatever was undoable.
            self.ledger.batch_started(batch_id);
        }
        self.queue.admit(batch);
        Ok(batch_id)
    }

    /// Undo the most recent completed move batch by re-issuing the
    /// recorded moves in reverse, newest first, through the same queue.
    ///
    /// Repopulated originals resolve as Skip. Undoing twice returns
    /// `Error::AlreadyUndone` and changes nothing.
    pub async fn undo_last_move(&self, batch: BatchId) -> Result<BatchId> {
        let records = self.ledger.take(batch)?;
        info!(batch = %batch, moves = records.len(), "undoing move batch");

        let undo_id = self.next_batch_id();
        let mut undo = Batch::new(undo_id, "undo", ConflictPolicy::Skip);
        undo.record_undo = false;

        for record in records.iter().rev() {
            let fs = self.sides.fs(record.original.side);
            let mut policy = ConflictPolicy::Skip;
            let decision = self
                .resolver
                .resolve(fs.as_ref(), &record.original, None, &mut policy)
                .await?;
            let task = undo.push_task(
                Verb::Move,
                record.moved_to.clone(),
                Some(record.original.clone()),
            );
            if !matches!(decision, ConflictDecision::Proceed) {
                // The original location has been repopulated since the
                // move; leave both sides alone.
                task.state = TaskState::Completed;
                task.skipped = true;
            }
        }

        self.queue.admit(undo);
        Ok(undo_id)
    }

    /// Cancel every pending and running task of a batch.
    pub async fn cancel_batch(&self, batch: BatchId) {
        let orphaned = self.queue.cancel_batch(batch);
        for orphan in orphaned {
            self.discard_partial(&orphan.destination).await;
        }
    }

    /// Cancel one task.
    pub async fn cancel_task(&self, id: TaskId) {
        let orphaned = self.queue.cancel_task(id);
        for orphan in orphaned {
            self.discard_partial(&orphan.destination).await;
        }
    }

    /// Pause one task at its next chunk boundary.
    pub fn pause(&self, id: TaskId) {
        self.queue.pause_task(id);
    }

    /// Resume a paused task.
    pub fn resume(&self, id: TaskId) {
        self.queue.resume_task(id);
    }

    /// Subscribe to the engine event stream. Slow subscribers lose oldest
    /// events, never slow the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Latest global progress summary.
    pub fn global_progress(&self) -> watch::Receiver<GlobalProgress> {
        self.global.clone()
    }

    /// Point-in-time snapshot of a batch and its per-task ledger.
    pub fn snapshot(&self, batch: BatchId) -> Option<BatchSnapshot> {
        self.queue.snapshot(batch)
    }

    /// Current derived state of a batch.
    pub fn batch_state(&self, batch: BatchId) -> Option<BatchState> {
        self.queue.batch_state(batch)
    }

    /// The batch whose moves can currently be undone.
    pub fn undoable_batch(&self) -> Option<BatchId> {
        self.ledger.undoable_batch()
    }

    /// Wait until a batch reaches a terminal state.
    pub async fn wait_batch(&self, batch: BatchId) -> Result<BatchState> {
        let mut completion = self.queue.completion_rx();
        loop {
            match self.queue.batch_state(batch) {
                Some(state) if state.is_terminal() => return Ok(state),
                Some(_) => {}
                None => {
                    return Err(Error::InvalidState {
                        expected: "known batch".into(),
                        actual: format!("unknown {batch}"),
                    })
                }
            }
            completion
                .changed()
                .await
                .map_err(|_| Error::ChannelClosed)?;
        }
    }

    /// Tasks still checkpointed from an interrupted run, ordered by batch
    /// and sequence.
    pub fn load_pending(&self) -> Vec<PersistedTaskRecord> {
        self.store.load_pending()
    }

    /// Re-admit interrupted tasks, grouped under their original batch
    /// ids, so transfers continue from their checkpointed offsets.
    pub fn resume_interrupted(&self) -> Vec<BatchId> {
        let pending = self.store.load_pending();
        if pending.is_empty() {
            return Vec::new();
        }

        let mut batches: Vec<(BatchId, Vec<PersistedTaskRecord>)> = Vec::new();
        for record in pending {
            let id = BatchId(record.batch_id);
            match batches.last_mut() {
                Some((last, records)) if *last == id => records.push(record),
                _ => batches.push((id, vec![record])),
            }
        }

        let mut admitted = Vec::new();
        for (id, records) in batches {
            info!(batch = %id, tasks = records.len(), "resuming interrupted batch");
            let mut batch = Batch::new(id, "resumed", ConflictPolicy::Skip);
            // Completed siblings were already cleared from the store; the
            // surviving records run strictly in order, which preserves any
            // original delete-depth constraints.
            batch.record_undo = false;
            for (idx, record) in records.into_iter().enumerate() {
                let task = batch.push_task(record.verb, record.source, record.destination);
                task.source_is_dir = record.source_is_dir;
                if let Some(size) = record.size_bytes {
                    task.set_size(size);
                }
                task.record_progress(record.resume_offset, record.resume_offset);
                task.last_error = record.last_error;
                if idx > 0 {
                    task.after_seq = Some(idx as u32 - 1);
                }
            }
            self.queue.admit(batch);
            admitted.push(id);
        }
        admitted
    }

    /// Stop handing out work, let workers finish their current task, and
    /// tear the engine down. Unfinished tasks stay checkpointed for the
    /// next start.
    pub async fn shutdown(self) {
        info!("transfer engine shutting down");
        self.queue.shutdown();
        let Engine {
            workers,
            aggregator,
            queue,
            ..
        } = self;
        workers.join().await;
        // Dropping the queue drops the last event sender, which lets the
        // aggregator drain and exit.
        drop(queue);
        let _ = aggregator.await;
    }

    async fn discard_partial(&self, destination: &crate::task::SidedPath) {
        let partial = format!("{}{}", destination.path, PARTIAL_SUFFIX);
        let fs = self.sides.fs(destination.side);
        match fs.remove(&partial).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => {
                warn!(path = %partial, error = %e, "failed to discard orphaned partial")
            }
        }
    }
}
