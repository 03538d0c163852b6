//! Progress events and aggregation.
//!
//! Workers publish task events through a bounded channel that never blocks
//! the I/O path: under backpressure events are dropped and counted, and
//! because byte events carry absolute totals a later event always
//! supersedes a lost one. The aggregator folds task events into per-batch
//! and global summaries and fans them out on a broadcast channel; slow
//! subscribers lose oldest events, never the engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::batch::BatchState;
use crate::task::{BatchId, TaskId, TaskState};

/// Internal event emitted by the queue and workers.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    BatchAdmitted {
        batch: BatchId,
        label: String,
        files_total: u64,
    },
    SizeKnown {
        id: TaskId,
        size: u64,
    },
    /// Absolute bytes transferred for one task.
    Bytes {
        id: TaskId,
        bytes_transferred: u64,
    },
    StateChanged {
        id: TaskId,
        state: TaskState,
        error: Option<String>,
    },
    BatchFinished {
        batch: BatchId,
        state: BatchState,
    },
}

/// Event published to the presentation layer.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskStateChanged {
        id: TaskId,
        state: TaskState,
        error: Option<String>,
    },
    TaskProgress {
        id: TaskId,
        bytes_transferred: u64,
    },
    BatchProgress(BatchProgress),
    BatchFinished {
        batch: BatchId,
        state: BatchState,
    },
}

/// Rolled-up progress for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchProgress {
    pub batch: BatchId,
    pub label: String,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_transferred: u64,
    /// Known once every task's size is known.
    pub bytes_total: Option<u64>,
    /// Monotonically non-decreasing; `None` while sizes are incomplete.
    pub percent: Option<f64>,
}

/// Roll-up across all batches admitted since startup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalProgress {
    pub active_batches: usize,
    pub files_done: u64,
    pub files_total: u64,
    pub bytes_transferred: u64,
    pub bytes_total: Option<u64>,
}

/// Non-blocking sender handed to the queue and workers.
#[derive(Clone)]
pub struct TaskEventSender {
    tx: mpsc::Sender<TaskEvent>,
    dropped: Arc<AtomicU64>,
}

impl TaskEventSender {
    /// Publish an event without ever blocking; a full buffer drops the
    /// event and bumps the counter.
    pub fn emit(&self, event: TaskEvent) {
        if self.tx.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Events dropped under backpressure so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct BatchAcc {
    label: String,
    files_total: u64,
    done: HashMap<u32, TaskState>,
    bytes: HashMap<u32, u64>,
    sizes: HashMap<u32, u64>,
    last_percent: f64,
    finished: bool,
}

impl BatchAcc {
    fn progress(&mut self, batch: BatchId) -> BatchProgress {
        let bytes_transferred: u64 = self.bytes.values().sum();
        let bytes_total = if self.sizes.len() as u64 == self.files_total {
            Some(self.sizes.values().sum())
        } else {
            None
        };
        let percent = bytes_total.map(|total| {
            let raw = if total == 0 {
                100.0
            } else {
                (bytes_transferred as f64 / total as f64) * 100.0
            };
            // Never goes backwards, even if a task restarts from zero.
            self.last_percent = self.last_percent.max(raw);
            self.last_percent
        });
        BatchProgress {
            batch,
            label: self.label.clone(),
            files_done: self
                .done
                .values()
                .filter(|s| s.is_terminal())
                .count() as u64,
            files_total: self.files_total,
            bytes_transferred,
            bytes_total,
            percent,
        }
    }
}

/// Folds task events into batch and global summaries.
pub struct ProgressAggregator {
    batches: HashMap<BatchId, BatchAcc>,
    events: broadcast::Sender<EngineEvent>,
    global: watch::Sender<GlobalProgress>,
}

impl ProgressAggregator {
    /// Create the event plumbing: the non-blocking sender for workers,
    /// the broadcast stream for subscribers, the global watch, and the
    /// aggregator task.
    pub fn spawn(
        buffer: usize,
    ) -> (
        TaskEventSender,
        broadcast::Sender<EngineEvent>,
        watch::Receiver<GlobalProgress>,
        JoinHandle<()>,
    ) {
        let (tx, mut rx) = mpsc::channel(buffer.max(16));
        let (event_tx, _) = broadcast::channel(256);
        let (global_tx, global_rx) = watch::channel(GlobalProgress::default());

        let sender = TaskEventSender {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let dropped = Arc::clone(&sender.dropped);

        let mut agg = ProgressAggregator {
            batches: HashMap::new(),
            events: event_tx.clone(),
            global: global_tx,
        };

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                agg.handle(event);
            }
            let lost = dropped.load(Ordering::Relaxed);
            if lost > 0 {
                warn!(dropped = lost, "progress events dropped under backpressure");
            }
            debug!("progress aggregator stopped");
        });

        (sender, event_tx, global_rx, handle)
    }

    fn handle(&mut self, event: TaskEvent) {
        match event {
            TaskEvent::BatchAdmitted {
                batch,
                label,
                files_total,
            } => {
                self.batches.insert(
                    batch,
                    BatchAcc {
                        label,
                        files_total,
                        done: HashMap::new(),
                        bytes: HashMap::new(),
                        sizes: HashMap::new(),
                        last_percent: 0.0,
                        finished: false,
                    },
                );
                self.publish_batch(batch);
            }
            TaskEvent::SizeKnown { id, size } => {
                if let Some(acc) = self.batches.get_mut(&id.batch) {
                    acc.sizes.insert(id.seq, size);
                    self.publish_batch(id.batch);
                }
            }
            TaskEvent::Bytes {
                id,
                bytes_transferred,
            } => {
                if let Some(acc) = self.batches.get_mut(&id.batch) {
                    acc.bytes.insert(id.seq, bytes_transferred);
                }
                let _ = self.events.send(EngineEvent::TaskProgress {
                    id,
                    bytes_transferred,
                });
                self.publish_batch(id.batch);
            }
            TaskEvent::StateChanged { id, state, error } => {
                if let Some(acc) = self.batches.get_mut(&id.batch) {
                    acc.done.insert(id.seq, state);
                }
                let _ = self
                    .events
                    .send(EngineEvent::TaskStateChanged { id, state, error });
                self.publish_batch(id.batch);
            }
            TaskEvent::BatchFinished { batch, state } => {
                if let Some(acc) = self.batches.get_mut(&batch) {
                    acc.finished = true;
                }
                self.publish_batch(batch);
                let _ = self.events.send(EngineEvent::BatchFinished { batch, state });
                self.publish_global();
            }
        }
    }

    fn publish_batch(&mut self, batch: BatchId) {
        if let Some(acc) = self.batches.get_mut(&batch) {
            let progress = acc.progress(batch);
            let _ = self.events.send(EngineEvent::BatchProgress(progress));
        }
        self.publish_global();
    }

    fn publish_global(&mut self) {
        let mut global = GlobalProgress::default();
        let mut all_sized = true;
        let mut bytes_total = 0u64;
        for (id, acc) in self.batches.iter_mut() {
            if !acc.finished {
                global.active_batches += 1;
            }
            let p = acc.progress(*id);
            global.files_done += p.files_done;
            global.files_total += p.files_total;
            global.bytes_transferred += p.bytes_transferred;
            match p.bytes_total {
                Some(total) => bytes_total += total,
                None => all_sized = false,
            }
        }
        global.bytes_total = all_sized.then_some(bytes_total);
        self.global.send_replace(global);
    }
}

// =============================================================================
// Indicatif-based console reporter
// =============================================================================

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// Renders engine events as console progress bars.
///
/// One optional subscriber among many; the engine itself never draws.
pub struct ConsoleReporter {
    mp: MultiProgress,
    bars: Mutex<HashMap<BatchId, ProgressBar>>,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            mp: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn bar_style() -> ProgressStyle {
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .unwrap()
            .progress_chars("=>-")
    }

    /// Consume events until the engine shuts down.
    pub fn spawn(self: Arc<Self>, mut events: broadcast::Receiver<EngineEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => self.on_event(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn on_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::BatchProgress(progress) => {
                let mut bars = self.bars.lock().unwrap();
                let bar = bars.entry(progress.batch).or_insert_with(|| {
                    let pb = self
                        .mp
                        .add(ProgressBar::new(progress.bytes_total.unwrap_or(0)));
                    pb.set_style(Self::bar_style());
                    pb
                });
                if let Some(total) = progress.bytes_total {
                    bar.set_length(total);
                }
                bar.set_position(progress.bytes_transferred);
                bar.set_message(format!(
                    "{} {}/{} files",
                    progress.label, progress.files_done, progress.files_total
                ));
            }
            EngineEvent::BatchFinished { batch, state } => {
                if let Some(bar) = self.bars.lock().unwrap().remove(&batch) {
                    bar.finish_with_message(match state {
                        BatchState::Completed => "done",
                        BatchState::CompletedWithErrors => "done with errors",
                        BatchState::Cancelled => "cancelled",
                        _ => "stopped",
                    });
                }
            }
            EngineEvent::TaskStateChanged { .. } | EngineEvent::TaskProgress { .. } => {}
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}
