//! ferry-engine: Batch transfer engine for remote file management.
//!
//! Turns operator copy/move/delete requests into a scheduled, resumable,
//! cancellable, and undoable sequence of filesystem operations with
//! progress reporting. This crate provides:
//! - Task and batch data model with a validated state machine
//! - Batch planning (directory expansion, delete ordering, conflicts)
//! - The transfer queue and fixed worker pool
//! - Progress aggregation and the engine event stream
//! - The undo ledger for the most recent move batch
//! - Durable resume state surviving restarts
//! - The `Engine` facade exposed to the host application

pub mod batch;
pub mod conflict;
pub mod engine;
pub mod plan;
pub mod progress;
pub mod queue;
pub mod resume;
pub mod task;
pub mod undo;
pub mod worker;

pub use batch::{Batch, BatchSnapshot, BatchState, TaskSnapshot};
pub use conflict::{
    ConflictDecision, ConflictPolicy, ConflictPrompt, ConflictRequest, PromptAnswer, PromptChoice,
    SkipPrompt, StaticPrompt,
};
pub use engine::Engine;
pub use plan::{Planner, TransferRequest};
pub use progress::{BatchProgress, ConsoleReporter, EngineEvent, GlobalProgress};
pub use queue::{TaskControl, TaskOutcome, TransferQueue};
pub use resume::{PersistedTaskRecord, ResumeStateStore};
pub use task::{BatchId, Side, SidedPath, Sides, TaskId, TaskState, TransferTask, Verb};
pub use undo::{UndoLedger, UndoRecord, UndoSet};
pub use worker::WorkerPool;
