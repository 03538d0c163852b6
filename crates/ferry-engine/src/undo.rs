//! Undo ledger for the most recent completed move batch.
//!
//! The ledger is an explicit bounded history of size one: admitting a new
//! move batch invalidates whatever was undoable before, and undoing
//! consumes the set. Only same-side moves are recorded; a cross-side move
//! is planned as copy-plus-delete and leaves nothing to rename back.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use tracing::debug;

use ferry_core::{Error, Result};

use crate::task::{BatchId, SidedPath};

/// One reversible move: where the entry was, and where it went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub original: SidedPath,
    pub moved_to: SidedPath,
}

/// The undoable records of one completed move batch.
#[derive(Debug, Clone)]
pub struct UndoSet {
    pub batch_id: BatchId,
    pub records: Vec<UndoRecord>,
    pub created_at: SystemTime,
}

#[derive(Default)]
struct LedgerInner {
    /// Records accumulating while a move batch runs.
    pending: HashMap<BatchId, Vec<UndoRecord>>,
    /// The one live undo set.
    current: Option<UndoSet>,
}

/// Records reversible moves and hands back the inverse plan on demand.
#[derive(Default)]
pub struct UndoLedger {
    inner: Mutex<LedgerInner>,
}

impl UndoLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new move batch is starting: whatever was undoable no longer is.
    pub fn batch_started(&self, batch: BatchId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(prior) = inner.current.take() {
            debug!(superseded = %prior.batch_id, by = %batch, "undo set superseded");
        }
        inner.pending.insert(batch, Vec::new());
    }

    /// Record one completed move.
    pub fn record_move(&self, batch: BatchId, original: SidedPath, moved_to: SidedPath) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(records) = inner.pending.get_mut(&batch) {
            records.push(UndoRecord { original, moved_to });
        }
    }

    /// The batch finished. A fully successful move batch becomes the live
    /// undo set; anything else (errors, cancellation) is not safely
    /// reversible and its records are dropped.
    pub fn batch_finished(&self, batch: BatchId, fully_completed: bool) {
        let mut inner = self.inner.lock().unwrap();
        let Some(records) = inner.pending.remove(&batch) else {
            return;
        };
        if fully_completed && !records.is_empty() {
            debug!(batch = %batch, moves = records.len(), "undo set sealed");
            inner.current = Some(UndoSet {
                batch_id: batch,
                records,
                created_at: SystemTime::now(),
            });
        }
    }

    /// The batch whose moves are currently undoable, if any.
    pub fn undoable_batch(&self) -> Option<BatchId> {
        self.inner.lock().unwrap().current.as_ref().map(|s| s.batch_id)
    }

    /// Consume the undo set for `batch`.
    ///
    /// Returns `AlreadyUndone` when the batch was undone before or its
    /// records were superseded by a newer move batch, an "already done"
    /// condition callers may treat as success.
    pub fn take(&self, batch: BatchId) -> Result<Vec<UndoRecord>> {
        let mut inner = self.inner.lock().unwrap();
        match &inner.current {
            Some(set) if set.batch_id == batch => {
                let set = inner.current.take().unwrap();
                Ok(set.records)
            }
            _ => Err(Error::AlreadyUndone),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32) -> (SidedPath, SidedPath) {
        (
            SidedPath::remote(format!("/home/f{n}")),
            SidedPath::remote(format!("/dest/f{n}")),
        )
    }

    #[test]
    fn seal_and_take() {
        let ledger = UndoLedger::new();
        let batch = BatchId(1);
        ledger.batch_started(batch);
        let (orig, moved) = record(0);
        ledger.record_move(batch, orig.clone(), moved.clone());
        ledger.batch_finished(batch, true);

        assert_eq!(ledger.undoable_batch(), Some(batch));
        let records = ledger.take(batch).unwrap();
        assert_eq!(records, vec![UndoRecord { original: orig, moved_to: moved }]);
    }

    #[test]
    fn second_take_is_already_undone() {
        let ledger = UndoLedger::new();
        let batch = BatchId(1);
        ledger.batch_started(batch);
        let (orig, moved) = record(0);
        ledger.record_move(batch, orig, moved);
        ledger.batch_finished(batch, true);

        ledger.take(batch).unwrap();
        assert!(matches!(ledger.take(batch), Err(Error::AlreadyUndone)));
    }

    #[test]
    fn newer_move_batch_supersedes_undo() {
        let ledger = UndoLedger::new();
        let first = BatchId(1);
        ledger.batch_started(first);
        let (orig, moved) = record(0);
        ledger.record_move(first, orig, moved);
        ledger.batch_finished(first, true);

        // Starting a second move batch invalidates the first undo set,
        // even before the second batch completes.
        let second = BatchId(2);
        ledger.batch_started(second);
        assert_eq!(ledger.undoable_batch(), None);
        assert!(matches!(ledger.take(first), Err(Error::AlreadyUndone)));
    }

    #[test]
    fn incomplete_batches_are_not_undoable() {
        let ledger = UndoLedger::new();
        let batch = BatchId(1);
        ledger.batch_started(batch);
        let (orig, moved) = record(0);
        ledger.record_move(batch, orig, moved);
        ledger.batch_finished(batch, false);

        assert_eq!(ledger.undoable_batch(), None);
        assert!(matches!(ledger.take(batch), Err(Error::AlreadyUndone)));
    }

    #[test]
    fn move_batch_without_moves_seals_nothing() {
        let ledger = UndoLedger::new();
        let batch = BatchId(1);
        ledger.batch_started(batch);
        ledger.batch_finished(batch, true);
        assert_eq!(ledger.undoable_batch(), None);
    }
}
