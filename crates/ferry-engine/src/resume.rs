//! Durable record of in-flight batches for resume after restart.
//!
//! One JSON document holds one record per non-terminal task. Every write
//! is scoped to a single task record and lands atomically (temp file +
//! rename), so a crash mid-checkpoint can never corrupt entries of
//! unrelated tasks. Unreadable state is treated as empty: restart is never
//! blocked by a bad state file, and deleting the file externally simply
//! means "no pending transfers".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use ferry_core::constants::STATE_FILE_NAME;
use ferry_core::{Error, Result};

use crate::task::{BatchId, SidedPath, TaskId, TransferTask, Verb};

/// On-disk mirror of one non-terminal task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTaskRecord {
    pub batch_id: u64,
    pub seq: u32,
    pub verb: Verb,
    pub source: SidedPath,
    pub destination: Option<SidedPath>,
    #[serde(default)]
    pub source_is_dir: bool,
    pub size_bytes: Option<u64>,
    pub resume_offset: u64,
    pub last_error: Option<String>,
}

impl PersistedTaskRecord {
    pub fn of(task: &TransferTask) -> Self {
        Self {
            batch_id: task.id.batch.0,
            seq: task.id.seq,
            verb: task.verb,
            source: task.source.clone(),
            destination: task.destination.clone(),
            source_is_dir: task.source_is_dir,
            size_bytes: task.size_bytes,
            resume_offset: task.resume_offset,
            last_error: task.last_error.clone(),
        }
    }

    pub fn task_id(&self) -> TaskId {
        TaskId {
            batch: BatchId(self.batch_id),
            seq: self.seq,
        }
    }
}

/// Durable store of pending-task records.
pub struct ResumeStateStore {
    path: PathBuf,
    records: Mutex<BTreeMap<(u64, u32), PersistedTaskRecord>>,
}

impl ResumeStateStore {
    /// Open (or create) the store under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(STATE_FILE_NAME);
        let records = match Self::read_file(&path) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "discarding unreadable resume state");
                BTreeMap::new()
            }
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn read_file(path: &Path) -> Result<BTreeMap<(u64, u32), PersistedTaskRecord>> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        let parsed: Vec<PersistedTaskRecord> =
            serde_json::from_slice(&raw).map_err(|e| Error::CorruptState {
                message: e.to_string(),
            })?;
        Ok(parsed
            .into_iter()
            .map(|r| ((r.batch_id, r.seq), r))
            .collect())
    }

    fn persist(&self, records: &BTreeMap<(u64, u32), PersistedTaskRecord>) -> Result<()> {
        let entries: Vec<&PersistedTaskRecord> = records.values().collect();
        let raw = serde_json::to_vec_pretty(&entries).map_err(|e| Error::CorruptState {
            message: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Record (or update) the persisted state of one task.
    pub fn checkpoint(&self, task: &TransferTask) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        records.insert(
            (task.id.batch.0, task.id.seq),
            PersistedTaskRecord::of(task),
        );
        self.persist(&records)
    }

    /// Drop the record for a task that reached a terminal state.
    pub fn clear(&self, id: TaskId) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.remove(&(id.batch.0, id.seq)).is_some() {
            self.persist(&records)?;
        }
        Ok(())
    }

    /// Drop every record of a batch.
    pub fn clear_batch(&self, batch: BatchId) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let before = records.len();
        records.retain(|(b, _), _| *b != batch.0);
        if records.len() != before {
            self.persist(&records)?;
        }
        Ok(())
    }

    /// Pending records, ordered by batch then sequence.
    pub fn load_pending(&self) -> Vec<PersistedTaskRecord> {
        let records = self.records.lock().unwrap();
        debug!(pending = records.len(), "loaded resume state");
        records.values().cloned().collect()
    }

    /// Highest batch id seen in the persisted state.
    pub fn max_batch_id(&self) -> Option<u64> {
        let records = self.records.lock().unwrap();
        records.keys().map(|(b, _)| *b).max()
    }
}
