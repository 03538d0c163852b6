//! The worker pool: fixed-size set of executors draining the queue.
//!
//! Workers move bytes in chunks, checking for cancel/pause requests
//! between chunks so cancellation latency is bounded by chunk size, not
//! file size. Every individual I/O call runs under the configured timeout
//! and retryable failures are retried with bounded exponential backoff.
//! Destinations are written as `<name>.partial` and renamed into place on
//! completion; a lost channel parks the task resumable with its partial
//! intact.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ferry_core::constants::PARTIAL_SUFFIX;
use ferry_core::fs::FsMetadata;
use ferry_core::{path as fpath, EngineConfig, Error, FileSystem, Result, StreamingHasher};

use crate::queue::{ClaimedTask, TaskControl, TaskOutcome, TransferQueue};
use crate::task::{SidedPath, Sides, Verb};

/// Fixed pool of transfer workers.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `config.concurrency` workers draining `queue`.
    pub fn spawn(config: EngineConfig, sides: Sides, queue: Arc<TransferQueue>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_open_handles));
        let handles = (0..config.concurrency)
            .map(|n| {
                let worker = Worker {
                    n,
                    config: config.clone(),
                    sides: sides.clone(),
                    queue: Arc::clone(&queue),
                    permits: Arc::clone(&permits),
                };
                tokio::spawn(async move { worker.run().await })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to exit (after queue shutdown).
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// What one copy attempt ended with.
enum CopyAttempt {
    Done { bytes: u64 },
    Cancelled,
    Paused { at: u64 },
}

struct Worker {
    n: usize,
    config: EngineConfig,
    sides: Sides,
    queue: Arc<TransferQueue>,
    permits: Arc<Semaphore>,
}

impl Worker {
    async fn run(&self) {
        debug!(worker = self.n, "transfer worker started");
        while let Some(claim) = self.queue.claim_next().await {
            debug!(worker = self.n, task = %claim.id, verb = ?claim.verb, "task claimed");
            let outcome = self.execute(&claim).await;
            self.queue.report(claim.id, outcome);
        }
        debug!(worker = self.n, "transfer worker stopped");
    }

    async fn execute(&self, claim: &ClaimedTask) -> TaskOutcome {
        if self.queue.control(claim.id) == TaskControl::Cancel {
            return TaskOutcome::Cancelled;
        }
        match claim.verb {
            Verb::Delete => self.run_delete(claim).await,
            Verb::Move => self.run_move(claim).await,
            Verb::Copy if claim.source_is_dir => self.run_mkdir(claim).await,
            Verb::Copy => self.run_copy(claim).await,
        }
    }

    async fn run_delete(&self, claim: &ClaimedTask) -> TaskOutcome {
        self.queue.set_size(claim.id, 0);
        let fs = Arc::clone(self.sides.fs(claim.source.side));
        let path = claim.source.path.clone();
        let result = self
            .with_retries(|| {
                let fs = Arc::clone(&fs);
                let path = path.clone();
                async move { fs.remove(&path).await }
            })
            .await;
        match result {
            Ok(()) => TaskOutcome::Completed { bytes: 0 },
            Err(e) => outcome_from_error(e, 0),
        }
    }

    async fn run_move(&self, claim: &ClaimedTask) -> TaskOutcome {
        self.queue.set_size(claim.id, 0);
        let Some(dest) = claim.destination.clone() else {
            return TaskOutcome::Failed {
                error: Error::InvalidState {
                    expected: "move destination".into(),
                    actual: "none".into(),
                },
            };
        };
        let fs = Arc::clone(self.sides.fs(claim.source.side));
        let src = claim.source.path.clone();
        let dst = dest.path.clone();

        // Make sure the destination's parent exists; a failure here is the
        // destination's problem, not the source's.
        if let Err(e) = self.ensure_parent(&fs, &dst).await {
            return outcome_from_error(e, 0);
        }

        let result = self
            .with_retries(|| {
                let fs = Arc::clone(&fs);
                let src = src.clone();
                let dst = dst.clone();
                async move { fs.rename(&src, &dst).await }
            })
            .await;
        match result {
            Ok(()) => TaskOutcome::Completed { bytes: 0 },
            Err(e) => outcome_from_error(e, 0),
        }
    }

    async fn run_mkdir(&self, claim: &ClaimedTask) -> TaskOutcome {
        self.queue.set_size(claim.id, 0);
        let Some(dest) = claim.destination.clone() else {
            return TaskOutcome::Failed {
                error: Error::InvalidState {
                    expected: "copy destination".into(),
                    actual: "none".into(),
                },
            };
        };
        let fs = Arc::clone(self.sides.fs(dest.side));
        let path = dest.path.clone();
        let result = self
            .with_retries(|| {
                let fs = Arc::clone(&fs);
                let path = path.clone();
                async move { fs.mkdir_all(&path).await }
            })
            .await;
        match result {
            Ok(()) => TaskOutcome::Completed { bytes: 0 },
            Err(e) => outcome_from_error(e, 0),
        }
    }

    async fn run_copy(&self, claim: &ClaimedTask) -> TaskOutcome {
        let Some(dest) = claim.destination.clone() else {
            return TaskOutcome::Failed {
                error: Error::InvalidState {
                    expected: "copy destination".into(),
                    actual: "none".into(),
                },
            };
        };
        let src_fs = Arc::clone(self.sides.fs(claim.source.side));
        let dst_fs = Arc::clone(self.sides.fs(dest.side));

        let meta = {
            let fs = Arc::clone(&src_fs);
            let path = claim.source.path.clone();
            match self
                .with_retries(|| {
                    let fs = Arc::clone(&fs);
                    let path = path.clone();
                    async move { fs.stat(&path).await }
                })
                .await
            {
                Ok(meta) => meta,
                Err(e) => return outcome_from_error(e, 0),
            }
        };
        self.queue.set_size(claim.id, meta.size);

        if let Err(e) = self.ensure_parent(&dst_fs, &dest.path).await {
            return outcome_from_error(e, 0);
        }

        let partial = dest.with_path(format!("{}{}", dest.path, PARTIAL_SUFFIX));
        let mut offset = claim.resume_offset;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self
                .copy_attempt(claim, &src_fs, &dst_fs, &meta, &partial, &dest, offset)
                .await
            {
                Ok(CopyAttempt::Done { bytes }) => {
                    return TaskOutcome::Completed { bytes };
                }
                Ok(CopyAttempt::Cancelled) => {
                    // No partial artifact survives a cancel.
                    self.discard_partial(&dst_fs, &partial).await;
                    return TaskOutcome::Cancelled;
                }
                Ok(CopyAttempt::Paused { at }) => {
                    return TaskOutcome::Paused { resume_offset: at };
                }
                Err((at, e)) if e.is_interruption() => {
                    debug!(task = %claim.id, at, "channel lost, parking resumable");
                    return TaskOutcome::Interrupted { resume_offset: at };
                }
                Err((at, e)) if e.is_retryable() && attempt < self.config.retry_budget => {
                    let delay = self.config.backoff_delay(attempt);
                    warn!(task = %claim.id, error = %e, attempt, delay_ms = delay.as_millis() as u64, "transfer attempt failed, retrying");
                    offset = at;
                    tokio::time::sleep(delay).await;
                }
                Err((at, e)) => {
                    if at == 0 {
                        self.discard_partial(&dst_fs, &partial).await;
                    }
                    // A non-empty partial stays behind for a later retry.
                    return TaskOutcome::Failed { error: e };
                }
            }
        }
    }

    /// One pass of the chunk loop, from `start_offset` to EOF and the
    /// final rename. Errors carry the last safe offset.
    #[allow(clippy::too_many_arguments)]
    async fn copy_attempt(
        &self,
        claim: &ClaimedTask,
        src_fs: &Arc<dyn FileSystem>,
        dst_fs: &Arc<dyn FileSystem>,
        meta: &FsMetadata,
        partial: &SidedPath,
        dest: &SidedPath,
        start_offset: u64,
    ) -> std::result::Result<CopyAttempt, (u64, Error)> {
        let mut offset = start_offset;

        // Honor cancel/pause even when the previous attempt spent its time
        // in a backoff sleep.
        match self.queue.control(claim.id) {
            TaskControl::Cancel => return Ok(CopyAttempt::Cancelled),
            TaskControl::Pause => return Ok(CopyAttempt::Paused { at: offset }),
            TaskControl::Continue => {}
        }

        if offset > 0 {
            let verified = self
                .verify_partial(src_fs, dst_fs, &claim.source, partial, offset)
                .await;
            if !verified {
                debug!(task = %claim.id, offset, "partial did not verify, restarting from zero");
                offset = 0;
                self.queue.reset_progress(claim.id);
            }
        }

        // Bound concurrently open handles across the pool: one read, one
        // write.
        let _permits = self
            .permits
            .acquire_many(2)
            .await
            .map_err(|e| (offset, Error::Transient { message: e.to_string() }))?;

        let mut reader = self
            .timed(src_fs.open_read(&claim.source.path, offset))
            .await
            .map_err(|e| (offset, e))?;
        let mut writer = self
            .timed(dst_fs.open_write(&partial.path, offset, offset == 0))
            .await
            .map_err(|e| (offset, e))?;

        let mut bytes = offset;
        loop {
            match self.queue.control(claim.id) {
                TaskControl::Cancel => return Ok(CopyAttempt::Cancelled),
                TaskControl::Pause => {
                    debug!(task = %claim.id, at = bytes, "pausing at chunk boundary");
                    return Ok(CopyAttempt::Paused { at: bytes });
                }
                TaskControl::Continue => {}
            }

            let chunk = self
                .timed(reader.read_chunk(self.config.chunk_size))
                .await
                .map_err(|e| (bytes, e))?;
            if chunk.is_empty() {
                break;
            }
            self.timed(writer.write_chunk(&chunk))
                .await
                .map_err(|e| (bytes, e))?;
            bytes += chunk.len() as u64;
            self.queue.update_progress(claim.id, bytes, bytes);
        }

        self.timed(writer.finish()).await.map_err(|e| (bytes, e))?;
        drop(writer);
        drop(reader);

        if bytes != meta.size {
            // The source changed length mid-transfer; surface it rather
            // than silently installing a short file.
            warn!(task = %claim.id, expected = meta.size, actual = bytes, "source size changed during transfer");
        }

        // Move the finished partial into place, clearing whatever the
        // conflict decision left at the destination.
        match dst_fs.remove(&dest.path).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => return Err((bytes, e)),
        }
        self.timed(dst_fs.rename(&partial.path, &dest.path))
            .await
            .map_err(|e| (bytes, e))?;

        Ok(CopyAttempt::Done { bytes })
    }

    /// Check whether the partial destination still matches the source by
    /// hashing the overlapping trailing segment on both sides. Any doubt
    /// (missing capability, short partial, verify error) means restart
    /// from zero.
    async fn verify_partial(
        &self,
        src_fs: &Arc<dyn FileSystem>,
        dst_fs: &Arc<dyn FileSystem>,
        source: &SidedPath,
        partial: &SidedPath,
        offset: u64,
    ) -> bool {
        if !src_fs.capabilities().range_resume || !dst_fs.capabilities().range_resume {
            return false;
        }
        let pmeta = match dst_fs.stat(&partial.path).await {
            Ok(meta) => meta,
            Err(_) => return false,
        };
        if pmeta.size < offset {
            return false;
        }

        let tail = offset.min(self.config.verify_tail);
        let start = offset - tail;
        let src_hash = self.hash_range(src_fs, &source.path, start, tail).await;
        let dst_hash = self.hash_range(dst_fs, &partial.path, start, tail).await;
        match (src_hash, dst_hash) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    async fn hash_range(
        &self,
        fs: &Arc<dyn FileSystem>,
        path: &str,
        start: u64,
        len: u64,
    ) -> Result<u64> {
        let mut handle = self.timed(fs.open_read(path, start)).await?;
        let mut hasher = StreamingHasher::new();
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(self.config.chunk_size as u64) as usize;
            let chunk = self.timed(handle.read_chunk(want)).await?;
            if chunk.is_empty() {
                break;
            }
            hasher.update(&chunk);
            remaining -= chunk.len() as u64;
        }
        Ok(hasher.finish())
    }

    async fn ensure_parent(&self, fs: &Arc<dyn FileSystem>, path: &str) -> Result<()> {
        let parent = fpath::parent(path);
        let fs = Arc::clone(fs);
        self.with_retries(|| {
            let fs = Arc::clone(&fs);
            let parent = parent.clone();
            async move { fs.mkdir_all(&parent).await }
        })
        .await
        .map_err(|e| match e {
            Error::ChannelClosed => Error::ChannelClosed,
            other => Error::PathUnavailable {
                path: fpath::parent(path),
                message: other.to_string(),
            },
        })
    }

    async fn discard_partial(&self, fs: &Arc<dyn FileSystem>, partial: &SidedPath) {
        match fs.remove(&partial.path).await {
            Ok(()) | Err(Error::NotFound { .. }) => {}
            Err(e) => warn!(path = %partial, error = %e, "failed to discard partial destination"),
        }
    }

    /// Run a metadata operation with per-call timeout and bounded
    /// backoff retries.
    async fn with_retries<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.timed(op()).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.retry_budget => {
                    let delay = self.config.backoff_delay(attempt);
                    debug!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "retrying after transient failure");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Apply the per-I/O-call deadline. Timeouts count as retryable.
    async fn timed<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        timed(self.config.io_timeout, fut).await
    }
}

async fn timed<T>(limit: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

fn outcome_from_error(error: Error, resume_offset: u64) -> TaskOutcome {
    if error.is_interruption() {
        TaskOutcome::Interrupted { resume_offset }
    } else {
        TaskOutcome::Failed { error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timed_maps_deadline_to_timeout() {
        let result: Result<()> = timed(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn interruption_parks_resumable() {
        assert!(matches!(
            outcome_from_error(Error::ChannelClosed, 42),
            TaskOutcome::Interrupted { resume_offset: 42 }
        ));
        assert!(matches!(
            outcome_from_error(
                Error::PermissionDenied { path: "/x".into() },
                0
            ),
            TaskOutcome::Failed { .. }
        ));
    }
}
