//! Engine configuration.
//!
//! Every tunable the engine consults is passed in explicitly at
//! construction; there is no ambient global state.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    CHUNK_SIZE, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_CHECKPOINT_BYTES,
    DEFAULT_CONCURRENCY, DEFAULT_IO_TIMEOUT, DEFAULT_MAX_OPEN_HANDLES, DEFAULT_RETRY_BUDGET,
    DEFAULT_VERIFY_TAIL,
};

/// Configuration for the transfer engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of concurrent transfer workers.
    pub concurrency: usize,
    /// Cap on concurrently open file handles across all workers.
    pub max_open_handles: usize,
    /// Chunk size for byte movement.
    pub chunk_size: usize,
    /// Maximum attempts for retryable failures.
    pub retry_budget: u32,
    /// Initial retry delay; doubles per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub backoff_cap: Duration,
    /// Deadline applied to each individual I/O call.
    pub io_timeout: Duration,
    /// Bytes between resume-offset checkpoints while a task is in progress.
    pub checkpoint_bytes: u64,
    /// Trailing segment length verified before resuming a partial transfer.
    pub verify_tail: u64,
    /// Directory holding the persisted batch state file.
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_open_handles: DEFAULT_MAX_OPEN_HANDLES,
            chunk_size: CHUNK_SIZE,
            retry_budget: DEFAULT_RETRY_BUDGET,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            io_timeout: DEFAULT_IO_TIMEOUT,
            checkpoint_bytes: DEFAULT_CHECKPOINT_BYTES,
            verify_tail: DEFAULT_VERIFY_TAIL,
            state_dir: PathBuf::from("."),
        }
    }
}

impl EngineConfig {
    /// Create a config with default values and the given state directory.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    /// Set the number of concurrent workers (clamped to at least 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the open-handle cap (clamped to at least the worker count).
    pub fn with_max_open_handles(mut self, max: usize) -> Self {
        self.max_open_handles = max.max(self.concurrency);
        self
    }

    /// Set the transfer chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(4096);
        self
    }

    /// Set the retry budget for retryable failures.
    pub fn with_retry_budget(mut self, attempts: u32) -> Self {
        self.retry_budget = attempts;
        self
    }

    /// Set the retry backoff bounds.
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap.max(base);
        self
    }

    /// Set the per-I/O-call timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Set the checkpoint interval in bytes.
    pub fn with_checkpoint_bytes(mut self, bytes: u64) -> Self {
        self.checkpoint_bytes = bytes.max(1);
        self
    }

    /// Set the resume verification tail length.
    pub fn with_verify_tail(mut self, bytes: u64) -> Self {
        self.verify_tail = bytes;
        self
    }

    /// Retry delay before the given 1-based attempt, exponential with cap.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << shift);
        delay.min(self.backoff_cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.retry_budget, DEFAULT_RETRY_BUDGET);
        assert_eq!(config.chunk_size, CHUNK_SIZE);
    }

    #[test]
    fn config_builder() {
        let config = EngineConfig::new("/tmp/state")
            .with_concurrency(4)
            .with_retry_budget(5)
            .with_io_timeout(Duration::from_secs(10));

        assert_eq!(config.concurrency, 4);
        assert_eq!(config.retry_budget, 5);
        assert_eq!(config.io_timeout, Duration::from_secs(10));
        assert_eq!(config.state_dir, PathBuf::from("/tmp/state"));
    }

    #[test]
    fn concurrency_clamps_to_one() {
        let config = EngineConfig::default().with_concurrency(0);
        assert_eq!(config.concurrency, 1);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = EngineConfig::default()
            .with_backoff(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(config.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(config.backoff_delay(10), Duration::from_millis(350));
    }
}
