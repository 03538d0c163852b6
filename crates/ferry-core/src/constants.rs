//! Engine defaults and tuning constants for ferry.

use std::time::Duration;

// =============================================================================
// Transfer Constants
// =============================================================================

/// Chunk size for file data (256 KB).
///
/// Cancellation and pause requests take effect between chunks, so this also
/// bounds cancellation latency.
pub const CHUNK_SIZE: usize = 256 * 1024;

/// Default number of concurrent byte-transfer workers.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default cap on concurrently open file handles across all workers.
///
/// The remote channel multiplexes every handle over one session; remote
/// servers commonly limit open handles per session.
pub const DEFAULT_MAX_OPEN_HANDLES: usize = 8;

/// Suffix appended to in-flight destination files until completion.
pub const PARTIAL_SUFFIX: &str = ".partial";

// =============================================================================
// Retry Constants
// =============================================================================

/// Maximum attempts for a task failing with a retryable condition.
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Initial delay before the first retry; doubles per attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Upper bound on the retry delay.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(8);

/// Deadline for a single I/O call (not a whole task).
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Resume Constants
// =============================================================================

/// Bytes transferred between resume-offset checkpoints of an in-progress
/// task. A crash loses at most this much re-transfer.
pub const DEFAULT_CHECKPOINT_BYTES: u64 = 8 * 1024 * 1024;

/// Length of the trailing segment hashed on both sides to verify a partial
/// destination before resuming (256 KB).
pub const DEFAULT_VERIFY_TAIL: u64 = 256 * 1024;

/// File name of the persisted batch state inside the state directory.
pub const STATE_FILE_NAME: &str = "transfer-state.json";
