//! Checksums for resume verification.
//!
//! Uses xxHash64: fast enough to hash the verified tail segment inline with
//! the transfer without measurable overhead.

use xxhash_rust::xxh64::{xxh64, Xxh64};

/// Streaming xxHash64 hasher for data that arrives in chunks.
#[derive(Clone)]
pub struct StreamingHasher {
    inner: Xxh64,
}

impl std::fmt::Debug for StreamingHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingHasher").finish_non_exhaustive()
    }
}

impl StreamingHasher {
    /// Create a new hasher.
    pub fn new() -> Self {
        Self { inner: Xxh64::new(0) }
    }

    /// Feed a chunk of data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finish and return the checksum.
    pub fn finish(&self) -> u64 {
        self.inner.digest()
    }
}

impl Default for StreamingHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute xxHash64 for arbitrary data.
pub fn hash_xxh64(data: &[u8]) -> u64 {
    xxh64(data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_oneshot() {
        let data = b"the quick brown fox jumps over the lazy dog";

        let mut hasher = StreamingHasher::new();
        for chunk in data.chunks(7) {
            hasher.update(chunk);
        }

        assert_eq!(hasher.finish(), hash_xxh64(data));
    }

    #[test]
    fn distinct_inputs_distinct_hashes() {
        assert_ne!(hash_xxh64(b"hello world"), hash_xxh64(b"goodbye world"));
        assert_eq!(hash_xxh64(b"hello world"), hash_xxh64(b"hello world"));
    }

    #[test]
    fn empty_input_is_stable() {
        let hasher = StreamingHasher::new();
        assert_eq!(hasher.finish(), hash_xxh64(&[]));
    }
}
