//! ferry-core: Shared library for the ferry transfer engine.
//!
//! This crate provides:
//! - Error taxonomy and result type
//! - Engine configuration and tuning constants
//! - The filesystem capability trait and a local-disk implementation
//! - Slash-path utilities
//! - Checksums for resume verification
//! - Logging setup

pub mod checksum;
pub mod config;
pub mod constants;
pub mod error;
pub mod fs;
pub mod local;
pub mod logging;
pub mod path;

pub use checksum::{hash_xxh64, StreamingHasher};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use fs::{FileSystem, FsCapabilities, FsEntry, FsMetadata, ReadHandle, WriteHandle};
pub use local::LocalFs;
pub use logging::{init_logging, LogFormat};
