//! ferry-test-utils: Test doubles for the ferry transfer engine.
//!
//! Provides an in-memory filesystem capability with scriptable fault
//! injection, so engine behavior under network loss and permission
//! failures can be tested deterministically without a real channel.

pub mod memory_fs;

pub use memory_fs::{FaultKind, FaultOp, MemoryFs};
