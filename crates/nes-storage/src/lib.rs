//! # `NebulaStream` Storage
//!
//! Disk-backed state for the `NebulaStream` runtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐      evict (LRU)     ┌──────────────┐
//! │ FileBackedSliceStore       │ ───────────────────► │ spill files  │
//! │  resident slices ≤ budget  │ ◄─────────────────── │ (one/slice)  │
//! └────────────────────────────┘   reload / prefetch  └──────────────┘
//! ```
//!
//! Spill files hold [`TupleBuffer`](nes_core::buffer::TupleBuffer)s in a
//! fixed big-endian layout, so the same format also backs the network
//! sink's overflow queue.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Spill file format - Buffers persisted with their metadata and children
pub mod spill;

/// File-backed slice store - Slice state that overflows to disk
pub mod file_slice_store;

pub use file_slice_store::{
    FileBackedSliceStore, LinearModel, SliceStoreConfig, SliceStoreConfigBuilder, SpillStats,
    SpillableState,
};
pub use spill::{read_spill_file, write_spill_file, SpillReader, SpillWriter};

/// Result type for nes-storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors from spill files and file-backed state
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file content is not a valid spill file
    #[error("Corrupted spill data at {position}: {reason}")]
    Corrupted {
        /// Offset or sequence number where decoding failed.
        position: u64,
        /// What was wrong.
        reason: String,
    },
}

impl From<StorageError> for nes_core::window::WindowError {
    fn from(err: StorageError) -> Self {
        Self::State(err.to_string())
    }
}
