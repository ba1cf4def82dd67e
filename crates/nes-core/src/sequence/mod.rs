//! # Sequencing
//!
//! Reconstructs strictly increasing logical order from units that arrive out
//! of order and may be split into chunks.
//!
//! - [`Sequencer`] releases values in `(sequence_number, chunk_number)` order.
//! - [`SequenceShredder`] resolves spanning tuples whose bytes straddle raw
//!   input buffers, claiming each exactly once across threads.
//! - [`InputFormatter`] splits delimited raw buffers into records on top of
//!   the shredder.

mod formatter;
mod sequencer;
mod shredder;

use std::fmt;

pub use formatter::{FormattedRecords, InputFormatter};
pub use sequencer::{Sequencer, DEFAULT_SHARDS};
pub use shredder::{SequenceShredder, SpanningTuple, StagedBuffer, DEFAULT_RING_CAPACITY};

/// First sequence number a producer assigns.
pub const INITIAL_SEQUENCE_NUMBER: u64 = 1;

/// First chunk number within a sequence number.
pub const INITIAL_CHUNK_NUMBER: u64 = 0;

/// Ordering key of a logical unit.
///
/// Units are ordered by [`SequenceData::key`]; `last_chunk` marks the chunk
/// that completes its sequence number and does not take part in ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SequenceData {
    /// Producer-assigned, monotonically increasing number.
    pub sequence_number: u64,
    /// Position of this chunk within its sequence number.
    pub chunk_number: u64,
    /// True for the chunk that completes the sequence number.
    pub last_chunk: bool,
}

impl SequenceData {
    /// Creates a new ordering key.
    #[inline]
    #[must_use]
    pub const fn new(sequence_number: u64, chunk_number: u64, last_chunk: bool) -> Self {
        Self {
            sequence_number,
            chunk_number,
            last_chunk,
        }
    }

    /// A single-chunk unit.
    #[inline]
    #[must_use]
    pub const fn single(sequence_number: u64) -> Self {
        Self::new(sequence_number, INITIAL_CHUNK_NUMBER, true)
    }

    /// `(sequence_number, chunk_number)` pair used for ordering.
    #[inline]
    #[must_use]
    pub const fn key(&self) -> (u64, u64) {
        (self.sequence_number, self.chunk_number)
    }

    /// Key of the unit that follows this one.
    #[inline]
    #[must_use]
    pub const fn successor_key(&self) -> (u64, u64) {
        if self.last_chunk {
            (self.sequence_number + 1, INITIAL_CHUNK_NUMBER)
        } else {
            (self.sequence_number, self.chunk_number + 1)
        }
    }
}

impl fmt::Display for SequenceData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}{}",
            self.sequence_number,
            self.chunk_number,
            if self.last_chunk { "!" } else { "" }
        )
    }
}

/// Errors from sequencing.
#[derive(Debug, thiserror::Error)]
pub enum SequenceError {
    /// The sequence number is ahead of the ring buffer window; retry later.
    #[error("Sequence number {sequence_number} is outside the ring window [{tail}, {tail}+{capacity})")]
    OutOfRange {
        /// Offending sequence number.
        sequence_number: u64,
        /// Oldest sequence number still tracked.
        tail: u64,
        /// Ring capacity.
        capacity: u64,
    },

    /// The sequence number was already released.
    #[error("Sequence number {0} was already processed")]
    AlreadyProcessed(u64),

    /// The ring capacity is not a power of two.
    #[error("Ring capacity {0} must be a non-zero power of two")]
    InvalidCapacity(usize),
}
