//! # Time Module
//!
//! Event time, watermarks and multi-origin watermark tracking.
//!
//! ## Concepts
//!
//! - **Watermark**: assertion that no more data with timestamp ≤ the
//!   watermark will arrive from an origin
//! - **Global watermark**: the minimum watermark across all origins feeding
//!   an operator
//!
//! ## Multi-Origin Watermark Tracking
//!
//! Watermark updates carry the [`SequenceData`](crate::sequence::SequenceData)
//! of the buffer they arrived with, so out-of-order updates from one origin
//! are applied in producer order:
//!
//! ```rust
//! use nes_core::ids::OriginId;
//! use nes_core::sequence::SequenceData;
//! use nes_core::time::{MultiOriginWatermarkProcessor, Watermark};
//!
//! let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1), OriginId(2)]);
//! processor.update_watermark(50, SequenceData::single(1), OriginId(1)).unwrap();
//! processor.update_watermark(30, SequenceData::single(1), OriginId(2)).unwrap();
//!
//! // Combined watermark is the minimum
//! assert_eq!(processor.current_watermark(), Watermark::new(30));
//! ```

mod watermark;

pub use watermark::MultiOriginWatermarkProcessor;

use crate::ids::OriginId;

/// Event-time timestamp in milliseconds.
pub type Timestamp = u64;

/// A watermark timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Watermark(pub Timestamp);

impl Watermark {
    /// Creates a watermark.
    #[inline]
    #[must_use]
    pub const fn new(timestamp: Timestamp) -> Self {
        Self(timestamp)
    }

    /// The watermark timestamp.
    #[inline]
    #[must_use]
    pub const fn timestamp(self) -> Timestamp {
        self.0
    }

    /// Returns true if an event at `timestamp` arrives behind this watermark.
    #[inline]
    #[must_use]
    pub const fn is_late(self, timestamp: Timestamp) -> bool {
        timestamp < self.0
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "wm@{}", self.0)
    }
}

/// Errors from time handling.
#[derive(Debug, thiserror::Error)]
pub enum TimeError {
    /// The origin is not tracked by this processor.
    #[error("Origin {0} is not tracked")]
    UnknownOrigin(OriginId),
}
