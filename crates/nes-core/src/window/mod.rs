//! # Window Module
//!
//! Slice-based window state for event-time aggregations and joins.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   records    ┌──────────────────────┐
//! │  Buffers   │─────────────▶│ SliceStore           │
//! └────────────┘              │  slice [0,5)  [5,10) │
//!       │ watermark           │  slice [10,15) ...   │
//!       ▼                     └──────────┬───────────┘
//! ┌──────────────────────────────┐       │ slices of ready windows
//! │ MultiOriginWatermarkProcessor│──────▶│
//! └──────────────────────────────┘       ▼
//!                              ┌──────────────────────┐
//!                              │ WindowTriggerHandler │──▶ emit
//!                              └──────────────────────┘
//! ```
//!
//! Windows are cut into non-overlapping slices of length
//! `gcd(size, slide)`. Every tuple updates exactly one slice; a window is the
//! combination of the slices it covers. A window triggers once the global
//! watermark passes its end, and slices are dropped once every window
//! covering them has triggered.
//!
//! ## Example
//!
//! ```rust
//! use nes_core::window::{SliceAssigner, WindowInfo};
//!
//! let assigner = SliceAssigner::new(10, 5).unwrap();
//! assert_eq!(assigner.slice_start(7), 5);
//! let windows: Vec<_> = assigner.windows_of_slice(5, 10).collect();
//! assert_eq!(windows, vec![WindowInfo::new(0, 10), WindowInfo::new(5, 15)]);
//! ```

mod aggregation;
mod assigner;
mod handler;
mod operator;
mod record;
mod slice;
mod store;

pub use aggregation::{
    Accumulator, AvgAccumulator, CountAccumulator, MaxAccumulator, MinAccumulator,
    ResultToI64, SumAccumulator,
};
pub use assigner::{SliceAssigner, WindowInfo};
pub use handler::WindowTriggerHandler;
pub use operator::{KeyedWindowAggregation, KeyedWindowJoin};
pub use record::{
    read_records, AggregateRecord, FixedRecord, JoinRecord, KeyedRecord, RecordWriter,
};
pub use slice::{AggregationSlice, BuildSide, JoinSlice, Slice};
pub use store::{
    DefaultTimeBasedSliceStore, PlannedWindow, SliceStore, TriggeredWindow, WindowTriggerState,
};

use crate::time::Timestamp;

/// Errors from window handling.
#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    /// Window size or slide is invalid.
    #[error("Invalid window definition: {0}")]
    InvalidDefinition(String),

    /// Every window covering the timestamp has already been triggered.
    #[error("Timestamp {timestamp} arrived after all of its windows were triggered")]
    LateTimestamp {
        /// Timestamp of the late tuple.
        timestamp: Timestamp,
    },

    /// Slice state could not be moved in or out of secondary storage.
    #[error("Slice state unavailable: {0}")]
    State(String),

    /// A buffer does not hold whole records.
    #[error("Buffer of {len} bytes does not hold whole {record_size}-byte records")]
    MalformedBuffer {
        /// Payload length.
        len: usize,
        /// Expected record size.
        record_size: usize,
    },
}
