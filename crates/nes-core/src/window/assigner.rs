//! Slice and window boundaries for tumbling and sliding windows.

use super::WindowError;
use crate::time::Timestamp;

/// A half-open window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowInfo {
    /// Inclusive start.
    pub start: Timestamp,
    /// Exclusive end.
    pub end: Timestamp,
}

impl WindowInfo {
    /// Creates a window.
    #[must_use]
    pub const fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Returns true if `[start, end)` lies inside this window.
    #[must_use]
    pub const fn covers(&self, start: Timestamp, end: Timestamp) -> bool {
        self.start <= start && end <= self.end
    }
}

impl std::fmt::Display for WindowInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Maps timestamps to slices and slices to windows.
///
/// Windows start at multiples of `slide` and last `size`; slices have length
/// `gcd(size, slide)` so every window is an exact union of slices.
/// Tumbling windows are the case `slide == size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceAssigner {
    size: u64,
    slide: u64,
    slice_len: u64,
}

impl SliceAssigner {
    /// Creates an assigner for windows of `size` advancing by `slide`.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::InvalidDefinition`] if either value is zero or
    /// `slide` exceeds `size`.
    pub fn new(size: u64, slide: u64) -> Result<Self, WindowError> {
        if size == 0 || slide == 0 {
            return Err(WindowError::InvalidDefinition(
                "window size and slide must be positive".into(),
            ));
        }
        if slide > size {
            return Err(WindowError::InvalidDefinition(format!(
                "slide {slide} exceeds window size {size}"
            )));
        }
        Ok(Self {
            size,
            slide,
            slice_len: gcd(size, slide),
        })
    }

    /// Creates a tumbling-window assigner.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::InvalidDefinition`] if `size` is zero.
    pub fn tumbling(size: u64) -> Result<Self, WindowError> {
        Self::new(size, size)
    }

    /// Window length.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Window advance.
    #[must_use]
    pub const fn slide(&self) -> u64 {
        self.slide
    }

    /// Slice length.
    #[must_use]
    pub const fn slice_len(&self) -> u64 {
        self.slice_len
    }

    /// Start of the slice containing `ts`.
    #[inline]
    #[must_use]
    pub const fn slice_start(&self, ts: Timestamp) -> Timestamp {
        ts - ts % self.slice_len
    }

    /// Exclusive end of the slice containing `ts`.
    #[inline]
    #[must_use]
    pub const fn slice_end(&self, ts: Timestamp) -> Timestamp {
        self.slice_start(ts).saturating_add(self.slice_len)
    }

    /// Windows that cover the slice `[start, end)`, ordered by start.
    pub fn windows_of_slice(
        &self,
        start: Timestamp,
        end: Timestamp,
    ) -> impl Iterator<Item = WindowInfo> + '_ {
        let lowest = end.saturating_sub(self.size).div_ceil(self.slide) * self.slide;
        let highest = start - start % self.slide;
        let size = self.size;
        (lowest..=highest)
            .step_by(usize::try_from(self.slide).unwrap_or(usize::MAX))
            .map(move |s| WindowInfo::new(s, s.saturating_add(size)))
    }

    /// End of the last window covering the slice that starts at `start`.
    ///
    /// Once that window has triggered the slice can be dropped.
    #[must_use]
    pub const fn last_window_end(&self, start: Timestamp) -> Timestamp {
        (start - start % self.slide).saturating_add(self.size)
    }
}

const fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
