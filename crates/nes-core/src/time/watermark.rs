//! Minimum-across-origins watermark tracking.

use std::sync::atomic::{AtomicU64, Ordering};

use fxhash::FxHashMap;
use tracing::trace;

use super::{TimeError, Timestamp, Watermark};
use crate::ids::OriginId;
use crate::sequence::{SequenceData, Sequencer};

struct OriginState {
    sequencer: Sequencer<(Timestamp, SequenceData)>,
    watermark: AtomicU64,
}

/// Tracks the watermark of every origin feeding an operator.
///
/// Each origin advances through its own [`Sequencer`], so an update only
/// takes effect once every update with a smaller sequence number from that
/// origin has been applied. The global watermark is the minimum over all
/// origins and never moves backwards.
///
/// Safe to update from many worker threads at once.
pub struct MultiOriginWatermarkProcessor {
    origins: FxHashMap<OriginId, OriginState>,
    global: AtomicU64,
}

impl MultiOriginWatermarkProcessor {
    /// Creates a processor tracking `origins`.
    #[must_use]
    pub fn new(origins: &[OriginId]) -> Self {
        let origins = origins
            .iter()
            .map(|origin| {
                (
                    *origin,
                    OriginState {
                        sequencer: Sequencer::new(),
                        watermark: AtomicU64::new(0),
                    },
                )
            })
            .collect();
        Self {
            origins,
            global: AtomicU64::new(0),
        }
    }

    /// Applies the watermark `ts` that arrived with `data` from `origin`.
    ///
    /// Returns the global watermark after the update.
    ///
    /// # Errors
    ///
    /// Returns [`TimeError::UnknownOrigin`] if `origin` is not tracked.
    pub fn update_watermark(
        &self,
        ts: Timestamp,
        data: SequenceData,
        origin: OriginId,
    ) -> Result<Watermark, TimeError> {
        let state = self
            .origins
            .get(&origin)
            .ok_or(TimeError::UnknownOrigin(origin))?;

        let mut ready = state.sequencer.is_next(data, (ts, data));
        while let Some((ts, applied)) = ready {
            state.watermark.fetch_max(ts, Ordering::AcqRel);
            ready = state.sequencer.advance_and_get_next(applied);
        }

        let min = self
            .origins
            .values()
            .map(|s| s.watermark.load(Ordering::Acquire))
            .min()
            .unwrap_or(0);
        let previous = self.global.fetch_max(min, Ordering::AcqRel);
        if min > previous {
            trace!(%origin, global = min, "global watermark advanced");
        }
        Ok(self.current_watermark())
    }

    /// Current global watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        Watermark::new(self.global.load(Ordering::Acquire))
    }

    /// Watermark of a single origin.
    #[must_use]
    pub fn origin_watermark(&self, origin: OriginId) -> Option<Watermark> {
        self.origins
            .get(&origin)
            .map(|s| Watermark::new(s.watermark.load(Ordering::Acquire)))
    }

    /// Number of tracked origins.
    #[must_use]
    pub fn num_origins(&self) -> usize {
        self.origins.len()
    }
}

impl std::fmt::Debug for MultiOriginWatermarkProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiOriginWatermarkProcessor")
            .field("origins", &self.origins.len())
            .field("global", &self.current_watermark())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_single_origin_in_order() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(0)]);
        for i in 1..=1000u64 {
            let old = processor.current_watermark();
            assert!(old.timestamp() < i);
            let wm = processor
                .update_watermark(i, SequenceData::single(i), OriginId(0))
                .unwrap();
            assert!(wm.timestamp() <= i);
        }
        assert_eq!(processor.current_watermark(), Watermark::new(1000));
    }

    #[test]
    fn test_out_of_order_updates_wait_for_gap() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(0)]);
        processor
            .update_watermark(30, SequenceData::single(3), OriginId(0))
            .unwrap();
        processor
            .update_watermark(20, SequenceData::single(2), OriginId(0))
            .unwrap();
        assert_eq!(processor.current_watermark(), Watermark::new(0));
        let wm = processor
            .update_watermark(10, SequenceData::single(1), OriginId(0))
            .unwrap();
        assert_eq!(wm, Watermark::new(30));
    }

    #[test]
    fn test_minimum_across_origins() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1), OriginId(2)]);
        processor
            .update_watermark(100, SequenceData::single(1), OriginId(1))
            .unwrap();
        assert_eq!(processor.current_watermark(), Watermark::new(0));
        processor
            .update_watermark(40, SequenceData::single(1), OriginId(2))
            .unwrap();
        assert_eq!(processor.current_watermark(), Watermark::new(40));
        assert_eq!(processor.origin_watermark(OriginId(1)), Some(Watermark::new(100)));
    }

    #[test]
    fn test_unknown_origin() {
        let processor = MultiOriginWatermarkProcessor::new(&[OriginId(1)]);
        assert!(matches!(
            processor.update_watermark(1, SequenceData::single(1), OriginId(9)),
            Err(TimeError::UnknownOrigin(OriginId(9)))
        ));
    }

    #[test]
    fn test_concurrent_updates() {
        const UPDATES: u64 = 2000;
        const THREADS: u64 = 8;
        let processor = Arc::new(MultiOriginWatermarkProcessor::new(&[OriginId(0)]));
        let counter = Arc::new(AtomicU64::new(1));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let processor = processor.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..UPDATES {
                        let i = counter.fetch_add(1, Ordering::SeqCst);
                        let wm = processor
                            .update_watermark(i, SequenceData::single(i), OriginId(0))
                            .unwrap();
                        assert!(wm.timestamp() < counter.load(Ordering::SeqCst));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(
            processor.current_watermark(),
            Watermark::new(UPDATES * THREADS)
        );
    }
}
