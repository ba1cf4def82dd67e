//! Couples watermark tracking with a slice store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use super::store::{SliceStore, TriggeredWindow};
use crate::engine::{QueryTerminationType, StageError};
use crate::ids::OriginId;
use crate::sequence::SequenceData;
use crate::time::{MultiOriginWatermarkProcessor, Timestamp, Watermark};

/// Decides when windows fire.
///
/// Every processed buffer reports its watermark; the handler advances the
/// global watermark, hands out the windows it completed and drops slices
/// that no pending window needs.
pub struct WindowTriggerHandler<S> {
    processor: MultiOriginWatermarkProcessor,
    store: Arc<dyn SliceStore<S>>,
    terminated: AtomicBool,
}

impl<S> WindowTriggerHandler<S> {
    /// Creates a handler for input from `origins`.
    #[must_use]
    pub fn new(origins: &[OriginId], store: Arc<dyn SliceStore<S>>) -> Self {
        Self {
            processor: MultiOriginWatermarkProcessor::new(origins),
            store,
            terminated: AtomicBool::new(false),
        }
    }

    /// The slice store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn SliceStore<S>> {
        &self.store
    }

    /// Current global watermark.
    #[must_use]
    pub fn current_watermark(&self) -> Watermark {
        self.processor.current_watermark()
    }

    /// Applies the watermark of a processed buffer and returns the windows
    /// it completed.
    ///
    /// # Errors
    ///
    /// Fails for an untracked origin or if slice state cannot be loaded.
    pub fn on_buffer_processed(
        &self,
        watermark: Timestamp,
        sequence: SequenceData,
        origin: OriginId,
    ) -> Result<Vec<TriggeredWindow<S>>, StageError> {
        let global = self.processor.update_watermark(watermark, sequence, origin)?;
        let windows = self.store.get_triggerable_window_slices(global)?;
        let collected = self.store.garbage_collect_slices_and_windows(global);
        if collected > 0 {
            debug!(%global, collected, "slices garbage collected");
        }
        Ok(windows)
    }

    /// Windows still to emit when the query ends.
    ///
    /// A graceful end flushes every pending window once; any other
    /// termination drops them.
    ///
    /// # Errors
    ///
    /// Fails if slice state cannot be loaded.
    pub fn terminate(
        &self,
        termination: QueryTerminationType,
    ) -> Result<Vec<TriggeredWindow<S>>, StageError> {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return Ok(Vec::new());
        }
        match termination {
            QueryTerminationType::Graceful => Ok(self.store.get_all_non_triggered_slices()?),
            QueryTerminationType::HardStop | QueryTerminationType::Failure => {
                debug!(slices = self.store.num_slices(), ?termination, "dropping pending windows");
                Ok(Vec::new())
            }
        }
    }
}

impl<S> std::fmt::Debug for WindowTriggerHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowTriggerHandler")
            .field("processor", &self.processor)
            .field("slices", &self.store.num_slices())
            .finish_non_exhaustive()
    }
}
