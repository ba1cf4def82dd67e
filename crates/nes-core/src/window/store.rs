//! Slice stores: where slice state lives between creation and garbage
//! collection.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use super::assigner::{SliceAssigner, WindowInfo};
use super::slice::Slice;
use super::WindowError;
use crate::sequence::INITIAL_SEQUENCE_NUMBER;
use crate::time::{Timestamp, Watermark};

/// A window ready to be emitted, with the slices it covers.
#[derive(Debug)]
pub struct TriggeredWindow<S> {
    /// Window bounds.
    pub window: WindowInfo,
    /// Strictly increasing per store, starting at 1.
    pub sequence_number: u64,
    /// Slices inside the window, ordered by start.
    pub slices: Vec<Arc<Slice<S>>>,
}

/// Storage of slice state for one window operator.
///
/// Every window is handed out exactly once, either by
/// [`get_triggerable_window_slices`](SliceStore::get_triggerable_window_slices)
/// or by [`get_all_non_triggered_slices`](SliceStore::get_all_non_triggered_slices).
pub trait SliceStore<S>: Send + Sync {
    /// The slice layout.
    fn assigner(&self) -> &SliceAssigner;

    /// Returns the slice containing `ts`, creating it with `create(start,
    /// end)` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::LateTimestamp`] if every window covering `ts`
    /// has already been triggered.
    fn get_slices_or_create(
        &self,
        ts: Timestamp,
        create: &dyn Fn(Timestamp, Timestamp) -> S,
    ) -> Result<Arc<Slice<S>>, WindowError>;

    /// Windows ending at or before `watermark` that were not handed out yet.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::State`] if spilled slices cannot be reloaded.
    fn get_triggerable_window_slices(
        &self,
        watermark: Watermark,
    ) -> Result<Vec<TriggeredWindow<S>>, WindowError>;

    /// Every window with state that was not handed out yet.
    ///
    /// # Errors
    ///
    /// Returns [`WindowError::State`] if spilled slices cannot be reloaded.
    fn get_all_non_triggered_slices(&self) -> Result<Vec<TriggeredWindow<S>>, WindowError>;

    /// Drops slices whose windows have all been triggered and which end at
    /// or before `watermark`. Returns the number of dropped slices.
    fn garbage_collect_slices_and_windows(&self, watermark: Watermark) -> usize;

    /// Number of live slices.
    fn num_slices(&self) -> usize;
}

/// A window chosen for triggering, before its slices are resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedWindow {
    /// Window bounds.
    pub window: WindowInfo,
    /// Assigned sequence number.
    pub sequence_number: u64,
    /// Starts of the slices inside the window.
    pub slice_starts: Vec<Timestamp>,
}

/// Tracks which windows have been handed out.
///
/// Windows are handed out in end order, so everything ending at or before
/// [`triggered_until`](WindowTriggerState::triggered_until) is done.
#[derive(Debug, Clone)]
pub struct WindowTriggerState {
    triggered_until: Timestamp,
    next_sequence: u64,
}

impl Default for WindowTriggerState {
    fn default() -> Self {
        Self {
            triggered_until: 0,
            next_sequence: INITIAL_SEQUENCE_NUMBER,
        }
    }
}

impl WindowTriggerState {
    /// Creates state with nothing triggered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// End of the last triggered window.
    #[must_use]
    pub fn triggered_until(&self) -> Timestamp {
        self.triggered_until
    }

    /// Returns true if every window covering `ts` has been triggered.
    #[must_use]
    pub fn is_late(&self, assigner: &SliceAssigner, ts: Timestamp) -> bool {
        assigner.last_window_end(assigner.slice_start(ts)) <= self.triggered_until
    }

    /// Returns true if the slice starting at `start` is no longer needed.
    #[must_use]
    pub fn is_collectable(
        &self,
        assigner: &SliceAssigner,
        start: Timestamp,
        watermark: Watermark,
    ) -> bool {
        let end = assigner.slice_end(start);
        end <= watermark.timestamp() && assigner.last_window_end(start) <= self.triggered_until
    }

    /// Chooses the windows over `slices` (as `(start, end)` pairs) that end
    /// at or before `up_to`, or all pending windows for `None`, and marks
    /// them triggered.
    pub fn plan(
        &mut self,
        assigner: &SliceAssigner,
        slices: &[(Timestamp, Timestamp)],
        up_to: Option<Watermark>,
    ) -> Vec<PlannedWindow> {
        let ready: BTreeSet<WindowInfo> = slices
            .iter()
            .flat_map(|(start, end)| assigner.windows_of_slice(*start, *end))
            .filter(|w| w.end > self.triggered_until)
            .filter(|w| up_to.map_or(true, |wm| w.end <= wm.timestamp()))
            .collect();

        let mut planned = Vec::with_capacity(ready.len());
        for window in ready {
            let slice_starts = slices
                .iter()
                .filter(|(start, end)| window.covers(*start, *end))
                .map(|(start, _)| *start)
                .collect();
            planned.push(PlannedWindow {
                window,
                sequence_number: self.next_sequence,
                slice_starts,
            });
            self.next_sequence += 1;
            self.triggered_until = self.triggered_until.max(window.end);
        }
        planned
    }
}

struct StoreInner<S> {
    slices: BTreeMap<Timestamp, Arc<Slice<S>>>,
    trigger: WindowTriggerState,
}

impl<S> StoreInner<S> {
    fn resolve(&self, planned: Vec<PlannedWindow>) -> Vec<TriggeredWindow<S>> {
        planned
            .into_iter()
            .map(|p| TriggeredWindow {
                window: p.window,
                sequence_number: p.sequence_number,
                slices: p
                    .slice_starts
                    .iter()
                    .filter_map(|start| self.slices.get(start).cloned())
                    .collect(),
            })
            .collect()
    }

    fn ranges(&self) -> Vec<(Timestamp, Timestamp)> {
        self.slices.values().map(|s| (s.start(), s.end())).collect()
    }
}

/// In-memory slice store ordered by slice start.
pub struct DefaultTimeBasedSliceStore<S> {
    assigner: SliceAssigner,
    inner: RwLock<StoreInner<S>>,
}

impl<S> DefaultTimeBasedSliceStore<S> {
    /// Creates an empty store.
    #[must_use]
    pub fn new(assigner: SliceAssigner) -> Self {
        Self {
            assigner,
            inner: RwLock::new(StoreInner {
                slices: BTreeMap::new(),
                trigger: WindowTriggerState::new(),
            }),
        }
    }
}

impl<S: Send + Sync> SliceStore<S> for DefaultTimeBasedSliceStore<S> {
    fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    fn get_slices_or_create(
        &self,
        ts: Timestamp,
        create: &dyn Fn(Timestamp, Timestamp) -> S,
    ) -> Result<Arc<Slice<S>>, WindowError> {
        let start = self.assigner.slice_start(ts);
        {
            let inner = self.inner.read();
            if inner.trigger.is_late(&self.assigner, ts) {
                return Err(WindowError::LateTimestamp { timestamp: ts });
            }
            if let Some(slice) = inner.slices.get(&start) {
                return Ok(Arc::clone(slice));
            }
        }
        let mut inner = self.inner.write();
        if inner.trigger.is_late(&self.assigner, ts) {
            return Err(WindowError::LateTimestamp { timestamp: ts });
        }
        let end = self.assigner.slice_end(ts);
        let slice = inner
            .slices
            .entry(start)
            .or_insert_with(|| Arc::new(Slice::new(start, end, create(start, end))));
        Ok(Arc::clone(slice))
    }

    fn get_triggerable_window_slices(
        &self,
        watermark: Watermark,
    ) -> Result<Vec<TriggeredWindow<S>>, WindowError> {
        let mut inner = self.inner.write();
        if watermark.timestamp() <= inner.trigger.triggered_until() {
            return Ok(Vec::new());
        }
        let ranges = inner.ranges();
        let planned = inner.trigger.plan(&self.assigner, &ranges, Some(watermark));
        if !planned.is_empty() {
            trace!(%watermark, windows = planned.len(), "windows triggered");
        }
        Ok(inner.resolve(planned))
    }

    fn get_all_non_triggered_slices(&self) -> Result<Vec<TriggeredWindow<S>>, WindowError> {
        let mut inner = self.inner.write();
        let ranges = inner.ranges();
        let planned = inner.trigger.plan(&self.assigner, &ranges, None);
        Ok(inner.resolve(planned))
    }

    fn garbage_collect_slices_and_windows(&self, watermark: Watermark) -> usize {
        let mut inner = self.inner.write();
        let StoreInner { slices, trigger } = &mut *inner;
        let before = slices.len();
        slices.retain(|start, _| !trigger.is_collectable(&self.assigner, *start, watermark));
        before - slices.len()
    }

    fn num_slices(&self) -> usize {
        self.inner.read().slices.len()
    }
}

impl<S> std::fmt::Debug for DefaultTimeBasedSliceStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("DefaultTimeBasedSliceStore")
            .field("assigner", &self.assigner)
            .field("slices", &inner.slices.len())
            .field("triggered_until", &inner.trigger.triggered_until())
            .finish()
    }
}
