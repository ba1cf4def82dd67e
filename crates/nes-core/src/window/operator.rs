//! Window stages over [`KeyedRecord`] input.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use fxhash::FxHashMap;
use smallvec::SmallVec;
use tracing::{debug, trace};

use super::aggregation::{Accumulator, ResultToI64};
use super::assigner::SliceAssigner;
use super::handler::WindowTriggerHandler;
use super::record::{read_records, AggregateRecord, JoinRecord, KeyedRecord, RecordWriter};
use super::slice::{AggregationSlice, BuildSide, JoinSlice};
use super::store::{DefaultTimeBasedSliceStore, SliceStore, TriggeredWindow};
use super::WindowError;
use crate::buffer::TupleBuffer;
use crate::engine::{
    ExecutionContext, PipelineContext, PipelineStage, QueryTerminationType, StageError,
};
use crate::ids::OriginId;
use crate::time::Timestamp;

/// Watermark carried by `buffer`, or the largest record timestamp minus
/// `allowed_lateness` when the producer left it unset.
fn buffer_watermark(buffer: &TupleBuffer, max_ts: Option<Timestamp>, allowed_lateness: u64) -> Timestamp {
    match buffer.watermark() {
        0 => max_ts.map_or(0, |ts| ts.saturating_sub(allowed_lateness)),
        wm => wm,
    }
}

/// Keyed window aggregation.
///
/// Each input row updates the slice holding its timestamp; triggered
/// windows are emitted as [`AggregateRecord`] rows, one sequence number per
/// window.
pub struct KeyedWindowAggregation<A: Accumulator> {
    handler: WindowTriggerHandler<AggregationSlice<u64, A>>,
    output_origin: OriginId,
    allowed_lateness: u64,
    num_workers: AtomicUsize,
    late_tuples: AtomicU64,
}

impl<A: Accumulator + 'static> KeyedWindowAggregation<A> {
    /// Creates an aggregation backed by an in-memory store.
    #[must_use]
    pub fn new(assigner: SliceAssigner, input_origins: &[OriginId], output_origin: OriginId) -> Self {
        Self::with_store(
            Arc::new(DefaultTimeBasedSliceStore::new(assigner)),
            input_origins,
            output_origin,
        )
    }

    /// Creates an aggregation over `store`.
    #[must_use]
    pub fn with_store(
        store: Arc<dyn SliceStore<AggregationSlice<u64, A>>>,
        input_origins: &[OriginId],
        output_origin: OriginId,
    ) -> Self {
        Self {
            handler: WindowTriggerHandler::new(input_origins, store),
            output_origin,
            allowed_lateness: 0,
            num_workers: AtomicUsize::new(1),
            late_tuples: AtomicU64::new(0),
        }
    }

    /// Holds the derived watermark back by `millis`.
    #[must_use]
    pub fn allowed_lateness(mut self, millis: u64) -> Self {
        self.allowed_lateness = millis;
        self
    }

    /// Rows dropped because all of their windows had fired.
    #[must_use]
    pub fn late_tuples(&self) -> u64 {
        self.late_tuples.load(Ordering::Relaxed)
    }

    /// The trigger handler.
    #[must_use]
    pub fn handler(&self) -> &WindowTriggerHandler<AggregationSlice<u64, A>> {
        &self.handler
    }

    fn emit_windows(
        &self,
        windows: Vec<TriggeredWindow<AggregationSlice<u64, A>>>,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), StageError> {
        for triggered in windows {
            let mut combined = FxHashMap::default();
            for slice in &triggered.slices {
                slice.state().merge_into(&mut combined);
            }
            let mut rows: Vec<_> = combined
                .into_iter()
                .filter(|(_, acc)| !acc.is_empty())
                .collect();
            rows.sort_unstable_by_key(|(key, _)| *key);

            let window = triggered.window;
            let mut writer = RecordWriter::new(self.output_origin, triggered.sequence_number, window.end);
            for (key, acc) in rows {
                let record = AggregateRecord {
                    window_start: window.start,
                    window_end: window.end,
                    key,
                    value: acc.result().to_i64(),
                };
                writer.push(&record, ctx)?;
            }
            writer.finish(ctx);
            trace!(%window, seq = triggered.sequence_number, "window emitted");
        }
        Ok(())
    }
}

impl<A: Accumulator + 'static> PipelineStage for KeyedWindowAggregation<A> {
    fn setup(&self, ctx: &PipelineContext) -> Result<(), StageError> {
        self.num_workers.store(ctx.num_worker_threads.max(1), Ordering::Relaxed);
        Ok(())
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let records = read_records::<KeyedRecord>(buffer)?;
        let num_workers = self.num_workers.load(Ordering::Relaxed);
        let create = |_: Timestamp, _: Timestamp| AggregationSlice::<u64, A>::new(num_workers);
        let store = self.handler.store();
        let worker = ctx.worker_thread_id();

        let mut max_ts = None;
        for record in &records {
            max_ts = max_ts.max(Some(record.timestamp));
            match store.get_slices_or_create(record.timestamp, &create) {
                Ok(slice) => slice.state().update(worker, record.key, record.value),
                Err(WindowError::LateTimestamp { .. }) => {
                    self.late_tuples.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let watermark = buffer_watermark(buffer, max_ts, self.allowed_lateness);
        let windows =
            self.handler
                .on_buffer_processed(watermark, buffer.sequence_data(), buffer.origin_id())?;
        self.emit_windows(windows, ctx)
    }

    fn terminate(
        &self,
        termination: QueryTerminationType,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), StageError> {
        let windows = self.handler.terminate(termination)?;
        debug!(windows = windows.len(), late = self.late_tuples(), "aggregation terminating");
        self.emit_windows(windows, ctx)
    }

    fn name(&self) -> &str {
        "keyed-window-aggregation"
    }
}

impl<A: Accumulator> std::fmt::Debug for KeyedWindowAggregation<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedWindowAggregation")
            .field("handler", &self.handler)
            .field("output_origin", &self.output_origin)
            .finish_non_exhaustive()
    }
}

/// Keyed window equi-join of two inputs.
///
/// The side of a buffer is decided by its origin. Triggered windows emit
/// every `(key, left, right)` match among the rows of the window as
/// [`JoinRecord`] rows.
pub struct KeyedWindowJoin {
    handler: WindowTriggerHandler<JoinSlice<u64, i64>>,
    left_origins: SmallVec<[OriginId; 4]>,
    output_origin: OriginId,
    allowed_lateness: u64,
    num_workers: AtomicUsize,
    late_tuples: AtomicU64,
}

impl KeyedWindowJoin {
    /// Creates a join backed by an in-memory store.
    #[must_use]
    pub fn new(
        assigner: SliceAssigner,
        left_origins: &[OriginId],
        right_origins: &[OriginId],
        output_origin: OriginId,
    ) -> Self {
        Self::with_store(
            Arc::new(DefaultTimeBasedSliceStore::new(assigner)),
            left_origins,
            right_origins,
            output_origin,
        )
    }

    /// Creates a join over `store`.
    #[must_use]
    pub fn with_store(
        store: Arc<dyn SliceStore<JoinSlice<u64, i64>>>,
        left_origins: &[OriginId],
        right_origins: &[OriginId],
        output_origin: OriginId,
    ) -> Self {
        let origins: Vec<_> = left_origins.iter().chain(right_origins).copied().collect();
        Self {
            handler: WindowTriggerHandler::new(&origins, store),
            left_origins: left_origins.iter().copied().collect(),
            output_origin,
            allowed_lateness: 0,
            num_workers: AtomicUsize::new(1),
            late_tuples: AtomicU64::new(0),
        }
    }

    /// Holds the derived watermark back by `millis`.
    #[must_use]
    pub fn allowed_lateness(mut self, millis: u64) -> Self {
        self.allowed_lateness = millis;
        self
    }

    /// Rows dropped because all of their windows had fired.
    #[must_use]
    pub fn late_tuples(&self) -> u64 {
        self.late_tuples.load(Ordering::Relaxed)
    }

    fn side_of(&self, origin: OriginId) -> BuildSide {
        if self.left_origins.contains(&origin) {
            BuildSide::Left
        } else {
            BuildSide::Right
        }
    }

    fn emit_windows(
        &self,
        windows: Vec<TriggeredWindow<JoinSlice<u64, i64>>>,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), StageError> {
        for triggered in windows {
            let mut rows = Vec::new();
            for left in &triggered.slices {
                for right in &triggered.slices {
                    rows.extend(left.state().probe_with(right.state()));
                }
            }
            rows.sort_unstable();

            let window = triggered.window;
            let mut writer = RecordWriter::new(self.output_origin, triggered.sequence_number, window.end);
            for (key, left, right) in rows {
                let record = JoinRecord {
                    window_start: window.start,
                    window_end: window.end,
                    key,
                    left,
                    right,
                };
                writer.push(&record, ctx)?;
            }
            writer.finish(ctx);
        }
        Ok(())
    }
}

impl PipelineStage for KeyedWindowJoin {
    fn setup(&self, ctx: &PipelineContext) -> Result<(), StageError> {
        self.num_workers.store(ctx.num_worker_threads.max(1), Ordering::Relaxed);
        Ok(())
    }

    fn execute(&self, buffer: &TupleBuffer, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        let records = read_records::<KeyedRecord>(buffer)?;
        let num_workers = self.num_workers.load(Ordering::Relaxed);
        let create = |_: Timestamp, _: Timestamp| JoinSlice::<u64, i64>::new(num_workers);
        let store = self.handler.store();
        let side = self.side_of(buffer.origin_id());
        let worker = ctx.worker_thread_id();

        let mut max_ts = None;
        for record in &records {
            max_ts = max_ts.max(Some(record.timestamp));
            match store.get_slices_or_create(record.timestamp, &create) {
                Ok(slice) => slice.state().insert(worker, side, record.key, record.value),
                Err(WindowError::LateTimestamp { .. }) => {
                    self.late_tuples.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let watermark = buffer_watermark(buffer, max_ts, self.allowed_lateness);
        let windows =
            self.handler
                .on_buffer_processed(watermark, buffer.sequence_data(), buffer.origin_id())?;
        self.emit_windows(windows, ctx)
    }

    fn terminate(
        &self,
        termination: QueryTerminationType,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), StageError> {
        let windows = self.handler.terminate(termination)?;
        self.emit_windows(windows, ctx)
    }

    fn name(&self) -> &str {
        "keyed-window-join"
    }
}

impl std::fmt::Debug for KeyedWindowJoin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedWindowJoin")
            .field("handler", &self.handler)
            .field("left_origins", &self.left_origins)
            .finish_non_exhaustive()
    }
}
