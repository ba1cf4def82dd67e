//! A [`SliceStore`] that keeps at most a fixed number of slices in memory
//! and spills the least recently used ones to disk.
//!
//! A spilled slice is one spill file holding a single buffer: the payload is
//! the serialized slice state, the sequence number the slice start and the
//! watermark the slice end. Spilled slices are reloaded when a tuple hits
//! them or when one of their windows triggers. With prefetching enabled,
//! slices whose first window is about to trigger are reloaded early; "about
//! to" is estimated from a linear model of past read times.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use nes_core::buffer::TupleBuffer;
use nes_core::sequence::SequenceData;
use nes_core::time::{Timestamp, Watermark};
use nes_core::window::{
    Accumulator, AggregationSlice, BuildSide, JoinSlice, PlannedWindow, Slice, SliceAssigner,
    SliceStore, TriggeredWindow, WindowError, WindowTriggerState,
};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::spill::{read_spill_file, write_spill_file};
use crate::StorageError;

/// Slice state that can be written to and restored from bytes.
pub trait SpillableState: Sized {
    /// Serializes the state.
    fn to_bytes(&self) -> Vec<u8>;

    /// Restores state written by [`to_bytes`](SpillableState::to_bytes).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] if `bytes` is malformed.
    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError>;
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], StorageError> {
        let end = self.position + N;
        let word = self
            .bytes
            .get(self.position..end)
            .and_then(|b| <[u8; N]>::try_from(b).ok())
            .ok_or_else(|| StorageError::Corrupted {
                position: self.position as u64,
                reason: format!("state truncated, {} bytes total", self.bytes.len()),
            })?;
        self.position = end;
        Ok(word)
    }

    fn u32(&mut self) -> Result<u32, StorageError> {
        self.take::<4>().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> Result<u64, StorageError> {
        self.take::<8>().map(u64::from_be_bytes)
    }

    fn i64(&mut self) -> Result<i64, StorageError> {
        self.take::<8>().map(i64::from_be_bytes)
    }

    fn len(&mut self) -> Result<usize, StorageError> {
        let position = self.position as u64;
        let n = self.u64()?;
        usize::try_from(n).map_err(|_| StorageError::Corrupted {
            position,
            reason: format!("length {n}"),
        })
    }

    fn finish(&self) -> Result<(), StorageError> {
        if self.position == self.bytes.len() {
            Ok(())
        } else {
            Err(StorageError::Corrupted {
                position: self.position as u64,
                reason: "trailing bytes".to_string(),
            })
        }
    }
}

fn workers_header(num_workers: usize) -> [u8; 4] {
    u32::try_from(num_workers).unwrap_or(u32::MAX).to_be_bytes()
}

impl<A: Accumulator> SpillableState for AggregationSlice<u64, A> {
    fn to_bytes(&self) -> Vec<u8> {
        let combined = self.combine();
        let mut out = Vec::with_capacity(12 + combined.len() * 24);
        out.extend_from_slice(&workers_header(self.num_workers()));
        out.extend_from_slice(&(combined.len() as u64).to_be_bytes());
        for (key, acc) in &combined {
            let (value, count) = acc.to_parts();
            out.extend_from_slice(&key.to_be_bytes());
            out.extend_from_slice(&value.to_be_bytes());
            out.extend_from_slice(&count.to_be_bytes());
        }
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut reader = ByteReader::new(bytes);
        let num_workers = reader.u32()? as usize;
        let entries = reader.len()?;
        let mut restored = Vec::with_capacity(entries.min(bytes.len() / 24));
        for _ in 0..entries {
            let key = reader.u64()?;
            let value = reader.i64()?;
            let count = reader.u64()?;
            restored.push((key, A::from_parts(value, count)));
        }
        reader.finish()?;
        Ok(Self::from_entries(num_workers, restored))
    }
}

fn write_rows(out: &mut Vec<u8>, rows: &[(u64, i64)]) {
    out.extend_from_slice(&(rows.len() as u64).to_be_bytes());
    for (key, value) in rows {
        out.extend_from_slice(&key.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    }
}

fn read_rows(reader: &mut ByteReader<'_>) -> Result<Vec<(u64, i64)>, StorageError> {
    let n = reader.len()?;
    let mut rows = Vec::with_capacity(n.min(reader.bytes.len() / 16));
    for _ in 0..n {
        rows.push((reader.u64()?, reader.i64()?));
    }
    Ok(rows)
}

impl SpillableState for JoinSlice<u64, i64> {
    fn to_bytes(&self) -> Vec<u8> {
        let left = self.rows(BuildSide::Left);
        let right = self.rows(BuildSide::Right);
        let mut out = Vec::with_capacity(20 + (left.len() + right.len()) * 16);
        out.extend_from_slice(&workers_header(self.num_workers()));
        write_rows(&mut out, &left);
        write_rows(&mut out, &right);
        out
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut reader = ByteReader::new(bytes);
        let num_workers = reader.u32()? as usize;
        let left = read_rows(&mut reader)?;
        let right = read_rows(&mut reader)?;
        reader.finish()?;
        Ok(Self::from_rows(num_workers, left, right))
    }
}

/// Ordinary least squares fit `y = a + b·x`, updated one sample at a time.
///
/// Used to predict spill read and write times from the number of bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearModel {
    n: f64,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_xy: f64,
}

impl LinearModel {
    /// Creates a model without samples.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the sample `(x, y)`.
    pub fn observe(&mut self, x: f64, y: f64) {
        self.n += 1.0;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_xy += x * y;
    }

    /// Number of samples.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn samples(&self) -> u64 {
        self.n as u64
    }

    /// Predicted `y` for `x`.
    ///
    /// Without samples the prediction is 0; with a single distinct `x` it is
    /// the mean of the observed `y`.
    #[must_use]
    pub fn predict(&self, x: f64) -> f64 {
        if self.n < 1.0 {
            return 0.0;
        }
        let denominator = self.n * self.sum_xx - self.sum_x * self.sum_x;
        if denominator.abs() < f64::EPSILON {
            return self.sum_y / self.n;
        }
        let slope = (self.n * self.sum_xy - self.sum_x * self.sum_y) / denominator;
        let intercept = (self.sum_y - slope * self.sum_x) / self.n;
        (intercept + slope * x).max(0.0)
    }
}

/// Configuration for a [`FileBackedSliceStore`].
#[derive(Debug, Clone)]
pub struct SliceStoreConfig {
    /// Slices kept in memory before the least recently used is spilled.
    pub memory_budget_slices: usize,
    /// Directory that receives the spill files.
    pub spill_dir: PathBuf,
    /// Reload spilled slices ahead of their windows.
    pub prefetch: bool,
}

impl Default for SliceStoreConfig {
    fn default() -> Self {
        Self {
            memory_budget_slices: 64,
            spill_dir: std::env::temp_dir().join("nes-spill"),
            prefetch: true,
        }
    }
}

impl SliceStoreConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> SliceStoreConfigBuilder {
        SliceStoreConfigBuilder::default()
    }
}

/// Builder for [`SliceStoreConfig`].
#[derive(Debug, Default)]
pub struct SliceStoreConfigBuilder {
    config: SliceStoreConfig,
}

impl SliceStoreConfigBuilder {
    /// Sets the number of resident slices. Values below 1 are raised to 1.
    #[must_use]
    pub fn memory_budget_slices(mut self, slices: usize) -> Self {
        self.config.memory_budget_slices = slices.max(1);
        self
    }

    /// Sets the spill directory.
    #[must_use]
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.spill_dir = dir.into();
        self
    }

    /// Enables or disables prefetching.
    #[must_use]
    pub fn prefetch(mut self, enabled: bool) -> Self {
        self.config.prefetch = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SliceStoreConfig {
        self.config
    }
}

/// Spill activity of a [`FileBackedSliceStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpillStats {
    /// Slices written to disk.
    pub spilled: u64,
    /// Slices read back from disk.
    pub reloaded: u64,
    /// Slices currently in memory.
    pub resident: usize,
    /// Slices currently on disk.
    pub on_disk: usize,
}

enum Resident<S> {
    InMemory { slice: Arc<Slice<S>>, last_used: u64 },
    Spilled { end: Timestamp, path: PathBuf, bytes: u64 },
}

impl<S> Resident<S> {
    fn end(&self) -> Timestamp {
        match self {
            Self::InMemory { slice, .. } => slice.end(),
            Self::Spilled { end, .. } => *end,
        }
    }
}

struct Inner<S> {
    slices: BTreeMap<Timestamp, Resident<S>>,
    trigger: WindowTriggerState,
    clock: u64,
    resident: usize,
    spilled: u64,
    reloaded: u64,
    read_model: LinearModel,
    write_model: LinearModel,
}

static STORE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Slice store bounded by a number of resident slices.
pub struct FileBackedSliceStore<S> {
    assigner: SliceAssigner,
    config: SliceStoreConfig,
    dir: PathBuf,
    inner: Mutex<Inner<S>>,
}

#[allow(clippy::cast_precision_loss)]
fn millis_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

impl<S: SpillableState> FileBackedSliceStore<S> {
    /// Creates a store and its spill directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory cannot be created.
    pub fn new(assigner: SliceAssigner, config: SliceStoreConfig) -> Result<Self, StorageError> {
        let id = STORE_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = config
            .spill_dir
            .join(format!("store-{}-{id}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), budget = config.memory_budget_slices, "file-backed slice store created");
        Ok(Self {
            assigner,
            config,
            dir,
            inner: Mutex::new(Inner {
                slices: BTreeMap::new(),
                trigger: WindowTriggerState::new(),
                clock: 0,
                resident: 0,
                spilled: 0,
                reloaded: 0,
                read_model: LinearModel::new(),
                write_model: LinearModel::new(),
            }),
        })
    }

    /// Directory holding this store's spill files.
    #[must_use]
    pub fn spill_dir(&self) -> &Path {
        &self.dir
    }

    /// Current spill activity.
    #[must_use]
    pub fn stats(&self) -> SpillStats {
        let inner = self.inner.lock();
        SpillStats {
            spilled: inner.spilled,
            reloaded: inner.reloaded,
            resident: inner.resident,
            on_disk: inner.slices.len() - inner.resident,
        }
    }

    /// Predicted milliseconds to read a spilled slice of `bytes`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn predicted_read_ms(&self, bytes: u64) -> f64 {
        self.inner.lock().read_model.predict(bytes as f64)
    }

    /// Predicted milliseconds to write a spilled slice of `bytes`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn predicted_write_ms(&self, bytes: u64) -> f64 {
        self.inner.lock().write_model.predict(bytes as f64)
    }

    fn slice_path(&self, start: Timestamp) -> PathBuf {
        self.dir.join(format!("slice-{start}.spill"))
    }

    #[allow(clippy::cast_precision_loss)]
    fn spill(&self, inner: &mut Inner<S>, slice: &Slice<S>) -> Result<Resident<S>, StorageError> {
        let begin = Instant::now();
        let buffer = TupleBuffer::from_vec(slice.state().to_bytes());
        buffer.set_number_of_tuples(1);
        buffer.set_sequence_data(SequenceData::single(slice.start()));
        buffer.set_watermark(slice.end());
        let path = self.slice_path(slice.start());
        let bytes = write_spill_file(&path, std::slice::from_ref(&buffer))?;
        inner.write_model.observe(bytes as f64, millis_since(begin));
        inner.spilled += 1;
        trace!(start = slice.start(), bytes, "slice spilled");
        Ok(Resident::Spilled {
            end: slice.end(),
            path,
            bytes,
        })
    }

    #[allow(clippy::cast_precision_loss)]
    fn reload(
        inner: &mut Inner<S>,
        start: Timestamp,
        end: Timestamp,
        path: &Path,
        bytes: u64,
    ) -> Result<Arc<Slice<S>>, StorageError> {
        let begin = Instant::now();
        let buffers = read_spill_file(path)?;
        let [buffer] = buffers.as_slice() else {
            return Err(StorageError::Corrupted {
                position: start,
                reason: format!("{} buffers in slice file", buffers.len()),
            });
        };
        let state = S::from_bytes(buffer.as_slice())?;
        inner.read_model.observe(bytes as f64, millis_since(begin));
        inner.reloaded += 1;
        if let Err(err) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %err, "failed to remove spill file");
        }
        trace!(start, bytes, "slice reloaded");
        Ok(Arc::new(Slice::new(start, end, state)))
    }

    /// Makes the slice at `start` resident and returns it.
    fn resident(
        &self,
        inner: &mut Inner<S>,
        start: Timestamp,
    ) -> Result<Option<Arc<Slice<S>>>, StorageError> {
        inner.clock += 1;
        let clock = inner.clock;
        let spilled = match inner.slices.get_mut(&start) {
            None => return Ok(None),
            Some(Resident::InMemory { slice, last_used }) => {
                *last_used = clock;
                return Ok(Some(Arc::clone(slice)));
            }
            Some(Resident::Spilled { end, path, bytes }) => (*end, path.clone(), *bytes),
        };
        let (end, path, bytes) = spilled;
        let slice = Self::reload(inner, start, end, &path, bytes)?;
        inner.slices.insert(
            start,
            Resident::InMemory {
                slice: Arc::clone(&slice),
                last_used: clock,
            },
        );
        inner.resident += 1;
        Ok(Some(slice))
    }

    /// Spills least recently used slices no one else holds until the budget
    /// is met.
    fn enforce_budget(&self, inner: &mut Inner<S>) -> Result<(), StorageError> {
        while inner.resident > self.config.memory_budget_slices {
            let victim = inner
                .slices
                .iter()
                .filter_map(|(start, r)| match r {
                    Resident::InMemory { slice, last_used } if Arc::strong_count(slice) == 1 => {
                        Some((*last_used, *start))
                    }
                    _ => None,
                })
                .min();
            let Some((_, start)) = victim else {
                // Every resident slice is in use.
                return Ok(());
            };
            let Some(Resident::InMemory { slice, .. }) = inner.slices.remove(&start) else {
                return Ok(());
            };
            match self.spill(inner, &slice) {
                Ok(spilled) => {
                    inner.slices.insert(start, spilled);
                    inner.resident -= 1;
                }
                Err(err) => {
                    inner.slices.insert(start, Resident::InMemory { slice, last_used: 0 });
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Reloads spilled slices whose first window ends before `watermark`
    /// plus the predicted read time.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn prefetch(&self, inner: &mut Inner<S>, watermark: Watermark) -> Result<(), StorageError> {
        let candidates: Vec<Timestamp> = inner
            .slices
            .iter()
            .filter_map(|(start, r)| match r {
                Resident::Spilled { end, bytes, .. } => {
                    let horizon = watermark.timestamp()
                        + inner.read_model.predict(*bytes as f64).ceil() as u64;
                    let first_end = self
                        .assigner
                        .windows_of_slice(*start, *end)
                        .next()
                        .map(|w| w.end)?;
                    (first_end <= horizon).then_some(*start)
                }
                Resident::InMemory { .. } => None,
            })
            .collect();
        for start in candidates {
            self.resident(inner, start)?;
        }
        Ok(())
    }

    fn resolve(
        &self,
        inner: &mut Inner<S>,
        planned: Vec<PlannedWindow>,
    ) -> Result<Vec<TriggeredWindow<S>>, StorageError> {
        let mut windows = Vec::with_capacity(planned.len());
        for p in planned {
            let mut slices = Vec::with_capacity(p.slice_starts.len());
            for start in &p.slice_starts {
                if let Some(slice) = self.resident(inner, *start)? {
                    slices.push(slice);
                }
            }
            windows.push(TriggeredWindow {
                window: p.window,
                sequence_number: p.sequence_number,
                slices,
            });
        }
        Ok(windows)
    }

    fn ranges(inner: &Inner<S>) -> Vec<(Timestamp, Timestamp)> {
        inner.slices.iter().map(|(start, r)| (*start, r.end())).collect()
    }
}

impl<S: SpillableState + Send + Sync> SliceStore<S> for FileBackedSliceStore<S> {
    fn assigner(&self) -> &SliceAssigner {
        &self.assigner
    }

    fn get_slices_or_create(
        &self,
        ts: Timestamp,
        create: &dyn Fn(Timestamp, Timestamp) -> S,
    ) -> Result<Arc<Slice<S>>, WindowError> {
        let mut inner = self.inner.lock();
        if inner.trigger.is_late(&self.assigner, ts) {
            return Err(WindowError::LateTimestamp { timestamp: ts });
        }
        let start = self.assigner.slice_start(ts);
        let slice = if let Some(slice) = self.resident(&mut inner, start)? {
            slice
        } else {
            let end = self.assigner.slice_end(ts);
            let slice = Arc::new(Slice::new(start, end, create(start, end)));
            let clock = inner.clock;
            inner.slices.insert(
                start,
                Resident::InMemory {
                    slice: Arc::clone(&slice),
                    last_used: clock,
                },
            );
            inner.resident += 1;
            slice
        };
        self.enforce_budget(&mut inner)?;
        Ok(slice)
    }

    fn get_triggerable_window_slices(
        &self,
        watermark: Watermark,
    ) -> Result<Vec<TriggeredWindow<S>>, WindowError> {
        let mut inner = self.inner.lock();
        if self.config.prefetch {
            self.prefetch(&mut inner, watermark)?;
        }
        if watermark.timestamp() <= inner.trigger.triggered_until() {
            return Ok(Vec::new());
        }
        let ranges = Self::ranges(&inner);
        let planned = inner.trigger.plan(&self.assigner, &ranges, Some(watermark));
        Ok(self.resolve(&mut inner, planned)?)
    }

    fn get_all_non_triggered_slices(&self) -> Result<Vec<TriggeredWindow<S>>, WindowError> {
        let mut inner = self.inner.lock();
        let ranges = Self::ranges(&inner);
        let planned = inner.trigger.plan(&self.assigner, &ranges, None);
        Ok(self.resolve(&mut inner, planned)?)
    }

    fn garbage_collect_slices_and_windows(&self, watermark: Watermark) -> usize {
        let mut inner = self.inner.lock();
        let collectable: Vec<Timestamp> = inner
            .slices
            .keys()
            .copied()
            .filter(|start| inner.trigger.is_collectable(&self.assigner, *start, watermark))
            .collect();
        for start in &collectable {
            let removed = inner.slices.remove(start);
            match removed {
                Some(Resident::InMemory { .. }) => inner.resident -= 1,
                Some(Resident::Spilled { path, .. }) => {
                    if let Err(err) = std::fs::remove_file(&path) {
                        warn!(path = %path.display(), error = %err, "failed to remove spill file");
                    }
                }
                None => {}
            }
        }
        collectable.len()
    }

    fn num_slices(&self) -> usize {
        self.inner.lock().slices.len()
    }
}

impl<S> Drop for FileBackedSliceStore<S> {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.dir) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %err, "failed to remove spill directory");
            }
        }
    }
}

impl<S> std::fmt::Debug for FileBackedSliceStore<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FileBackedSliceStore")
            .field("assigner", &self.assigner)
            .field("dir", &self.dir)
            .field("slices", &inner.slices.len())
            .field("resident", &inner.resident)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nes_core::ids::WorkerThreadId;
    use nes_core::window::{CountAccumulator, SumAccumulator};
    use tempfile::tempdir;

    type SumSlice = AggregationSlice<u64, SumAccumulator>;

    fn store(dir: &Path, budget: usize, prefetch: bool) -> FileBackedSliceStore<SumSlice> {
        let config = SliceStoreConfig::builder()
            .spill_dir(dir)
            .memory_budget_slices(budget)
            .prefetch(prefetch)
            .build();
        FileBackedSliceStore::new(SliceAssigner::new(10, 5).unwrap(), config).unwrap()
    }

    fn add(store: &FileBackedSliceStore<SumSlice>, ts: u64, key: u64, value: i64) {
        let create = |_: Timestamp, _: Timestamp| SumSlice::new(2);
        store
            .get_slices_or_create(ts, &create)
            .unwrap()
            .state()
            .update(WorkerThreadId(0), key, value);
    }

    fn window_sum(window: &TriggeredWindow<SumSlice>, key: u64) -> i64 {
        let mut combined = fxhash::FxHashMap::default();
        for slice in &window.slices {
            slice.state().merge_into(&mut combined);
        }
        combined.get(&key).map_or(0, Accumulator::result)
    }

    #[test]
    fn test_aggregation_state_round_trip() {
        let slice: AggregationSlice<u64, CountAccumulator> = AggregationSlice::new(3);
        slice.update(WorkerThreadId(0), 7, 1);
        slice.update(WorkerThreadId(2), 7, 1);
        slice.update(WorkerThreadId(1), 9, 1);

        let restored = AggregationSlice::<u64, CountAccumulator>::from_bytes(&slice.to_bytes()).unwrap();
        assert_eq!(restored.num_workers(), 3);
        let mut rows = restored.lower();
        rows.sort_unstable();
        assert_eq!(rows, vec![(7, 2), (9, 1)]);
    }

    #[test]
    fn test_join_state_round_trip() {
        let slice: JoinSlice<u64, i64> = JoinSlice::new(2);
        slice.insert(WorkerThreadId(0), BuildSide::Left, 1, -5);
        slice.insert(WorkerThreadId(1), BuildSide::Right, 1, 6);
        let restored = JoinSlice::<u64, i64>::from_bytes(&slice.to_bytes()).unwrap();
        assert_eq!(restored.num_workers(), 2);
        assert_eq!(restored.probe(), vec![(1, -5, 6)]);
    }

    #[test]
    fn test_truncated_state_is_rejected() {
        let slice: SumSlice = AggregationSlice::new(1);
        slice.update(WorkerThreadId(0), 1, 1);
        let bytes = slice.to_bytes();
        assert!(matches!(
            SumSlice::from_bytes(&bytes[..bytes.len() - 1]),
            Err(StorageError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_linear_model() {
        let mut model = LinearModel::new();
        assert!(model.predict(100.0).abs() < f64::EPSILON);
        model.observe(10.0, 3.0);
        assert!((model.predict(50.0) - 3.0).abs() < 1e-9);
        model.observe(20.0, 5.0);
        model.observe(30.0, 7.0);
        assert!((model.predict(40.0) - 9.0).abs() < 1e-9);
        assert_eq!(model.samples(), 3);
    }

    #[test]
    fn test_budget_of_one_still_triggers_every_window() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, false);
        for ts in 0..40 {
            add(&store, ts, 1, 1);
        }
        let stats = store.stats();
        assert!(stats.spilled >= 7);
        assert_eq!(stats.resident, 1);
        assert_eq!(stats.on_disk, 7);

        let windows = store.get_triggerable_window_slices(Watermark::new(40)).unwrap();
        let sums: Vec<_> = windows
            .iter()
            .map(|w| (w.window.start, w.sequence_number, window_sum(w, 1)))
            .collect();
        assert_eq!(
            sums,
            vec![(0, 1, 10), (5, 2, 10), (10, 3, 10), (15, 4, 10), (20, 5, 10), (25, 6, 10), (30, 7, 10)]
        );
        drop(windows);
        assert!(store.stats().reloaded >= 7);
    }

    #[test]
    fn test_spilled_slice_reloads_on_insert() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, false);
        add(&store, 1, 1, 4);
        add(&store, 6, 1, 1);
        assert_eq!(store.stats().on_disk, 1);
        add(&store, 2, 1, 3);
        assert_eq!(store.stats().reloaded, 1);

        let windows = store.get_all_non_triggered_slices().unwrap();
        assert_eq!(window_sum(&windows[0], 1), 8);
    }

    #[test]
    fn test_prefetch_loads_slices_ahead_of_trigger() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, true);
        add(&store, 1, 1, 1);
        add(&store, 20, 1, 1);
        assert_eq!(store.stats().on_disk, 1);

        // [0,5) first feeds [0,10), which is due at watermark 10.
        assert!(store.get_triggerable_window_slices(Watermark::new(9)).unwrap().is_empty());
        assert_eq!(store.stats().on_disk, 1);
        let windows = store.get_triggerable_window_slices(Watermark::new(10)).unwrap();
        assert_eq!(windows.len(), 1);
        assert_eq!(window_sum(&windows[0], 1), 1);
    }

    #[test]
    fn test_gc_removes_spill_files() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 1, false);
        add(&store, 1, 1, 1);
        add(&store, 30, 1, 1);
        assert_eq!(std::fs::read_dir(store.spill_dir()).unwrap().count(), 1);

        let fired = store.get_triggerable_window_slices(Watermark::new(15)).unwrap();
        drop(fired);
        // Reloading for the trigger already removed the file.
        assert_eq!(std::fs::read_dir(store.spill_dir()).unwrap().count(), 0);
        assert_eq!(store.garbage_collect_slices_and_windows(Watermark::new(15)), 1);
        assert_eq!(store.num_slices(), 1);
    }

    #[test]
    fn test_late_tuple_is_rejected() {
        let dir = tempdir().unwrap();
        let store = store(dir.path(), 4, false);
        add(&store, 1, 1, 1);
        store.get_triggerable_window_slices(Watermark::new(10)).unwrap();
        let create = |_: Timestamp, _: Timestamp| SumSlice::new(1);
        assert!(matches!(
            store.get_slices_or_create(3, &create),
            Err(WindowError::LateTimestamp { timestamp: 3 })
        ));
    }

    #[test]
    fn test_drop_removes_directory() {
        let dir = tempdir().unwrap();
        let path = {
            let store = store(dir.path(), 1, false);
            add(&store, 1, 1, 1);
            add(&store, 30, 1, 1);
            store.spill_dir().to_path_buf()
        };
        assert!(!path.exists());
    }
}
