//! Slice state for aggregations and joins.

use std::hash::Hash;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::aggregation::Accumulator;
use crate::ids::WorkerThreadId;
use crate::time::Timestamp;

/// One slice `[start, end)` and its state.
#[derive(Debug)]
pub struct Slice<S> {
    start: Timestamp,
    end: Timestamp,
    state: S,
}

impl<S> Slice<S> {
    /// Creates a slice.
    #[must_use]
    pub fn new(start: Timestamp, end: Timestamp, state: S) -> Self {
        Self { start, end, state }
    }

    /// Inclusive start.
    #[must_use]
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Exclusive end.
    #[must_use]
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Slice state.
    #[must_use]
    pub fn state(&self) -> &S {
        &self.state
    }
}

/// Keyed partial aggregates, partitioned by worker thread.
///
/// Each worker updates its own map, so the locks are uncontended on the hot
/// path; the maps are merged when the slice's windows trigger.
pub struct AggregationSlice<K, A> {
    maps: Vec<Mutex<FxHashMap<K, A>>>,
}

impl<K, A> AggregationSlice<K, A>
where
    K: Eq + Hash + Clone,
    A: Accumulator,
{
    /// Creates empty state for `num_workers` threads.
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        Self {
            maps: (0..num_workers.max(1))
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
        }
    }

    /// Restores state from combined entries.
    #[must_use]
    pub fn from_entries(num_workers: usize, entries: impl IntoIterator<Item = (K, A)>) -> Self {
        let slice = Self::new(num_workers);
        slice.maps[0].lock().extend(entries);
        slice
    }

    /// Adds `value` for `key` on behalf of `worker`.
    pub fn update(&self, worker: WorkerThreadId, key: K, value: i64) {
        let index = worker.0 % self.maps.len();
        self.maps[index].lock().entry(key).or_default().add(value);
    }

    /// Merges this slice's partials into `target`.
    pub fn merge_into(&self, target: &mut FxHashMap<K, A>) {
        for map in &self.maps {
            for (key, acc) in map.lock().iter() {
                target.entry(key.clone()).or_default().merge(acc);
            }
        }
    }

    /// Merges the per-worker maps.
    #[must_use]
    pub fn combine(&self) -> FxHashMap<K, A> {
        let mut combined = FxHashMap::default();
        self.merge_into(&mut combined);
        combined
    }

    /// Final `(key, result)` rows of this slice alone.
    #[must_use]
    pub fn lower(&self) -> Vec<(K, A::Output)> {
        self.combine()
            .into_iter()
            .filter(|(_, acc)| !acc.is_empty())
            .map(|(key, acc)| (key, acc.result()))
            .collect()
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn num_keys(&self) -> usize {
        self.combine().len()
    }

    /// Returns true if no worker added a value.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(|m| m.lock().is_empty())
    }

    /// Number of per-worker maps.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.maps.len()
    }
}

impl<K, A> std::fmt::Debug for AggregationSlice<K, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationSlice")
            .field("workers", &self.maps.len())
            .finish_non_exhaustive()
    }
}

/// Input side of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildSide {
    /// Left input.
    Left,
    /// Right input.
    Right,
}

/// Join build state: per-worker chains for each side.
pub struct JoinSlice<K, V> {
    left: Vec<Mutex<Vec<(K, V)>>>,
    right: Vec<Mutex<Vec<(K, V)>>>,
}

impl<K, V> JoinSlice<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates empty chains for `num_workers` threads.
    #[must_use]
    pub fn new(num_workers: usize) -> Self {
        let chains = || (0..num_workers.max(1)).map(|_| Mutex::new(Vec::new())).collect();
        Self {
            left: chains(),
            right: chains(),
        }
    }

    /// Restores state from the rows of both sides.
    #[must_use]
    pub fn from_rows(
        num_workers: usize,
        left: impl IntoIterator<Item = (K, V)>,
        right: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        let slice = Self::new(num_workers);
        slice.left[0].lock().extend(left);
        slice.right[0].lock().extend(right);
        slice
    }

    fn chains(&self, side: BuildSide) -> &[Mutex<Vec<(K, V)>>] {
        match side {
            BuildSide::Left => &self.left,
            BuildSide::Right => &self.right,
        }
    }

    /// Appends a row to `side` on behalf of `worker`.
    pub fn insert(&self, worker: WorkerThreadId, side: BuildSide, key: K, value: V) {
        let chains = self.chains(side);
        chains[worker.0 % chains.len()].lock().push((key, value));
    }

    /// All rows of `side`.
    #[must_use]
    pub fn rows(&self, side: BuildSide) -> Vec<(K, V)> {
        self.chains(side)
            .iter()
            .flat_map(|chain| chain.lock().clone())
            .collect()
    }

    /// Number of rows on `side`.
    #[must_use]
    pub fn len(&self, side: BuildSide) -> usize {
        self.chains(side).iter().map(|c| c.lock().len()).sum()
    }

    /// Returns true if neither side holds a row.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len(BuildSide::Left) == 0 && self.len(BuildSide::Right) == 0
    }

    /// Number of per-worker chains per side.
    #[must_use]
    pub fn num_workers(&self) -> usize {
        self.left.len()
    }

    /// Joins this slice's left rows with its own right rows.
    #[must_use]
    pub fn probe(&self) -> Vec<(K, V, V)> {
        self.probe_with(self)
    }

    /// Joins this slice's left rows with the right rows of `other`.
    #[must_use]
    pub fn probe_with(&self, other: &Self) -> Vec<(K, V, V)> {
        let mut table: FxHashMap<K, Vec<V>> = FxHashMap::default();
        for (key, value) in self.rows(BuildSide::Left) {
            table.entry(key).or_default().push(value);
        }
        let mut joined = Vec::new();
        for (key, right) in other.rows(BuildSide::Right) {
            if let Some(matches) = table.get(&key) {
                joined.extend(
                    matches
                        .iter()
                        .map(|left| (key.clone(), left.clone(), right.clone())),
                );
            }
        }
        joined
    }
}

impl<K, V> std::fmt::Debug for JoinSlice<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinSlice")
            .field("workers", &self.left.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{MaxAccumulator, SumAccumulator};

    #[test]
    fn test_aggregation_combines_workers() {
        let slice: AggregationSlice<u64, SumAccumulator> = AggregationSlice::new(2);
        slice.update(WorkerThreadId(0), 1, 10);
        slice.update(WorkerThreadId(1), 1, 5);
        slice.update(WorkerThreadId(1), 2, 7);
        // Worker ids beyond the map count wrap around.
        slice.update(WorkerThreadId(2), 2, 1);

        let mut rows = slice.lower();
        rows.sort_unstable();
        assert_eq!(rows, vec![(1, 15), (2, 8)]);
        assert_eq!(slice.num_keys(), 2);
    }

    #[test]
    fn test_merge_across_slices() {
        let a: AggregationSlice<u64, MaxAccumulator> = AggregationSlice::new(1);
        let b: AggregationSlice<u64, MaxAccumulator> = AggregationSlice::new(1);
        a.update(WorkerThreadId(0), 1, 3);
        b.update(WorkerThreadId(0), 1, 8);
        let mut combined = FxHashMap::default();
        a.merge_into(&mut combined);
        b.merge_into(&mut combined);
        assert_eq!(combined[&1].result(), Some(8));
    }

    #[test]
    fn test_join_probe() {
        let slice: JoinSlice<u64, i64> = JoinSlice::new(2);
        slice.insert(WorkerThreadId(0), BuildSide::Left, 1, 10);
        slice.insert(WorkerThreadId(1), BuildSide::Left, 1, 11);
        slice.insert(WorkerThreadId(0), BuildSide::Left, 2, 20);
        slice.insert(WorkerThreadId(1), BuildSide::Right, 1, 100);
        slice.insert(WorkerThreadId(0), BuildSide::Right, 3, 300);

        let mut rows = slice.probe();
        rows.sort_unstable();
        assert_eq!(rows, vec![(1, 10, 100), (1, 11, 100)]);
        assert_eq!(slice.len(BuildSide::Left), 3);
    }

    #[test]
    fn test_join_across_slices() {
        let first: JoinSlice<u64, i64> = JoinSlice::new(1);
        let second: JoinSlice<u64, i64> = JoinSlice::new(1);
        first.insert(WorkerThreadId(0), BuildSide::Left, 4, 1);
        second.insert(WorkerThreadId(0), BuildSide::Right, 4, 2);
        assert!(first.probe().is_empty());
        assert_eq!(first.probe_with(&second), vec![(4, 1, 2)]);
    }
}
