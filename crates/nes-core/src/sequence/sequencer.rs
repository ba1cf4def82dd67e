//! In-order release of chunked, out-of-order units.

use std::sync::atomic::{AtomicUsize, Ordering};

use fxhash::FxHashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{SequenceData, INITIAL_CHUNK_NUMBER, INITIAL_SEQUENCE_NUMBER};

/// Default number of independently locked buckets.
pub const DEFAULT_SHARDS: usize = 16;

#[derive(Debug)]
struct Frontier {
    /// Key of the next unit to release.
    expected: (u64, u64),
    /// True while the unit at `expected` is handed out and not yet advanced.
    in_flight: bool,
}

/// Releases values in strictly increasing `(sequence_number, chunk_number)`
/// order.
///
/// Units that arrive early are parked in sharded buckets keyed by their
/// sequence number, so threads submitting different sequence numbers do not
/// contend on one lock. Only the frontier advance itself is serialized.
///
/// A unit is released when it is the expected one and its predecessor has
/// been advanced past with [`Sequencer::advance_and_get_next`]. The chunk
/// marked `last_chunk` completes its sequence number; the next expected unit
/// is then chunk 0 of the following sequence number.
///
/// # Example
///
/// ```rust,ignore
/// let sequencer = Sequencer::new();
/// assert_eq!(sequencer.is_next(SequenceData::new(1, 1, true), 200), None);
/// assert_eq!(sequencer.is_next(SequenceData::new(1, 0, false), 100), Some(100));
/// assert_eq!(sequencer.advance_and_get_next(SequenceData::new(1, 0, false)), Some(200));
/// ```
pub struct Sequencer<T> {
    frontier: Mutex<Frontier>,
    shards: Box<[Mutex<FxHashMap<(u64, u64), T>>]>,
    pending: AtomicUsize,
}

impl<T> Default for Sequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Sequencer<T> {
    /// Creates a sequencer expecting `(1, 0)` first.
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(INITIAL_SEQUENCE_NUMBER, INITIAL_CHUNK_NUMBER)
    }

    /// Creates a sequencer expecting `(sequence_number, chunk_number)` first.
    #[must_use]
    pub fn starting_at(sequence_number: u64, chunk_number: u64) -> Self {
        Self::with_shards(sequence_number, chunk_number, DEFAULT_SHARDS)
    }

    /// Creates a sequencer with a custom number of buckets.
    #[must_use]
    pub fn with_shards(sequence_number: u64, chunk_number: u64, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| Mutex::new(FxHashMap::default()))
            .collect();
        Self {
            frontier: Mutex::new(Frontier {
                expected: (sequence_number, chunk_number),
                in_flight: false,
            }),
            shards,
            pending: AtomicUsize::new(0),
        }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn shard(&self, key: (u64, u64)) -> &Mutex<FxHashMap<(u64, u64), T>> {
        &self.shards[(key.0 as usize) % self.shards.len()]
    }

    /// Registers `value` under `data`.
    ///
    /// Returns `value` immediately if `data` is the next expected unit and
    /// nothing is in flight; otherwise parks it and returns `None`. Units at
    /// or below the frontier, and units already parked, are ignored.
    pub fn is_next(&self, data: SequenceData, value: T) -> Option<T> {
        let key = data.key();
        {
            let mut frontier = self.frontier.lock();
            if key < frontier.expected || (key == frontier.expected && frontier.in_flight) {
                debug!(%data, "ignoring already consumed unit");
                return None;
            }
            if key == frontier.expected {
                frontier.in_flight = true;
                return Some(value);
            }
        }

        {
            let mut shard = self.shard(key).lock();
            if shard.contains_key(&key) {
                debug!(%data, "ignoring duplicate unit");
                return None;
            }
            shard.insert(key, value);
            self.pending.fetch_add(1, Ordering::AcqRel);
        }

        // The frontier may have reached this key while it was being parked.
        let mut frontier = self.frontier.lock();
        if frontier.expected == key && !frontier.in_flight {
            return self.take_parked(&mut frontier, key);
        }
        None
    }

    /// Marks `data` as fully processed and returns the next parked unit if it
    /// is now ready.
    ///
    /// # Panics
    ///
    /// Panics if `data` is not the unit currently in flight. Advancing past a
    /// unit that was never released means the caller broke the protocol.
    pub fn advance_and_get_next(&self, data: SequenceData) -> Option<T> {
        let mut frontier = self.frontier.lock();
        assert!(
            frontier.in_flight && frontier.expected == data.key(),
            "advance on {data} but frontier is at {:?} (in_flight={})",
            frontier.expected,
            frontier.in_flight
        );
        let next = data.successor_key();
        frontier.expected = next;
        frontier.in_flight = false;
        self.take_parked(&mut frontier, next)
    }

    fn take_parked(&self, frontier: &mut Frontier, key: (u64, u64)) -> Option<T> {
        let value = self.shard(key).lock().remove(&key)?;
        self.pending.fetch_sub(1, Ordering::AcqRel);
        frontier.in_flight = true;
        Some(value)
    }

    /// Number of parked units.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Key of the next unit to release.
    #[must_use]
    pub fn expected(&self) -> (u64, u64) {
        self.frontier.lock().expected
    }
}

impl<T> std::fmt::Debug for Sequencer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frontier = self.frontier.lock();
        f.debug_struct("Sequencer")
            .field("expected", &frontier.expected)
            .field("in_flight", &frontier.in_flight)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
