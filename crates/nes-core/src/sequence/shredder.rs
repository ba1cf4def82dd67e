//! Exactly-once resolution of spanning tuples across raw input buffers.
//!
//! Raw buffers are indexed into a ring by sequence number. A buffer either
//! contains at least one tuple delimiter or it does not. The bytes after the
//! last delimiter of one delimiter buffer, all bytes of the delimiter-free
//! buffers that follow, and the bytes before the first delimiter of the next
//! delimiter buffer form one spanning tuple.
//!
//! ## Slot state
//!
//! ```text
//!  63        37     36     35     34     33        32 31            0
//! ┌─────────┬──────┬──────┬──────┬──────┬──────────┬────────────────┐
//! │ unused  │ TRL  │ LDG  │ CLM  │ DLM  │ INDEXED  │ iteration tag  │
//! └─────────┴──────┴──────┴──────┴──────┴──────────┴────────────────┘
//! ```
//!
//! The iteration tag is `sequence_number / capacity`. It tells a reader
//! whether a slot holds the sequence number it is looking for or a buffer
//! from an earlier or later lap around the ring. The claim bit (`CLM`) of the
//! delimiter buffer that starts a spanning tuple is set with a
//! compare-and-swap against the full tagged state, so only one thread wins
//! the claim even if several threads see both ends of the tuple.
//!
//! Sequence number 0 is a virtual delimiter buffer with no trailing bytes; it
//! anchors the first tuple of the stream.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use super::SequenceError;
use crate::buffer::TupleBuffer;

/// Default number of slots in the ring.
pub const DEFAULT_RING_CAPACITY: usize = 1024;

const TAG_MASK: u64 = 0xFFFF_FFFF;
const INDEXED: u64 = 1 << 32;
const HAS_DELIMITER: u64 = 1 << 33;
const CLAIMED: u64 = 1 << 34;
const LEADING_USED: u64 = 1 << 35;
const TRAILING_USED: u64 = 1 << 36;
const DONE: u64 = LEADING_USED | TRAILING_USED;

/// A raw buffer together with the delimiter offsets found in it.
#[derive(Debug, Clone)]
pub struct StagedBuffer {
    /// The raw bytes.
    pub buffer: TupleBuffer,
    /// Number of valid bytes in `buffer`.
    pub size_in_bytes: usize,
    /// Offset of the first delimiter, if any.
    pub first_delimiter: Option<usize>,
    /// Offset of the last delimiter, if any.
    pub last_delimiter: Option<usize>,
}

impl StagedBuffer {
    /// Bytes before the first delimiter.
    #[must_use]
    pub fn leading_bytes(&self) -> &[u8] {
        let end = self.first_delimiter.unwrap_or(self.size_in_bytes);
        &self.buffer.as_slice()[..end]
    }

    /// Bytes after the last delimiter.
    #[must_use]
    pub fn trailing_bytes(&self) -> &[u8] {
        let start = self
            .last_delimiter
            .map_or(0, |d| d + 1)
            .min(self.size_in_bytes);
        &self.buffer.as_slice()[start..self.size_in_bytes]
    }

    fn has_delimiter(&self) -> bool {
        self.first_delimiter.is_some()
    }

    fn virtual_start() -> Self {
        Self {
            buffer: TupleBuffer::from_vec(Vec::new()),
            size_in_bytes: 0,
            first_delimiter: Some(0),
            last_delimiter: Some(0),
        }
    }
}

/// Buffers that together contain one spanning tuple.
#[derive(Debug, Clone)]
pub struct SpanningTuple {
    /// Sequence number of the delimiter buffer the tuple starts in.
    pub start: u64,
    /// Sequence number of the delimiter buffer the tuple ends in.
    pub end: u64,
    /// Buffers `start..=end` in sequence order.
    pub buffers: Vec<StagedBuffer>,
}

impl SpanningTuple {
    /// Concatenates the tuple bytes.
    #[must_use]
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::new();
        let last = self.buffers.len().saturating_sub(1);
        for (i, staged) in self.buffers.iter().enumerate() {
            if i == 0 {
                out.extend_from_slice(staged.trailing_bytes());
            } else if i == last {
                out.extend_from_slice(staged.leading_bytes());
            } else {
                out.extend_from_slice(&staged.buffer.as_slice()[..staged.size_in_bytes]);
            }
        }
        out
    }
}

struct Slot {
    state: AtomicU64,
    staged: Mutex<Option<(u64, StagedBuffer)>>,
}

/// Lock-free ring that hands each spanning tuple to exactly one thread.
///
/// # Example
///
/// ```rust,ignore
/// let shredder = SequenceShredder::new(DEFAULT_RING_CAPACITY)?;
/// // sequence 1 holds "a|b", sequence 2 holds "c|"
/// let won = shredder.process_sequence_number(1, staged_1)?;
/// let won = shredder.process_sequence_number(2, staged_2)?; // "bc"
/// ```
pub struct SequenceShredder {
    slots: Box<[Slot]>,
    capacity: u64,
    tail: AtomicU64,
}

impl SequenceShredder {
    /// Creates a shredder with `capacity` slots.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::InvalidCapacity`] unless `capacity` is a
    /// non-zero power of two.
    pub fn new(capacity: usize) -> Result<Self, SequenceError> {
        if capacity == 0 || !capacity.is_power_of_two() {
            return Err(SequenceError::InvalidCapacity(capacity));
        }
        let slots: Box<[Slot]> = (0..capacity)
            .map(|_| Slot {
                state: AtomicU64::new(0),
                staged: Mutex::new(None),
            })
            .collect();
        slots[0]
            .state
            .store(INDEXED | HAS_DELIMITER | LEADING_USED, Ordering::SeqCst);
        *slots[0].staged.lock() = Some((0, StagedBuffer::virtual_start()));
        Ok(Self {
            slots,
            capacity: capacity as u64,
            tail: AtomicU64::new(0),
        })
    }

    /// Number of slots.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Lowest sequence number still tracked.
    #[must_use]
    pub fn tail(&self) -> u64 {
        self.tail.load(Ordering::SeqCst)
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn slot(&self, sn: u64) -> &Slot {
        &self.slots[(sn % self.capacity) as usize]
    }

    #[inline]
    fn tag(&self, sn: u64) -> u64 {
        (sn / self.capacity) & TAG_MASK
    }

    /// Loads the state of `sn` if its slot currently holds `sn` and is indexed.
    fn indexed_state(&self, sn: u64) -> Option<u64> {
        let state = self.slot(sn).state.load(Ordering::SeqCst);
        (state & TAG_MASK == self.tag(sn) && state & INDEXED != 0).then_some(state)
    }

    /// Indexes `staged` under `sn` and returns the spanning tuples this call
    /// won the claim for.
    ///
    /// # Errors
    ///
    /// Returns [`SequenceError::OutOfRange`] if `sn` is too far ahead of the
    /// oldest unresolved buffer; the caller retries later. Returns
    /// [`SequenceError::AlreadyProcessed`] for sequence number 0, a number
    /// that was already released, or a number that is already indexed.
    pub fn process_sequence_number(
        &self,
        sn: u64,
        staged: StagedBuffer,
    ) -> Result<Vec<SpanningTuple>, SequenceError> {
        let tail = self.tail();
        if sn == 0 || sn < tail {
            return Err(SequenceError::AlreadyProcessed(sn));
        }
        if sn >= tail + self.capacity {
            return Err(SequenceError::OutOfRange {
                sequence_number: sn,
                tail,
                capacity: self.capacity,
            });
        }

        let has_delimiter = staged.has_delimiter();
        let tag = self.tag(sn);
        let slot = self.slot(sn);
        let mut indexed = tag | INDEXED;
        if has_delimiter {
            indexed |= HAS_DELIMITER;
        }
        {
            // Readers lock the staged buffer after seeing INDEXED, so holding
            // the lock across the swap keeps them from seeing the old buffer.
            let mut stored = slot.staged.lock();
            let mut observed = slot.state.load(Ordering::SeqCst);
            loop {
                if observed & TAG_MASK == tag && observed & INDEXED != 0 {
                    trace!(sn, "duplicate raw buffer rejected");
                    return Err(SequenceError::AlreadyProcessed(sn));
                }
                match slot
                    .state
                    .compare_exchange(observed, indexed, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => break,
                    Err(current) => observed = current,
                }
            }
            *stored = Some((sn, staged));
        }
        trace!(sn, has_delimiter, "indexed raw buffer");

        let mut won = Vec::with_capacity(2);
        if has_delimiter {
            if let Some(start) = self.find_delimiter_below(sn) {
                won.extend(self.try_claim(start, sn));
            }
            if let Some(end) = self.find_delimiter_above(sn) {
                won.extend(self.try_claim(sn, end));
            }
        } else if let (Some(start), Some(end)) =
            (self.find_delimiter_below(sn), self.find_delimiter_above(sn))
        {
            won.extend(self.try_claim(start, end));
        }
        Ok(won)
    }

    /// Nearest delimiter buffer below `sn` reachable over indexed
    /// delimiter-free buffers.
    fn find_delimiter_below(&self, sn: u64) -> Option<u64> {
        let mut candidate = sn;
        while candidate > 0 {
            candidate -= 1;
            let state = self.indexed_state(candidate)?;
            if state & HAS_DELIMITER != 0 {
                return Some(candidate);
            }
        }
        None
    }

    /// Nearest delimiter buffer above `sn` reachable over indexed
    /// delimiter-free buffers.
    fn find_delimiter_above(&self, sn: u64) -> Option<u64> {
        let limit = self.tail() + self.capacity;
        let mut candidate = sn + 1;
        while candidate < limit {
            let state = self.indexed_state(candidate)?;
            if state & HAS_DELIMITER != 0 {
                return Some(candidate);
            }
            candidate += 1;
        }
        None
    }

    /// Claims the spanning tuple `[start, end]` and gathers its buffers.
    fn try_claim(&self, start: u64, end: u64) -> Option<SpanningTuple> {
        let start_slot = self.slot(start);
        loop {
            let observed = self.indexed_state(start)?;
            if observed & CLAIMED != 0 {
                return None;
            }
            // A concurrent LEADING_USED update changes the word without
            // touching the claim, so retry until the claim bit decides.
            if start_slot
                .state
                .compare_exchange(observed, observed | CLAIMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }

        let buffers = (start..=end)
            .map(|sn| {
                let guard = self.slot(sn).staged.lock();
                match guard.as_ref() {
                    Some((stored, staged)) if *stored == sn => staged.clone(),
                    _ => panic!("slot of claimed sequence number {sn} was reused"),
                }
            })
            .collect();

        start_slot.state.fetch_or(TRAILING_USED, Ordering::SeqCst);
        for sn in start + 1..end {
            self.slot(sn).state.fetch_or(DONE, Ordering::SeqCst);
        }
        self.slot(end).state.fetch_or(LEADING_USED, Ordering::SeqCst);
        trace!(start, end, "claimed spanning tuple");

        self.advance_tail();
        Some(SpanningTuple {
            start,
            end,
            buffers,
        })
    }

    /// Releases fully consumed slots at the tail of the ring.
    fn advance_tail(&self) {
        loop {
            let tail = self.tail();
            let slot = self.slot(tail);
            let state = slot.state.load(Ordering::SeqCst);
            if state & TAG_MASK != self.tag(tail) || state & INDEXED == 0 || state & DONE != DONE {
                return;
            }
            {
                let mut staged = slot.staged.lock();
                if matches!(staged.as_ref(), Some((stored, _)) if *stored == tail) {
                    *staged = None;
                }
            }
            // Losing the race means another thread already advanced.
            let _ = self
                .tail
                .compare_exchange(tail, tail + 1, Ordering::SeqCst, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for SequenceShredder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceShredder")
            .field("capacity", &self.capacity)
            .field("tail", &self.tail())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn staged(bytes: &[u8]) -> StagedBuffer {
        let first = bytes.iter().position(|b| *b == b'|');
        let last = bytes.iter().rposition(|b| *b == b'|');
        StagedBuffer {
            buffer: TupleBuffer::from_vec(bytes.to_vec()),
            size_in_bytes: bytes.len(),
            first_delimiter: first,
            last_delimiter: last,
        }
    }

    fn assembled(tuples: &[SpanningTuple]) -> Vec<Vec<u8>> {
        tuples.iter().map(SpanningTuple::assemble).collect()
    }

    #[test]
    fn test_rejects_non_power_of_two() {
        assert!(matches!(
            SequenceShredder::new(1000),
            Err(SequenceError::InvalidCapacity(1000))
        ));
    }

    #[test]
    fn test_in_order_spanning_tuples() {
        let shredder = SequenceShredder::new(8).unwrap();
        let first = shredder.process_sequence_number(1, staged(b"ab|cd")).unwrap();
        assert_eq!(assembled(&first), vec![b"ab".to_vec()]);
        let second = shredder.process_sequence_number(2, staged(b"ef")).unwrap();
        assert!(second.is_empty());
        let third = shredder.process_sequence_number(3, staged(b"g|h")).unwrap();
        assert_eq!(assembled(&third), vec![b"cdefg".to_vec()]);
        assert_eq!(third[0].start, 1);
        assert_eq!(third[0].end, 3);
    }

    #[test]
    fn test_out_of_order_middle_buffer_completes_tuple() {
        let shredder = SequenceShredder::new(8).unwrap();
        assert_eq!(shredder.process_sequence_number(1, staged(b"x|yy")).unwrap().len(), 1);
        assert!(shredder.process_sequence_number(3, staged(b"z|")).unwrap().is_empty());
        let middle = shredder.process_sequence_number(2, staged(b"--")).unwrap();
        assert_eq!(assembled(&middle), vec![b"yy--z".to_vec()]);
    }

    #[test]
    fn test_tail_advances_and_ring_wraps() {
        let shredder = SequenceShredder::new(4).unwrap();
        for sn in 1..=20 {
            let won = shredder.process_sequence_number(sn, staged(b"a|b")).unwrap();
            assert_eq!(won.len(), 1);
        }
        assert!(shredder.tail() >= 17);
        assert!(matches!(
            shredder.process_sequence_number(3, staged(b"|")),
            Err(SequenceError::AlreadyProcessed(3))
        ));
    }

    #[test]
    fn test_duplicate_sequence_number_is_rejected() {
        let shredder = SequenceShredder::new(8).unwrap();
        assert!(shredder.process_sequence_number(2, staged(b"c|d")).unwrap().is_empty());
        let second = shredder.process_sequence_number(3, staged(b"e|f")).unwrap();
        assert_eq!(assembled(&second), vec![b"de".to_vec()]);

        assert!(matches!(
            shredder.process_sequence_number(2, staged(b"c|d")),
            Err(SequenceError::AlreadyProcessed(2))
        ));
        assert!(matches!(
            shredder.process_sequence_number(3, staged(b"e|f")),
            Err(SequenceError::AlreadyProcessed(3))
        ));

        let first = shredder.process_sequence_number(1, staged(b"a|b")).unwrap();
        let mut tuples = assembled(&first);
        tuples.sort();
        assert_eq!(tuples, vec![b"a".to_vec(), b"bc".to_vec()]);
        // Slots 0..=2 are fully consumed; 3 still waits for its trailing bytes.
        assert_eq!(shredder.tail(), 3);
    }

    #[test]
    fn test_out_of_range_is_retryable() {
        let shredder = SequenceShredder::new(4).unwrap();
        assert!(matches!(
            shredder.process_sequence_number(4, staged(b"|")),
            Err(SequenceError::OutOfRange { sequence_number: 4, tail: 0, capacity: 4 })
        ));
        shredder.process_sequence_number(1, staged(b"a|")).unwrap();
        assert!(shredder.process_sequence_number(4, staged(b"|")).is_ok());
    }

    #[test]
    fn test_concurrent_claims_are_exactly_once() {
        const BUFFERS: u64 = 2000;
        const THREADS: u64 = 4;

        // Every third buffer has no delimiter; buffer n carries its number.
        let content = |sn: u64| -> Vec<u8> {
            if sn % 3 == 0 {
                format!("<{sn}>").into_bytes()
            } else {
                format!("<{sn}|{sn}>").into_bytes()
            }
        };

        let shredder = Arc::new(SequenceShredder::new(64).unwrap());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let shredder = shredder.clone();
                thread::spawn(move || {
                    let mut won = Vec::new();
                    let mut pending: Vec<u64> =
                        (1..=BUFFERS).filter(|sn| sn % THREADS == t).collect();
                    while !pending.is_empty() {
                        pending.retain(|&sn| {
                            match shredder.process_sequence_number(sn, staged(&content(sn))) {
                                Ok(tuples) => {
                                    won.extend(tuples.into_iter().map(|s| (s.start, s.end)));
                                    false
                                }
                                Err(SequenceError::OutOfRange { .. }) => true,
                                Err(e) => panic!("unexpected error {e}"),
                            }
                        });
                        thread::yield_now();
                    }
                    won
                })
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let unique: HashSet<_> = all.iter().copied().collect();
        assert_eq!(unique.len(), all.len(), "a spanning tuple was claimed twice");

        let delimiter_buffers = (1..=BUFFERS).filter(|sn| sn % 3 != 0).count();
        // One tuple ends in every delimiter buffer (the first one starts at 0).
        assert_eq!(all.len(), delimiter_buffers);
    }
}
