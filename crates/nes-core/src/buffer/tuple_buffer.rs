//! Reference-counted view over a pooled memory segment.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::ids::OriginId;
use crate::sequence::SequenceData;

/// Receives the memory of a buffer once its last reference is dropped.
pub trait BufferRecycler: Send + Sync {
    /// Returns `memory` to the owning pool.
    fn recycle(&self, memory: Vec<u8>);
}

/// Index of a child buffer stored inside a parent buffer.
pub type ChildIndex = u32;

/// Backing storage of a buffer.
pub(crate) enum Memory {
    /// Owned memory, returned to a pool (or freed) on release.
    Owned(Vec<u8>),
    /// Read-only view over externally owned memory.
    Wrapped {
        owner: Arc<[u8]>,
        offset: usize,
        len: usize,
    },
}

/// Shared control block of a tuple buffer.
///
/// Metadata lives in atomics so that every holder observes the same values,
/// the same way every clone shares the payload.
struct ControlBlock {
    memory: Memory,
    number_of_tuples: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU64,
    last_chunk: AtomicBool,
    origin_id: AtomicU64,
    watermark: AtomicU64,
    creation_timestamp_ms: AtomicU64,
    children: Mutex<SmallVec<[TupleBuffer; 2]>>,
    recycler: Option<Arc<dyn BufferRecycler>>,
}

impl Drop for ControlBlock {
    fn drop(&mut self) {
        let Some(recycler) = self.recycler.take() else {
            return;
        };
        if let Memory::Owned(memory) = std::mem::replace(&mut self.memory, Memory::Owned(Vec::new()))
        {
            recycler.recycle(memory);
        }
    }
}

/// A fixed-capacity binary region holding a batch of records plus metadata.
///
/// Cloning a `TupleBuffer` shares the underlying segment. The segment goes
/// back to its pool when the last clone is dropped, so a buffer is either in
/// use (at least one holder) or recycled, never both.
///
/// # Example
///
/// ```rust,ignore
/// let buffer = manager.get_buffer_blocking();
/// buffer.set_number_of_tuples(3);
/// let shared = buffer.clone();
/// drop(buffer);
/// drop(shared); // recycled here
/// ```
#[derive(Clone)]
pub struct TupleBuffer {
    inner: Arc<ControlBlock>,
}

impl TupleBuffer {
    pub(crate) fn new(memory: Memory, recycler: Option<Arc<dyn BufferRecycler>>) -> Self {
        Self {
            inner: Arc::new(ControlBlock {
                memory,
                number_of_tuples: AtomicU64::new(0),
                sequence_number: AtomicU64::new(0),
                chunk_number: AtomicU64::new(0),
                last_chunk: AtomicBool::new(true),
                origin_id: AtomicU64::new(0),
                watermark: AtomicU64::new(0),
                creation_timestamp_ms: AtomicU64::new(now_millis()),
                children: Mutex::new(SmallVec::new()),
                recycler,
            }),
        }
    }

    /// Creates a standalone buffer that belongs to no pool.
    ///
    /// Used when decoding buffers from the wire or from spill files before
    /// they are copied into pooled memory.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self::new(Memory::Owned(data), None)
    }

    /// Payload bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        match &self.inner.memory {
            Memory::Owned(data) => data,
            Memory::Wrapped { owner, offset, len } => &owner[*offset..*offset + *len],
        }
    }

    /// Mutable payload access.
    ///
    /// Returns `None` when the buffer is shared with another holder or wraps
    /// external memory; a buffer becomes immutable once it is handed out.
    #[must_use]
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut Arc::get_mut(&mut self.inner)?.memory {
            Memory::Owned(data) => Some(data.as_mut_slice()),
            Memory::Wrapped { .. } => None,
        }
    }

    /// Capacity of the buffer in bytes.
    #[inline]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.as_slice().len()
    }

    /// Number of holders sharing this buffer.
    #[inline]
    #[must_use]
    pub fn reference_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Returns true if this buffer is returned to a pool on release.
    #[must_use]
    pub fn is_pooled(&self) -> bool {
        self.inner.recycler.is_some()
    }

    /// Logical number of records in the buffer.
    #[inline]
    #[must_use]
    pub fn number_of_tuples(&self) -> u64 {
        self.inner.number_of_tuples.load(Ordering::Acquire)
    }

    /// Sets the logical number of records.
    #[inline]
    pub fn set_number_of_tuples(&self, n: u64) {
        self.inner.number_of_tuples.store(n, Ordering::Release);
    }

    /// Sequence number assigned by the producer.
    #[inline]
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        self.inner.sequence_number.load(Ordering::Acquire)
    }

    /// Sets the sequence number.
    #[inline]
    pub fn set_sequence_number(&self, seq: u64) {
        self.inner.sequence_number.store(seq, Ordering::Release);
    }

    /// Chunk number within the sequence number.
    #[inline]
    #[must_use]
    pub fn chunk_number(&self) -> u64 {
        self.inner.chunk_number.load(Ordering::Acquire)
    }

    /// Sets the chunk number.
    #[inline]
    pub fn set_chunk_number(&self, chunk: u64) {
        self.inner.chunk_number.store(chunk, Ordering::Release);
    }

    /// True if this buffer carries the last chunk of its sequence number.
    #[inline]
    #[must_use]
    pub fn is_last_chunk(&self) -> bool {
        self.inner.last_chunk.load(Ordering::Acquire)
    }

    /// Marks this buffer as the last chunk of its sequence number.
    #[inline]
    pub fn set_last_chunk(&self, last: bool) {
        self.inner.last_chunk.store(last, Ordering::Release);
    }

    /// Ordering key of this buffer.
    #[must_use]
    pub fn sequence_data(&self) -> SequenceData {
        SequenceData::new(self.sequence_number(), self.chunk_number(), self.is_last_chunk())
    }

    /// Sets sequence number, chunk number and last-chunk flag at once.
    pub fn set_sequence_data(&self, data: SequenceData) {
        self.set_sequence_number(data.sequence_number);
        self.set_chunk_number(data.chunk_number);
        self.set_last_chunk(data.last_chunk);
    }

    /// Origin that produced this buffer.
    #[inline]
    #[must_use]
    pub fn origin_id(&self) -> OriginId {
        OriginId(self.inner.origin_id.load(Ordering::Acquire))
    }

    /// Sets the origin.
    #[inline]
    pub fn set_origin_id(&self, origin: OriginId) {
        self.inner.origin_id.store(origin.0, Ordering::Release);
    }

    /// Watermark timestamp carried by this buffer.
    #[inline]
    #[must_use]
    pub fn watermark(&self) -> u64 {
        self.inner.watermark.load(Ordering::Acquire)
    }

    /// Sets the watermark timestamp.
    #[inline]
    pub fn set_watermark(&self, ts: u64) {
        self.inner.watermark.store(ts, Ordering::Release);
    }

    /// Creation time in milliseconds since the Unix epoch.
    #[inline]
    #[must_use]
    pub fn creation_timestamp_ms(&self) -> u64 {
        self.inner.creation_timestamp_ms.load(Ordering::Acquire)
    }

    /// Overrides the creation timestamp.
    #[inline]
    pub fn set_creation_timestamp_ms(&self, ts: u64) {
        self.inner.creation_timestamp_ms.store(ts, Ordering::Release);
    }

    /// Attaches `child` to this buffer and returns its index.
    ///
    /// The child stays alive for as long as the parent does.
    ///
    /// # Panics
    ///
    /// Panics if more than `u32::MAX` children are attached.
    pub fn store_child_buffer(&self, child: TupleBuffer) -> ChildIndex {
        let mut children = self.inner.children.lock();
        children.push(child);
        ChildIndex::try_from(children.len() - 1).expect("child index overflow")
    }

    /// Returns the child buffer stored at `index`.
    #[must_use]
    pub fn load_child_buffer(&self, index: ChildIndex) -> Option<TupleBuffer> {
        self.inner.children.lock().get(index as usize).cloned()
    }

    /// Number of attached child buffers.
    #[must_use]
    pub fn num_child_buffers(&self) -> usize {
        self.inner.children.lock().len()
    }

    /// Copies all metadata (not payload, not children) from `other`.
    pub fn copy_metadata_from(&self, other: &TupleBuffer) {
        self.set_number_of_tuples(other.number_of_tuples());
        self.set_sequence_data(other.sequence_data());
        self.set_origin_id(other.origin_id());
        self.set_watermark(other.watermark());
        self.set_creation_timestamp_ms(other.creation_timestamp_ms());
    }

    /// Deep copy into unpooled memory, children included.
    ///
    /// Holding the copy does not keep any pool segment in use.
    #[must_use]
    pub fn to_unpooled(&self) -> TupleBuffer {
        let copy = TupleBuffer::from_vec(self.as_slice().to_vec());
        copy.copy_metadata_from(self);
        let children: Vec<TupleBuffer> = self.inner.children.lock().iter().map(TupleBuffer::to_unpooled).collect();
        for child in children {
            copy.store_child_buffer(child);
        }
        copy
    }

    /// Returns true if both handles share the same segment.
    #[must_use]
    pub fn ptr_eq(&self, other: &TupleBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for TupleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TupleBuffer")
            .field("size", &self.buffer_size())
            .field("tuples", &self.number_of_tuples())
            .field("seq", &self.sequence_number())
            .field("chunk", &self.chunk_number())
            .field("last", &self.is_last_chunk())
            .field("origin", &self.origin_id())
            .field("watermark", &self.watermark())
            .field("children", &self.num_child_buffers())
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRecycler(AtomicUsize);

    impl BufferRecycler for CountingRecycler {
        fn recycle(&self, _memory: Vec<u8>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_recycle_on_last_drop() {
        let recycler = Arc::new(CountingRecycler(AtomicUsize::new(0)));
        let buffer = TupleBuffer::new(Memory::Owned(vec![0; 16]), Some(recycler.clone()));
        let clone = buffer.clone();
        assert_eq!(buffer.reference_count(), 2);
        drop(buffer);
        assert_eq!(recycler.0.load(Ordering::SeqCst), 0);
        drop(clone);
        assert_eq!(recycler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mutation_requires_unique_holder() {
        let mut buffer = TupleBuffer::from_vec(vec![0; 8]);
        buffer.as_mut_slice().unwrap()[0] = 42;
        let shared = buffer.clone();
        assert!(buffer.as_mut_slice().is_none());
        drop(shared);
        assert_eq!(buffer.as_mut_slice().unwrap()[0], 42);
    }

    #[test]
    fn test_metadata_shared_between_clones() {
        let buffer = TupleBuffer::from_vec(vec![0; 8]);
        let clone = buffer.clone();
        buffer.set_sequence_data(SequenceData::new(4, 2, false));
        buffer.set_origin_id(OriginId(9));
        assert_eq!(clone.sequence_data(), SequenceData::new(4, 2, false));
        assert_eq!(clone.origin_id(), OriginId(9));
    }

    #[test]
    fn test_children_live_with_parent() {
        let recycler = Arc::new(CountingRecycler(AtomicUsize::new(0)));
        let parent = TupleBuffer::from_vec(vec![0; 8]);
        let child = TupleBuffer::new(Memory::Owned(vec![1; 4]), Some(recycler.clone()));
        let idx = parent.store_child_buffer(child);
        assert_eq!(idx, 0);
        assert_eq!(parent.load_child_buffer(0).unwrap().as_slice(), &[1, 1, 1, 1]);
        assert!(parent.load_child_buffer(1).is_none());
        drop(parent);
        assert_eq!(recycler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unpooled_copy_releases_segment() {
        let recycler = Arc::new(CountingRecycler(AtomicUsize::new(0)));
        let pooled = TupleBuffer::new(Memory::Owned(vec![5; 8]), Some(recycler.clone()));
        pooled.set_sequence_number(9);
        pooled.store_child_buffer(TupleBuffer::from_vec(vec![3; 2]));
        let copy = pooled.to_unpooled();
        drop(pooled);

        assert_eq!(recycler.0.load(Ordering::SeqCst), 1);
        assert!(!copy.is_pooled());
        assert_eq!(copy.as_slice(), &[5; 8]);
        assert_eq!(copy.sequence_number(), 9);
        assert_eq!(copy.buffer_size(), 8);
        assert_eq!(copy.load_child_buffer(0).unwrap().as_slice(), &[3, 3]);
    }

    #[test]
    fn test_wrapped_memory_is_read_only() {
        let owner: Arc<[u8]> = Arc::from(vec![1u8, 2, 3, 4, 5]);
        let mut view = TupleBuffer::new(
            Memory::Wrapped {
                owner,
                offset: 1,
                len: 3,
            },
            None,
        );
        assert_eq!(view.as_slice(), &[2, 3, 4]);
        assert!(view.as_mut_slice().is_none());
    }
}
