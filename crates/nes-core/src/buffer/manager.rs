//! Global buffer pool and its configuration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::local_pool::FixedSizeBufferPool;
use super::tuple_buffer::{BufferRecycler, Memory, TupleBuffer};
use super::{BufferError, BufferProvider};

/// Default size of a pooled buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default number of pooled buffers.
pub const DEFAULT_NUM_BUFFERS: usize = 1024;

/// Interval after which a blocked acquisition logs a stall warning.
const STALL_WARNING_INTERVAL: Duration = Duration::from_secs(10);

/// Configuration for a [`BufferManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferManagerConfig {
    /// Size of every pooled buffer in bytes.
    pub buffer_size: usize,
    /// Number of pooled buffers allocated upfront.
    pub num_buffers: usize,
}

impl Default for BufferManagerConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_buffers: DEFAULT_NUM_BUFFERS,
        }
    }
}

impl BufferManagerConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> BufferManagerConfigBuilder {
        BufferManagerConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] for a zero buffer size or count.
    pub fn validate(&self) -> Result<(), BufferError> {
        if self.buffer_size == 0 {
            return Err(BufferError::InvalidConfig("buffer_size must be > 0".into()));
        }
        if self.num_buffers == 0 {
            return Err(BufferError::InvalidConfig("num_buffers must be > 0".into()));
        }
        Ok(())
    }
}

/// Builder for [`BufferManagerConfig`].
#[derive(Debug, Default)]
pub struct BufferManagerConfigBuilder {
    buffer_size: Option<usize>,
    num_buffers: Option<usize>,
}

impl BufferManagerConfigBuilder {
    /// Sets the size of each pooled buffer.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Sets the number of pooled buffers.
    #[must_use]
    pub fn num_buffers(mut self, count: usize) -> Self {
        self.num_buffers = Some(count);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> BufferManagerConfig {
        let defaults = BufferManagerConfig::default();
        BufferManagerConfig {
            buffer_size: self.buffer_size.unwrap_or(defaults.buffer_size),
            num_buffers: self.num_buffers.unwrap_or(defaults.num_buffers),
        }
    }
}

/// Free list shared between the manager and every outstanding buffer.
pub(crate) struct GlobalPool {
    free: Mutex<Vec<Vec<u8>>>,
    available: Condvar,
    capacity: usize,
    buffer_size: usize,
}

impl GlobalPool {
    pub(crate) fn take_blocking(&self) -> Vec<u8> {
        let mut free = self.free.lock();
        let mut waiting_since = Instant::now();
        loop {
            if let Some(memory) = free.pop() {
                return memory;
            }
            let result = self.available.wait_for(&mut free, STALL_WARNING_INTERVAL);
            if result.timed_out() && free.is_empty() {
                warn!(
                    waited_secs = waiting_since.elapsed().as_secs(),
                    capacity = self.capacity,
                    "buffer acquisition stalled, all pooled buffers are in flight"
                );
                waiting_since = Instant::now();
            }
        }
    }

    pub(crate) fn try_take(&self) -> Option<Vec<u8>> {
        self.free.lock().pop()
    }

    pub(crate) fn take_timeout(&self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut free = self.free.lock();
        loop {
            if let Some(memory) = free.pop() {
                return Some(memory);
            }
            if self.available.wait_until(&mut free, deadline).timed_out() {
                return free.pop();
            }
        }
    }

    pub(crate) fn available(&self) -> usize {
        self.free.lock().len()
    }
}

impl BufferRecycler for GlobalPool {
    fn recycle(&self, mut memory: Vec<u8>) {
        assert_eq!(
            memory.len(),
            self.buffer_size,
            "recycled segment does not belong to this pool"
        );
        memory.fill(0);
        let mut free = self.free.lock();
        assert!(
            free.len() < self.capacity,
            "buffer released twice: free list already holds all {} segments",
            self.capacity
        );
        free.push(memory);
        drop(free);
        self.available.notify_one();
    }
}

/// Owner of all pooled tuple buffer memory on a node.
///
/// All segments are allocated once at construction and recycled through a
/// free list; the pool never grows or shrinks. Unpooled buffers are plain
/// allocations that are freed on release.
///
/// # Example
///
/// ```rust,ignore
/// let manager = BufferManager::new(BufferManagerConfig::default())?;
/// let buffer = manager.get_buffer_blocking();
/// assert_eq!(manager.available_buffers(), DEFAULT_NUM_BUFFERS - 1);
/// ```
pub struct BufferManager {
    pool: Arc<GlobalPool>,
    unpooled_allocated: AtomicUsize,
}

impl BufferManager {
    /// Allocates every pooled segment.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] if the configuration is invalid.
    pub fn new(config: BufferManagerConfig) -> Result<Arc<Self>, BufferError> {
        config.validate()?;
        let free = (0..config.num_buffers)
            .map(|_| vec![0u8; config.buffer_size])
            .collect();
        debug!(
            buffer_size = config.buffer_size,
            num_buffers = config.num_buffers,
            "buffer manager initialized"
        );
        Ok(Arc::new(Self {
            pool: Arc::new(GlobalPool {
                free: Mutex::new(free),
                available: Condvar::new(),
                capacity: config.num_buffers,
                buffer_size: config.buffer_size,
            }),
            unpooled_allocated: AtomicUsize::new(0),
        }))
    }

    fn wrap_pooled(&self, memory: Vec<u8>) -> TupleBuffer {
        let recycler: Arc<dyn BufferRecycler> = self.pool.clone();
        TupleBuffer::new(Memory::Owned(memory), Some(recycler))
    }

    /// Returns a buffer of the pool's fixed size.
    ///
    /// Blocks the calling thread until a buffer is recycled if the pool is
    /// exhausted. Calling this from the only thread that could release the
    /// buffers being waited for deadlocks; a stall warning is logged
    /// periodically while waiting.
    #[must_use]
    pub fn get_buffer_blocking(&self) -> TupleBuffer {
        self.wrap_pooled(self.pool.take_blocking())
    }

    /// Returns a pooled buffer, or `None` if the pool is exhausted.
    #[must_use]
    pub fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        self.pool.try_take().map(|m| self.wrap_pooled(m))
    }

    /// Waits at most `timeout` for a pooled buffer.
    #[must_use]
    pub fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        self.pool.take_timeout(timeout).map(|m| self.wrap_pooled(m))
    }

    /// Allocates a buffer of `size` bytes outside the pool.
    ///
    /// Returns `None` for a zero size or if the allocation fails.
    #[must_use]
    pub fn get_unpooled_buffer(&self, size: usize) -> Option<TupleBuffer> {
        if size == 0 {
            return None;
        }
        let mut memory = Vec::new();
        if memory.try_reserve_exact(size).is_err() {
            warn!(size, "unpooled buffer allocation failed");
            return None;
        }
        memory.resize(size, 0);
        self.unpooled_allocated.fetch_add(1, Ordering::Relaxed);
        Some(TupleBuffer::new(Memory::Owned(memory), None))
    }

    /// Builds a read-only buffer over externally owned memory.
    ///
    /// The buffer keeps `owner` alive and returns nothing to any pool.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::OutOfBounds`] if `offset + len` exceeds the owner.
    pub fn wrap_memory(
        &self,
        owner: Arc<[u8]>,
        offset: usize,
        len: usize,
    ) -> Result<TupleBuffer, BufferError> {
        let end = offset.checked_add(len).ok_or(BufferError::OutOfBounds {
            offset,
            len,
            capacity: owner.len(),
        })?;
        if end > owner.len() {
            return Err(BufferError::OutOfBounds {
                offset,
                len,
                capacity: owner.len(),
            });
        }
        Ok(TupleBuffer::new(Memory::Wrapped { owner, offset, len }, None))
    }

    /// Reserves `num_buffers` segments for a dedicated local pool.
    ///
    /// Blocks until enough segments have been reserved.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::InvalidConfig`] if `num_buffers` is zero or
    /// exceeds the capacity of the global pool.
    pub fn create_fixed_size_buffer_pool(
        &self,
        num_buffers: usize,
    ) -> Result<FixedSizeBufferPool, BufferError> {
        if num_buffers == 0 || num_buffers > self.pool.capacity {
            return Err(BufferError::InvalidConfig(format!(
                "local pool of {num_buffers} buffers does not fit a global pool of {}",
                self.pool.capacity
            )));
        }
        let segments = (0..num_buffers).map(|_| self.pool.take_blocking()).collect();
        Ok(FixedSizeBufferPool::new(segments, self.pool.clone()))
    }

    /// Number of free pooled buffers.
    #[must_use]
    pub fn available_buffers(&self) -> usize {
        self.pool.available()
    }

    /// Total number of pooled buffers.
    #[inline]
    #[must_use]
    pub fn num_of_pooled_buffers(&self) -> usize {
        self.pool.capacity
    }

    /// Number of unpooled allocations handed out so far.
    #[must_use]
    pub fn num_of_unpooled_buffers(&self) -> usize {
        self.unpooled_allocated.load(Ordering::Relaxed)
    }

    /// Size of every pooled buffer.
    #[inline]
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size
    }
}

impl BufferProvider for BufferManager {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        BufferManager::get_buffer_blocking(self)
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        BufferManager::get_buffer_no_blocking(self)
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        BufferManager::get_buffer_timeout(self, timeout)
    }

    fn available_buffers(&self) -> usize {
        BufferManager::available_buffers(self)
    }

    fn buffer_size(&self) -> usize {
        BufferManager::buffer_size(self)
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferManager")
            .field("buffer_size", &self.pool.buffer_size)
            .field("capacity", &self.pool.capacity)
            .field("available", &self.available_buffers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn manager(num_buffers: usize) -> Arc<BufferManager> {
        BufferManager::new(
            BufferManagerConfig::builder()
                .buffer_size(64)
                .num_buffers(num_buffers)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_runs_out_of_buffers() {
        let manager = manager(1);
        assert_eq!(manager.available_buffers(), 1);
        let valid = manager.get_buffer_no_blocking();
        assert_eq!(manager.available_buffers(), 0);
        let invalid = manager.get_buffer_no_blocking();
        assert!(valid.is_some());
        assert!(invalid.is_none());
    }

    #[test]
    fn test_different_buffers() {
        let manager = manager(2);
        let b1 = manager.get_buffer_blocking();
        let b2 = manager.get_buffer_blocking();
        assert_eq!(manager.available_buffers(), 0);
        assert!(!b1.ptr_eq(&b2));
        assert_eq!(b1.buffer_size(), 64);
        assert_eq!(b1.number_of_tuples(), 0);
    }

    #[test]
    fn test_release_buffer() {
        let manager = manager(1);
        {
            let _buffer = manager.get_buffer_blocking();
            assert_eq!(manager.available_buffers(), 0);
        }
        assert_eq!(manager.available_buffers(), 1);
    }

    #[test]
    fn test_recycled_memory_is_zeroed() {
        let manager = manager(1);
        let mut buffer = manager.get_buffer_blocking();
        buffer.as_mut_slice().unwrap().fill(0xAB);
        drop(buffer);
        let buffer = manager.get_buffer_blocking();
        assert!(buffer.as_slice().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_timeout_acquisition() {
        let manager = manager(1);
        let held = manager.get_buffer_blocking();
        assert!(manager.get_buffer_timeout(Duration::from_millis(10)).is_none());
        drop(held);
        assert!(manager.get_buffer_timeout(Duration::from_millis(10)).is_some());
    }

    #[test]
    fn test_blocking_acquisition_wakes_on_release() {
        let manager = manager(1);
        let held = manager.get_buffer_blocking();
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.get_buffer_blocking().buffer_size())
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);
        assert_eq!(waiter.join().unwrap(), 64);
    }

    #[test]
    fn test_unpooled_buffer() {
        let manager = manager(1);
        let buffer = manager.get_unpooled_buffer(1000).unwrap();
        assert_eq!(buffer.buffer_size(), 1000);
        assert!(!buffer.is_pooled());
        assert!(manager.get_unpooled_buffer(0).is_none());
        assert_eq!(manager.num_of_unpooled_buffers(), 1);
        assert_eq!(manager.available_buffers(), 1);
    }

    #[test]
    fn test_wrap_memory_bounds() {
        let manager = manager(1);
        let owner: Arc<[u8]> = Arc::from(vec![7u8; 10]);
        let view = manager.wrap_memory(owner.clone(), 2, 8).unwrap();
        assert_eq!(view.buffer_size(), 8);
        assert!(matches!(
            manager.wrap_memory(owner, 5, 6),
            Err(BufferError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_invalid_config() {
        let config = BufferManagerConfig::builder().num_buffers(0).build();
        assert!(matches!(
            BufferManager::new(config),
            Err(BufferError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_buffer_conservation_under_concurrency() {
        let manager = manager(8);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let a = manager.get_buffer_blocking();
                        let b = a.clone();
                        assert!(manager.available_buffers() <= 8);
                        drop(a);
                        drop(b);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(manager.available_buffers(), 8);
    }
}
