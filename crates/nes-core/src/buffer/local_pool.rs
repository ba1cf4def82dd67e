//! Fixed-size buffer pool carved out of the global pool.
//!
//! Sources own one of these so that a single fast source cannot drain the
//! global pool. Segments recycle into the local free list while the pool is
//! alive and flow back to the global pool once it is destroyed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::manager::GlobalPool;
use super::tuple_buffer::{BufferRecycler, Memory, TupleBuffer};
use super::BufferProvider;

struct LocalState {
    free: Vec<Vec<u8>>,
    destroyed: bool,
    interrupted: bool,
}

struct LocalPool {
    state: Mutex<LocalState>,
    available: Condvar,
    global: Arc<GlobalPool>,
    capacity: usize,
    buffer_size: usize,
}

impl BufferRecycler for LocalPool {
    fn recycle(&self, mut memory: Vec<u8>) {
        let mut state = self.state.lock();
        if state.destroyed {
            drop(state);
            self.global.recycle(memory);
            return;
        }
        assert!(
            state.free.len() < self.capacity,
            "buffer released twice into local pool of {} segments",
            self.capacity
        );
        memory.fill(0);
        state.free.push(memory);
        drop(state);
        self.available.notify_one();
    }
}

/// A bounded pool of buffers reserved from the [`BufferManager`](super::BufferManager).
pub struct FixedSizeBufferPool {
    inner: Arc<LocalPool>,
}

impl FixedSizeBufferPool {
    pub(crate) fn new(segments: Vec<Vec<u8>>, global: Arc<GlobalPool>) -> Self {
        let capacity = segments.len();
        let buffer_size = segments.first().map_or(0, Vec::len);
        Self {
            inner: Arc::new(LocalPool {
                state: Mutex::new(LocalState {
                    free: segments,
                    destroyed: false,
                    interrupted: false,
                }),
                available: Condvar::new(),
                global,
                capacity,
                buffer_size,
            }),
        }
    }

    fn wrap(&self, memory: Vec<u8>) -> TupleBuffer {
        let recycler: Arc<dyn BufferRecycler> = self.inner.clone();
        TupleBuffer::new(Memory::Owned(memory), Some(recycler))
    }

    /// Number of segments reserved by this pool.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Handle that wakes threads blocked in
    /// [`get_buffer_interruptible`](BufferProvider::get_buffer_interruptible)
    /// from another thread.
    #[must_use]
    pub fn interrupter(&self) -> PoolInterrupter {
        PoolInterrupter {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Returns every segment to the global pool.
    ///
    /// Buffers still in flight go to the global pool when released.
    pub fn destroy(self) {
        drop(self);
    }

    fn release_to_global(&self) {
        let free = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            std::mem::take(&mut state.free)
        };
        for memory in free {
            self.inner.global.recycle(memory);
        }
    }
}

impl BufferProvider for FixedSizeBufferPool {
    fn get_buffer_blocking(&self) -> TupleBuffer {
        let mut state = self.inner.state.lock();
        loop {
            if let Some(memory) = state.free.pop() {
                drop(state);
                return self.wrap(memory);
            }
            self.inner.available.wait(&mut state);
        }
    }

    fn get_buffer_interruptible(&self) -> Option<TupleBuffer> {
        let mut state = self.inner.state.lock();
        loop {
            if state.interrupted {
                return None;
            }
            if let Some(memory) = state.free.pop() {
                drop(state);
                return Some(self.wrap(memory));
            }
            self.inner.available.wait(&mut state);
        }
    }

    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer> {
        let memory = self.inner.state.lock().free.pop()?;
        Some(self.wrap(memory))
    }

    fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let Some(memory) = state.free.pop() {
                drop(state);
                return Some(self.wrap(memory));
            }
            if self.inner.available.wait_until(&mut state, deadline).timed_out() {
                let memory = state.free.pop()?;
                drop(state);
                return Some(self.wrap(memory));
            }
        }
    }

    fn available_buffers(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }
}

/// Wakes and fails interruptible acquires on one [`FixedSizeBufferPool`].
#[derive(Clone)]
pub struct PoolInterrupter {
    inner: Arc<LocalPool>,
}

impl PoolInterrupter {
    /// Makes every current and future interruptible acquire return `None`.
    pub fn interrupt(&self) {
        self.inner.state.lock().interrupted = true;
        self.inner.available.notify_all();
    }
}

impl std::fmt::Debug for PoolInterrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolInterrupter")
            .field("interrupted", &self.inner.state.lock().interrupted)
            .finish_non_exhaustive()
    }
}

impl Drop for FixedSizeBufferPool {
    fn drop(&mut self) {
        self.release_to_global();
    }
}

impl std::fmt::Debug for FixedSizeBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedSizeBufferPool")
            .field("capacity", &self.inner.capacity)
            .field("available", &self.available_buffers())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BufferManager, BufferManagerConfig};

    fn manager() -> Arc<BufferManager> {
        BufferManager::new(
            BufferManagerConfig::builder()
                .buffer_size(32)
                .num_buffers(4)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_fixed_size_pool_runs_out() {
        let manager = manager();
        let pool = manager.create_fixed_size_buffer_pool(1).unwrap();
        assert_eq!(manager.available_buffers(), 3);
        let valid = pool.get_buffer_no_blocking();
        let invalid = pool.get_buffer_no_blocking();
        assert!(valid.is_some());
        assert!(invalid.is_none());
        drop(valid);
        assert_eq!(pool.available_buffers(), 1);
        assert_eq!(manager.available_buffers(), 3);
    }

    #[test]
    fn test_destroy_returns_segments_to_global() {
        let manager = manager();
        let pool = manager.create_fixed_size_buffer_pool(3).unwrap();
        let in_flight = pool.get_buffer_blocking();
        assert_eq!(manager.available_buffers(), 1);
        pool.destroy();
        assert_eq!(manager.available_buffers(), 3);
        drop(in_flight);
        assert_eq!(manager.available_buffers(), 4);
    }

    #[test]
    fn test_interrupt_wakes_blocked_acquire() {
        let manager = manager();
        let pool = manager.create_fixed_size_buffer_pool(1).unwrap();
        let held = pool.get_buffer_interruptible();
        assert!(held.is_some());

        let interrupter = pool.interrupter();
        let waiter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            interrupter.interrupt();
        });
        assert!(pool.get_buffer_interruptible().is_none());
        waiter.join().unwrap();

        drop(held);
        assert!(pool.get_buffer_interruptible().is_none());
        assert!(pool.get_buffer_no_blocking().is_some());
    }

    #[test]
    fn test_rejects_oversized_pool() {
        let manager = manager();
        assert!(manager.create_fixed_size_buffer_pool(5).is_err());
        assert!(manager.create_fixed_size_buffer_pool(0).is_err());
    }
}
