//! # Buffer Management
//!
//! Pooled, reference-counted tuple buffers. All record data in the runtime
//! travels in [`TupleBuffer`]s acquired from a [`BufferManager`].
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── BufferManager ────────────────────────┐
//! │  free list (Mutex + Condvar), N segments of fixed size        │
//! │        │                          ▲                           │
//! │        ▼ acquire                  │ last reference dropped    │
//! │  ┌──────────┐   clone   ┌──────────┐                          │
//! │  │TupleBuffer│ ───────► │TupleBuffer│ ... (shared segment)     │
//! │  └──────────┘           └──────────┘                          │
//! │        │                                                      │
//! │        ▼ create_fixed_size_buffer_pool(n)                     │
//! │  FixedSizeBufferPool (per source, recycles locally)           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sources block in [`BufferProvider::get_buffer_interruptible`] when their
//! pool is exhausted, which throttles ingestion until downstream tasks release
//! buffers. Stopping the source interrupts the wait.

mod local_pool;
mod manager;
mod tuple_buffer;

use std::time::Duration;

pub use local_pool::{FixedSizeBufferPool, PoolInterrupter};
pub use manager::{
    BufferManager, BufferManagerConfig, BufferManagerConfigBuilder, DEFAULT_BUFFER_SIZE,
    DEFAULT_NUM_BUFFERS,
};
pub(crate) use tuple_buffer::now_millis;
pub use tuple_buffer::{BufferRecycler, ChildIndex, TupleBuffer};

/// Anything that hands out tuple buffers.
pub trait BufferProvider: Send + Sync {
    /// Returns a buffer, blocking until one is available.
    fn get_buffer_blocking(&self) -> TupleBuffer;

    /// Blocks like [`get_buffer_blocking`](Self::get_buffer_blocking) but
    /// returns `None` once the provider was interrupted.
    fn get_buffer_interruptible(&self) -> Option<TupleBuffer> {
        Some(self.get_buffer_blocking())
    }

    /// Returns a buffer or `None` if none is available right now.
    fn get_buffer_no_blocking(&self) -> Option<TupleBuffer>;

    /// Waits at most `timeout` for a buffer.
    fn get_buffer_timeout(&self, timeout: Duration) -> Option<TupleBuffer>;

    /// Number of free buffers.
    fn available_buffers(&self) -> usize;

    /// Size of every buffer handed out.
    fn buffer_size(&self) -> usize;
}

/// Errors from buffer management.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// Invalid pool configuration.
    #[error("Invalid buffer configuration: {0}")]
    InvalidConfig(String),

    /// A view does not fit into its backing memory.
    #[error("Range {offset}+{len} exceeds backing memory of {capacity} bytes")]
    OutOfBounds {
        /// Start of the requested view.
        offset: usize,
        /// Length of the requested view.
        len: usize,
        /// Size of the backing memory.
        capacity: usize,
    },

    /// Payload does not fit into a buffer.
    #[error("Payload of {required} bytes exceeds buffer size {available}")]
    PayloadTooLarge {
        /// Bytes to store.
        required: usize,
        /// Buffer capacity.
        available: usize,
    },

    /// The buffer is shared and cannot be written.
    #[error("Buffer is shared and cannot be mutated")]
    NotWritable,
}

/// Copies `data` into the front of `buffer`.
///
/// # Errors
///
/// Returns [`BufferError::PayloadTooLarge`] if `data` does not fit and
/// [`BufferError::NotWritable`] if the buffer is shared.
pub fn write_payload(buffer: &mut TupleBuffer, data: &[u8]) -> Result<(), BufferError> {
    let available = buffer.buffer_size();
    if data.len() > available {
        return Err(BufferError::PayloadTooLarge {
            required: data.len(),
            available,
        });
    }
    let target = buffer.as_mut_slice().ok_or(BufferError::NotWritable)?;
    target[..data.len()].copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_payload() {
        let mut buffer = TupleBuffer::from_vec(vec![0; 4]);
        write_payload(&mut buffer, &[1, 2]).unwrap();
        assert_eq!(buffer.as_slice(), &[1, 2, 0, 0]);
        assert!(matches!(
            write_payload(&mut buffer, &[0; 5]),
            Err(BufferError::PayloadTooLarge { required: 5, available: 4 })
        ));
        let _shared = buffer.clone();
        assert!(matches!(
            write_payload(&mut buffer, &[1]),
            Err(BufferError::NotWritable)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = BufferError::OutOfBounds {
            offset: 4,
            len: 8,
            capacity: 10,
        };
        assert_eq!(
            err.to_string(),
            "Range 4+8 exceeds backing memory of 10 bytes"
        );
    }
}
