//! Sources backed by memory or closures.

use std::sync::Arc;

use super::{DataSource, SourceError};
use crate::buffer::{write_payload, BufferManager, BufferProvider, TupleBuffer};

/// Replays a fixed byte image of fixed-size records.
///
/// Each buffer carries as many whole records as fit into one pooled buffer.
/// By default the records are copied into pooled buffers; with
/// [`MemorySource::wrapping`] the buffers are read-only views over the image
/// and the pool is not touched.
#[derive(Debug)]
pub struct MemorySource {
    image: Arc<[u8]>,
    record_size: usize,
    offset: usize,
    wrap: bool,
    buffer_manager: Option<Arc<BufferManager>>,
}

impl MemorySource {
    /// Creates a copying source.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidConfig`] for a zero record size or an
    /// image that is not a whole number of records.
    pub fn new(image: impl Into<Arc<[u8]>>, record_size: usize) -> Result<Self, SourceError> {
        let image = image.into();
        if record_size == 0 || image.len() % record_size != 0 {
            return Err(SourceError::InvalidConfig(format!(
                "image of {} bytes is not a multiple of record size {record_size}",
                image.len()
            )));
        }
        Ok(Self {
            image,
            record_size,
            offset: 0,
            wrap: false,
            buffer_manager: None,
        })
    }

    /// Produces views over the image instead of copies.
    #[must_use]
    pub fn wrapping(mut self) -> Self {
        self.wrap = true;
        self
    }

    fn records_per_buffer(&self, buffer_size: usize) -> Result<usize, SourceError> {
        let records = buffer_size / self.record_size;
        if records == 0 {
            return Err(SourceError::InvalidConfig(format!(
                "record size {} exceeds buffer size {buffer_size}",
                self.record_size
            )));
        }
        Ok(records)
    }
}

impl DataSource for MemorySource {
    fn open(&mut self, buffer_manager: &Arc<BufferManager>) -> Result<(), SourceError> {
        self.buffer_manager = Some(Arc::clone(buffer_manager));
        Ok(())
    }

    fn receive_data(&mut self, pool: &dyn BufferProvider) -> Result<Option<TupleBuffer>, SourceError> {
        if self.offset >= self.image.len() {
            return Ok(None);
        }
        let records = self.records_per_buffer(pool.buffer_size())?;
        let len = (records * self.record_size).min(self.image.len() - self.offset);
        let buffer = if self.wrap {
            let manager = self
                .buffer_manager
                .as_ref()
                .ok_or_else(|| SourceError::Receive("source was not opened".into()))?;
            manager.wrap_memory(Arc::clone(&self.image), self.offset, len)?
        } else {
            let Some(mut buffer) = pool.get_buffer_interruptible() else {
                return Ok(None);
            };
            write_payload(&mut buffer, &self.image[self.offset..self.offset + len])?;
            buffer
        };
        buffer.set_number_of_tuples((len / self.record_size) as u64);
        self.offset += len;
        Ok(Some(buffer))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Fills pooled buffers through a closure.
///
/// The closure receives a writable buffer and returns the number of tuples
/// it wrote, or `None` once the stream is exhausted.
pub struct LambdaSource<F> {
    fill: F,
}

impl<F> LambdaSource<F>
where
    F: FnMut(&mut TupleBuffer) -> Option<u64> + Send,
{
    /// Creates a source around `fill`.
    pub fn new(fill: F) -> Self {
        Self { fill }
    }
}

impl<F> DataSource for LambdaSource<F>
where
    F: FnMut(&mut TupleBuffer) -> Option<u64> + Send,
{
    fn receive_data(&mut self, pool: &dyn BufferProvider) -> Result<Option<TupleBuffer>, SourceError> {
        let Some(mut buffer) = pool.get_buffer_interruptible() else {
            return Ok(None);
        };
        Ok((self.fill)(&mut buffer).map(|tuples| {
            buffer.set_number_of_tuples(tuples);
            buffer
        }))
    }

    fn name(&self) -> &str {
        "lambda"
    }
}

impl<F> std::fmt::Debug for LambdaSource<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LambdaSource").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManagerConfig;

    fn manager() -> Arc<BufferManager> {
        BufferManager::new(BufferManagerConfig::builder().buffer_size(8).num_buffers(4).build()).unwrap()
    }

    #[test]
    fn test_memory_source_copies_whole_records() {
        let manager = manager();
        let image: Vec<u8> = (0..20).collect();
        let mut source = MemorySource::new(image, 4).unwrap();
        source.open(&manager).unwrap();

        let first = source.receive_data(manager.as_ref()).unwrap().unwrap();
        assert_eq!(first.number_of_tuples(), 2);
        assert_eq!(&first.as_slice()[..8], &[0, 1, 2, 3, 4, 5, 6, 7]);
        assert!(first.is_pooled());

        let _second = source.receive_data(manager.as_ref()).unwrap().unwrap();
        let third = source.receive_data(manager.as_ref()).unwrap().unwrap();
        assert_eq!(third.number_of_tuples(), 1);
        assert_eq!(&third.as_slice()[..4], &[16, 17, 18, 19]);
        assert!(source.receive_data(manager.as_ref()).unwrap().is_none());
    }

    #[test]
    fn test_memory_source_wrapping_leaves_pool_untouched() {
        let manager = manager();
        let mut source = MemorySource::new(vec![7u8; 12], 4).unwrap().wrapping();
        source.open(&manager).unwrap();
        let buffer = source.receive_data(manager.as_ref()).unwrap().unwrap();
        assert!(!buffer.is_pooled());
        assert_eq!(buffer.as_slice(), &[7; 8]);
        assert_eq!(manager.available_buffers(), 4);
    }

    #[test]
    fn test_memory_source_rejects_partial_records() {
        assert!(matches!(MemorySource::new(vec![0u8; 5], 2), Err(SourceError::InvalidConfig(_))));
    }

    #[test]
    fn test_lambda_source_stops_on_none() {
        let manager = manager();
        let mut remaining = 2;
        let mut source = LambdaSource::new(move |buffer: &mut TupleBuffer| {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            buffer.as_mut_slice()?[0] = 42;
            Some(1)
        });
        assert_eq!(source.receive_data(manager.as_ref()).unwrap().unwrap().number_of_tuples(), 1);
        assert!(source.receive_data(manager.as_ref()).unwrap().is_some());
        assert!(source.receive_data(manager.as_ref()).unwrap().is_none());
    }
}
