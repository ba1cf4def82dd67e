//! Fixed-size little-endian row layouts consumed and produced by the window
//! operators.

use super::WindowError;
use crate::buffer::{BufferError, TupleBuffer};
use crate::engine::{ExecutionContext, StageError};
use crate::ids::OriginId;
use crate::sequence::INITIAL_CHUNK_NUMBER;
use crate::time::Timestamp;

/// A row with a fixed byte width.
pub trait FixedRecord: Sized {
    /// Row width in bytes.
    const SIZE: usize;

    /// Writes the row into `out`, which is exactly `SIZE` bytes.
    fn write_to(&self, out: &mut [u8]);

    /// Reads a row from `bytes`, which is exactly `SIZE` bytes.
    fn read_from(bytes: &[u8]) -> Self;
}

fn u64_at(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn i64_at(bytes: &[u8], offset: usize) -> i64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    i64::from_le_bytes(word)
}

/// Input row: `timestamp | key | value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedRecord {
    /// Event time.
    pub timestamp: Timestamp,
    /// Grouping or join key.
    pub key: u64,
    /// Aggregated or joined value.
    pub value: i64,
}

impl FixedRecord for KeyedRecord {
    const SIZE: usize = 24;

    fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.timestamp.to_le_bytes());
        out[8..16].copy_from_slice(&self.key.to_le_bytes());
        out[16..24].copy_from_slice(&self.value.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            timestamp: u64_at(bytes, 0),
            key: u64_at(bytes, 8),
            value: i64_at(bytes, 16),
        }
    }
}

/// Aggregation output row: `window_start | window_end | key | value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateRecord {
    /// Window start.
    pub window_start: Timestamp,
    /// Window end.
    pub window_end: Timestamp,
    /// Group key.
    pub key: u64,
    /// Aggregate result.
    pub value: i64,
}

impl FixedRecord for AggregateRecord {
    const SIZE: usize = 32;

    fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.window_start.to_le_bytes());
        out[8..16].copy_from_slice(&self.window_end.to_le_bytes());
        out[16..24].copy_from_slice(&self.key.to_le_bytes());
        out[24..32].copy_from_slice(&self.value.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            window_start: u64_at(bytes, 0),
            window_end: u64_at(bytes, 8),
            key: u64_at(bytes, 16),
            value: i64_at(bytes, 24),
        }
    }
}

/// Join output row: `window_start | window_end | key | left | right`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinRecord {
    /// Window start.
    pub window_start: Timestamp,
    /// Window end.
    pub window_end: Timestamp,
    /// Join key.
    pub key: u64,
    /// Value from the left input.
    pub left: i64,
    /// Value from the right input.
    pub right: i64,
}

impl FixedRecord for JoinRecord {
    const SIZE: usize = 40;

    fn write_to(&self, out: &mut [u8]) {
        out[0..8].copy_from_slice(&self.window_start.to_le_bytes());
        out[8..16].copy_from_slice(&self.window_end.to_le_bytes());
        out[16..24].copy_from_slice(&self.key.to_le_bytes());
        out[24..32].copy_from_slice(&self.left.to_le_bytes());
        out[32..40].copy_from_slice(&self.right.to_le_bytes());
    }

    fn read_from(bytes: &[u8]) -> Self {
        Self {
            window_start: u64_at(bytes, 0),
            window_end: u64_at(bytes, 8),
            key: u64_at(bytes, 16),
            left: i64_at(bytes, 24),
            right: i64_at(bytes, 32),
        }
    }
}

/// Decodes the `number_of_tuples` rows of `buffer`.
///
/// # Errors
///
/// Returns [`WindowError::MalformedBuffer`] if the payload is shorter than
/// the announced rows.
pub fn read_records<R: FixedRecord>(buffer: &TupleBuffer) -> Result<Vec<R>, WindowError> {
    let bytes = buffer.as_slice();
    let malformed = || WindowError::MalformedBuffer {
        len: bytes.len(),
        record_size: R::SIZE,
    };
    let count = usize::try_from(buffer.number_of_tuples()).map_err(|_| malformed())?;
    let needed = count.checked_mul(R::SIZE).ok_or_else(malformed)?;
    if needed > bytes.len() {
        return Err(malformed());
    }
    Ok(bytes[..needed].chunks_exact(R::SIZE).map(R::read_from).collect())
}

/// Packs rows of one window into pooled buffers and emits them as chunks of
/// a single sequence number.
///
/// The final chunk is flagged as last; a window without rows still emits one
/// empty last chunk so downstream sequence tracking sees no gap.
#[derive(Debug)]
pub struct RecordWriter {
    current: Option<TupleBuffer>,
    rows: usize,
    chunk: u64,
    origin: OriginId,
    sequence_number: u64,
    watermark: Timestamp,
}

impl RecordWriter {
    /// Starts the output of sequence number `sequence_number`.
    #[must_use]
    pub fn new(origin: OriginId, sequence_number: u64, watermark: Timestamp) -> Self {
        Self {
            current: None,
            rows: 0,
            chunk: INITIAL_CHUNK_NUMBER,
            origin,
            sequence_number,
            watermark,
        }
    }

    /// Appends `record`, emitting the current buffer when it is full.
    ///
    /// # Errors
    ///
    /// Returns a buffer error if a row does not fit into an empty buffer.
    pub fn push<R: FixedRecord>(
        &mut self,
        record: &R,
        ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), StageError> {
        let capacity = ctx.buffer_manager().buffer_size();
        if R::SIZE > capacity {
            return Err(BufferError::PayloadTooLarge {
                required: R::SIZE,
                available: capacity,
            }
            .into());
        }
        if (self.rows + 1) * R::SIZE > capacity {
            self.flush(ctx, false);
        }
        let buffer = self.current.get_or_insert_with(|| ctx.allocate_buffer());
        let offset = self.rows * R::SIZE;
        let out = buffer.as_mut_slice().ok_or(BufferError::NotWritable)?;
        record.write_to(&mut out[offset..offset + R::SIZE]);
        self.rows += 1;
        Ok(())
    }

    /// Emits the last chunk.
    pub fn finish(mut self, ctx: &mut ExecutionContext<'_>) {
        self.flush(ctx, true);
    }

    fn flush(&mut self, ctx: &mut ExecutionContext<'_>, last: bool) {
        let buffer = match self.current.take() {
            Some(buffer) => buffer,
            None if last => ctx.allocate_buffer(),
            None => return,
        };
        buffer.set_number_of_tuples(self.rows as u64);
        buffer.set_origin_id(self.origin);
        buffer.set_sequence_number(self.sequence_number);
        buffer.set_chunk_number(self.chunk);
        buffer.set_last_chunk(last);
        buffer.set_watermark(self.watermark);
        self.chunk += 1;
        self.rows = 0;
        ctx.emit(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_records() {
        let rows = [
            KeyedRecord {
                timestamp: 1,
                key: 2,
                value: -3,
            },
            KeyedRecord {
                timestamp: 4,
                key: 5,
                value: 6,
            },
        ];
        let mut bytes = vec![0; 64];
        for (i, row) in rows.iter().enumerate() {
            row.write_to(&mut bytes[i * KeyedRecord::SIZE..(i + 1) * KeyedRecord::SIZE]);
        }
        let buffer = TupleBuffer::from_vec(bytes);
        buffer.set_number_of_tuples(2);
        assert_eq!(read_records::<KeyedRecord>(&buffer).unwrap(), rows);
    }

    #[test]
    fn test_read_records_rejects_short_payload() {
        let buffer = TupleBuffer::from_vec(vec![0; 30]);
        buffer.set_number_of_tuples(2);
        assert!(matches!(
            read_records::<KeyedRecord>(&buffer),
            Err(WindowError::MalformedBuffer { len: 30, record_size: 24 })
        ));
    }
}
