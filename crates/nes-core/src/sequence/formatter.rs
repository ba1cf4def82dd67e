//! Splits delimited raw buffers into records.

use std::sync::Arc;

use super::shredder::{SequenceShredder, StagedBuffer};
use super::SequenceError;
use crate::buffer::TupleBuffer;

/// Records recovered from one raw buffer.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FormattedRecords {
    /// Records that start and end inside the buffer.
    pub complete: Vec<Vec<u8>>,
    /// Spanning records this call assembled, in sequence order.
    pub spanning: Vec<Vec<u8>>,
}

impl FormattedRecords {
    /// Total number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.complete.len() + self.spanning.len()
    }

    /// True if no record was recovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns raw byte buffers into delimited records.
///
/// The number of valid bytes in a raw buffer is its
/// [`number_of_tuples`](TupleBuffer::number_of_tuples). Buffers may be
/// formatted by any number of threads in any order; every record is produced
/// exactly once. Empty records are skipped.
#[derive(Debug, Clone)]
pub struct InputFormatter {
    delimiter: u8,
    shredder: Arc<SequenceShredder>,
}

impl InputFormatter {
    /// Creates a formatter splitting on `delimiter`.
    #[must_use]
    pub fn new(delimiter: u8, shredder: Arc<SequenceShredder>) -> Self {
        Self {
            delimiter,
            shredder,
        }
    }

    /// Formats one raw buffer.
    ///
    /// # Errors
    ///
    /// Propagates [`SequenceError::OutOfRange`] (retry later) and
    /// [`SequenceError::AlreadyProcessed`] from the shredder.
    #[allow(clippy::cast_possible_truncation)]
    pub fn format(&self, raw: &TupleBuffer) -> Result<FormattedRecords, SequenceError> {
        let size = (raw.number_of_tuples() as usize).min(raw.buffer_size());
        let bytes = &raw.as_slice()[..size];
        let first = bytes.iter().position(|b| *b == self.delimiter);
        let last = bytes.iter().rposition(|b| *b == self.delimiter);

        let mut records = FormattedRecords::default();
        if let (Some(first), Some(last)) = (first, last) {
            if first < last {
                records.complete = bytes[first + 1..last]
                    .split(|b| *b == self.delimiter)
                    .filter(|r| !r.is_empty())
                    .map(<[u8]>::to_vec)
                    .collect();
            }
        }

        let staged = StagedBuffer {
            buffer: raw.clone(),
            size_in_bytes: size,
            first_delimiter: first,
            last_delimiter: last,
        };
        let spanning = self
            .shredder
            .process_sequence_number(raw.sequence_number(), staged)?;
        records.spanning = spanning
            .iter()
            .map(super::SpanningTuple::assemble)
            .filter(|r| !r.is_empty())
            .collect();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(sn: u64, bytes: &[u8]) -> TupleBuffer {
        let buffer = TupleBuffer::from_vec(bytes.to_vec());
        buffer.set_sequence_number(sn);
        buffer.set_number_of_tuples(bytes.len() as u64);
        buffer
    }

    #[test]
    fn test_complete_and_spanning_records() {
        let formatter = InputFormatter::new(b'\n', Arc::new(SequenceShredder::new(8).unwrap()));
        let first = formatter.format(&raw(1, b"1,a\n2,b\n3,")).unwrap();
        assert_eq!(first.complete, vec![b"2,b".to_vec()]);
        assert_eq!(first.spanning, vec![b"1,a".to_vec()]);

        let second = formatter.format(&raw(2, b"c\n4,d\n")).unwrap();
        assert_eq!(second.complete, vec![b"4,d".to_vec()]);
        assert_eq!(second.spanning, vec![b"3,c".to_vec()]);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_out_of_order_buffers() {
        let formatter = InputFormatter::new(b'|', Arc::new(SequenceShredder::new(8).unwrap()));
        let third = formatter.format(&raw(3, b"ghi|jk|")).unwrap();
        assert_eq!(third.complete, vec![b"jk".to_vec()]);
        assert!(third.spanning.is_empty());
        let second = formatter.format(&raw(2, b"def")).unwrap();
        assert!(second.is_empty());
        let first = formatter.format(&raw(1, b"abc|")).unwrap();
        assert_eq!(first.spanning, vec![b"abc".to_vec(), b"defghi".to_vec()]);
    }
}
