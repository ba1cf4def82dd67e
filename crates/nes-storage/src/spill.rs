//! Spill files: tuple buffers persisted to disk.
//!
//! All integers are big-endian. Layout:
//!
//! ```text
//! file   := count:u64 buffer*
//! buffer := header payload child*
//! header := tuples:u64 size:u64 children:u32 seq:u64 chunk:u64
//!           last_chunk:u8 origin:u64 watermark:u64 created_ms:u64
//! child  := tuples:u64 size:u64 payload
//! ```
//!
//! The count is written when the writer finishes, so a file that was not
//! finished reads as empty.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use nes_core::buffer::{ChildIndex, TupleBuffer};
use nes_core::ids::OriginId;
use nes_core::sequence::SequenceData;
use tracing::trace;

use crate::StorageError;

/// Upper bound on a single payload read from a spill file.
const MAX_PAYLOAD: u64 = 1 << 32;

fn write_u64(out: &mut impl Write, value: u64) -> std::io::Result<()> {
    out.write_all(&value.to_be_bytes())
}

fn read_u64(input: &mut impl Read) -> std::io::Result<u64> {
    let mut word = [0u8; 8];
    input.read_exact(&mut word)?;
    Ok(u64::from_be_bytes(word))
}

fn read_u32(input: &mut impl Read) -> std::io::Result<u32> {
    let mut word = [0u8; 4];
    input.read_exact(&mut word)?;
    Ok(u32::from_be_bytes(word))
}

fn read_payload(input: &mut impl Read, size: u64, position: u64) -> Result<Vec<u8>, StorageError> {
    if size > MAX_PAYLOAD {
        return Err(StorageError::Corrupted {
            position,
            reason: format!("payload of {size} bytes"),
        });
    }
    let len = usize::try_from(size).map_err(|_| StorageError::Corrupted {
        position,
        reason: format!("payload of {size} bytes does not fit in memory"),
    })?;
    let mut payload = vec![0u8; len];
    input.read_exact(&mut payload)?;
    Ok(payload)
}

/// Writes `buffer` (and its children) in spill layout.
///
/// # Errors
///
/// Returns [`StorageError::Io`] if writing fails.
pub fn encode_buffer(out: &mut impl Write, buffer: &TupleBuffer) -> Result<(), StorageError> {
    let payload = buffer.as_slice();
    let children = buffer.num_child_buffers();
    let child_count = u32::try_from(children).map_err(|_| StorageError::Corrupted {
        position: 0,
        reason: format!("{children} child buffers"),
    })?;
    write_u64(out, buffer.number_of_tuples())?;
    write_u64(out, payload.len() as u64)?;
    out.write_all(&child_count.to_be_bytes())?;
    write_u64(out, buffer.sequence_number())?;
    write_u64(out, buffer.chunk_number())?;
    out.write_all(&[u8::from(buffer.is_last_chunk())])?;
    write_u64(out, buffer.origin_id().get())?;
    write_u64(out, buffer.watermark())?;
    write_u64(out, buffer.creation_timestamp_ms())?;
    out.write_all(payload)?;

    for index in 0..child_count {
        let Some(child) = buffer.load_child_buffer(index) else {
            continue;
        };
        let child_payload = child.as_slice();
        write_u64(out, child.number_of_tuples())?;
        write_u64(out, child_payload.len() as u64)?;
        out.write_all(child_payload)?;
    }
    Ok(())
}

/// Reads one buffer written by [`encode_buffer`].
///
/// The buffer and its children are unpooled.
///
/// # Errors
///
/// Returns [`StorageError::Io`] on a read failure (including a truncated
/// file) and [`StorageError::Corrupted`] for implausible sizes.
pub fn decode_buffer(input: &mut impl Read) -> Result<TupleBuffer, StorageError> {
    let tuples = read_u64(input)?;
    let size = read_u64(input)?;
    let children = read_u32(input)?;
    let sequence_number = read_u64(input)?;
    let chunk_number = read_u64(input)?;
    let mut last = [0u8; 1];
    input.read_exact(&mut last)?;
    let origin = read_u64(input)?;
    let watermark = read_u64(input)?;
    let created = read_u64(input)?;

    let buffer = TupleBuffer::from_vec(read_payload(input, size, sequence_number)?);
    buffer.set_number_of_tuples(tuples);
    buffer.set_sequence_data(SequenceData::new(sequence_number, chunk_number, last[0] != 0));
    buffer.set_origin_id(OriginId(origin));
    buffer.set_watermark(watermark);
    buffer.set_creation_timestamp_ms(created);

    for _ in 0..children {
        let child_tuples = read_u64(input)?;
        let child_size = read_u64(input)?;
        let child = TupleBuffer::from_vec(read_payload(input, child_size, sequence_number)?);
        child.set_number_of_tuples(child_tuples);
        buffer.store_child_buffer(child);
    }
    Ok(buffer)
}

/// Appends buffers to a new spill file.
pub struct SpillWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    count: u64,
    bytes: u64,
}

impl SpillWriter {
    /// Creates (or truncates) the spill file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be created.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut writer = BufWriter::new(file);
        write_u64(&mut writer, 0)?;
        Ok(Self {
            writer,
            path,
            count: 0,
            bytes: 8,
        })
    }

    /// Appends `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if writing fails.
    pub fn append(&mut self, buffer: &TupleBuffer) -> Result<(), StorageError> {
        encode_buffer(&mut self.writer, buffer)?;
        self.count += 1;
        self.bytes += encoded_len(buffer);
        Ok(())
    }

    /// Number of buffers appended so far.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Writes the buffer count, syncs and closes the file.
    ///
    /// Returns the file size in bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if flushing or syncing fails.
    pub fn finish(mut self) -> Result<u64, StorageError> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&self.count.to_be_bytes())?;
        file.sync_all()?;
        trace!(path = %self.path.display(), count = self.count, bytes = self.bytes, "spill file written");
        Ok(self.bytes)
    }
}

impl std::fmt::Debug for SpillWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillWriter")
            .field("path", &self.path)
            .field("count", &self.count)
            .finish_non_exhaustive()
    }
}

/// Bytes `buffer` occupies in a spill file.
#[must_use]
pub fn encoded_len(buffer: &TupleBuffer) -> u64 {
    const HEADER: u64 = 8 + 8 + 4 + 8 + 8 + 1 + 8 + 8 + 8;
    const CHILD_HEADER: u64 = 8 + 8;
    let children: u64 = (0..buffer.num_child_buffers())
        .filter_map(|i| ChildIndex::try_from(i).ok())
        .filter_map(|i| buffer.load_child_buffer(i))
        .map(|c| CHILD_HEADER + c.as_slice().len() as u64)
        .sum();
    HEADER + buffer.as_slice().len() as u64 + children
}

/// Reads the buffers of a spill file in write order.
pub struct SpillReader {
    reader: BufReader<File>,
    remaining: u64,
}

impl SpillReader {
    /// Opens the spill file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the file cannot be opened or its
    /// header is missing.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut reader = BufReader::new(File::open(path)?);
        let remaining = read_u64(&mut reader)?;
        Ok(Self { reader, remaining })
    }

    /// Buffers not read yet.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Iterator for SpillReader {
    type Item = Result<TupleBuffer, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let next = decode_buffer(&mut self.reader);
        if next.is_err() {
            self.remaining = 0;
        }
        Some(next)
    }
}

impl std::fmt::Debug for SpillReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillReader")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}

/// Writes `buffers` to a new spill file at `path` and returns its size.
///
/// # Errors
///
/// Returns [`StorageError::Io`] if writing fails.
pub fn write_spill_file<P: AsRef<Path>>(path: P, buffers: &[TupleBuffer]) -> Result<u64, StorageError> {
    let mut writer = SpillWriter::create(path)?;
    for buffer in buffers {
        writer.append(buffer)?;
    }
    writer.finish()
}

/// Reads every buffer of the spill file at `path`.
///
/// # Errors
///
/// Returns an error if the file is missing or corrupted.
pub fn read_spill_file<P: AsRef<Path>>(path: P) -> Result<Vec<TupleBuffer>, StorageError> {
    SpillReader::open(path)?.collect()
}
