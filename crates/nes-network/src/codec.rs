//! Framing of [`Message`]s on a byte stream.

use bytes::{Buf, BufMut, BytesMut};
use nes_core::buffer::{ChildIndex, TupleBuffer};
use nes_core::engine::QueryTerminationType;
use nes_core::ids::{OperatorId, OriginId, QueryId};
use nes_core::sequence::SequenceData;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{
    ErrorKind, Message, MessageHeader, MessageType, NesPartition, HEADER_SIZE, MAGIC,
};

/// Default upper bound on a frame payload (64 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors while framing.
///
/// Every variant except [`ProtocolError::Io`] means the stream is corrupt;
/// the connection is torn down and not retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The frame does not start with the magic number
    #[error("Bad magic number {0:#010x}")]
    BadMagic(u32),

    /// The header names an unknown message type
    #[error("Unknown message type {0}")]
    UnknownMessageType(u8),

    /// The payload exceeds the configured maximum
    #[error("Frame of {size} bytes exceeds the maximum of {max}")]
    FrameTooLarge {
        /// Payload size
        size: usize,
        /// Configured maximum
        max: usize,
    },

    /// The payload does not match its type
    #[error("Malformed {msg_type:?} payload: {reason}")]
    Malformed {
        /// Frame type
        msg_type: MessageType,
        /// What was wrong
        reason: String,
    },
}

/// Encoder and decoder for exchange frames.
#[derive(Debug, Clone, Copy)]
pub struct ExchangeCodec {
    max_frame_size: usize,
}

impl Default for ExchangeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl ExchangeCodec {
    /// Creates a codec accepting payloads up to `max_frame_size` bytes.
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Largest accepted payload.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

struct Payload<'a> {
    buf: &'a mut BytesMut,
    msg_type: MessageType,
}

impl Payload<'_> {
    fn malformed(&self, reason: impl Into<String>) -> ProtocolError {
        ProtocolError::Malformed {
            msg_type: self.msg_type,
            reason: reason.into(),
        }
    }

    fn need(&self, n: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < n {
            return Err(self.malformed(format!(
                "needs {n} more bytes, {} left",
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        self.need(8)?;
        Ok(self.buf.get_u64())
    }

    fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u32()? as usize;
        self.need(len)?;
        let mut data = vec![0u8; len];
        self.buf.copy_to_slice(&mut data);
        Ok(data)
    }

    fn partition(&mut self) -> Result<NesPartition, ProtocolError> {
        Ok(NesPartition {
            query_id: QueryId(self.u64()?),
            operator_id: OperatorId(self.u64()?),
            partition_id: self.u64()?,
            subpartition_id: self.u64()?,
        })
    }

    fn finish(self, message: Message) -> Result<Message, ProtocolError> {
        if self.buf.has_remaining() {
            return Err(self.malformed(format!("{} trailing bytes", self.buf.remaining())));
        }
        Ok(message)
    }
}

fn decode_payload(msg_type: MessageType, buf: &mut BytesMut) -> Result<Message, ProtocolError> {
    let mut p = Payload { buf, msg_type };
    let message = match msg_type {
        MessageType::ClientAnnouncement => Message::ClientAnnouncement(p.partition()?),
        MessageType::ServerReady => Message::ServerReady(p.partition()?),
        MessageType::DataBuffer => {
            let partition = p.partition()?;
            let tuples = p.u64()?;
            let origin = p.u64()?;
            let watermark = p.u64()?;
            let sequence_number = p.u64()?;
            let chunk_number = p.u64()?;
            let last_chunk = p.u8()? != 0;
            let created = p.u64()?;
            let buffer = TupleBuffer::from_vec(p.bytes()?);
            buffer.set_number_of_tuples(tuples);
            buffer.set_origin_id(OriginId(origin));
            buffer.set_watermark(watermark);
            buffer.set_sequence_data(SequenceData::new(sequence_number, chunk_number, last_chunk));
            buffer.set_creation_timestamp_ms(created);
            let children = p.u32()?;
            for _ in 0..children {
                buffer.store_child_buffer(TupleBuffer::from_vec(p.bytes()?));
            }
            Message::DataBuffer { partition, buffer }
        }
        MessageType::EndOfStream => {
            let partition = p.partition()?;
            let raw = p.u8()?;
            let termination = QueryTerminationType::from_u8(raw)
                .ok_or_else(|| p.malformed(format!("termination type {raw}")))?;
            Message::EndOfStream {
                partition,
                termination,
            }
        }
        MessageType::ErrorMessage => {
            let partition = p.partition()?;
            let raw = p.u8()?;
            let kind = ErrorKind::from_u8(raw).ok_or_else(|| p.malformed(format!("error kind {raw}")))?;
            let message = String::from_utf8(p.bytes()?).map_err(|e| p.malformed(e.to_string()))?;
            Message::Error {
                partition,
                kind,
                message,
            }
        }
    };
    p.finish(message)
}

fn put_partition(dst: &mut BytesMut, partition: &NesPartition) {
    dst.put_u64(partition.query_id.get());
    dst.put_u64(partition.operator_id.get());
    dst.put_u64(partition.partition_id);
    dst.put_u64(partition.subpartition_id);
}

fn put_bytes(dst: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    let len = u32::try_from(data.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    dst.put_u32(len);
    dst.put_slice(data);
    Ok(())
}

fn encode_payload(message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
    match message {
        Message::ClientAnnouncement(partition) | Message::ServerReady(partition) => {
            put_partition(dst, partition);
        }
        Message::DataBuffer { partition, buffer } => {
            put_partition(dst, partition);
            dst.put_u64(buffer.number_of_tuples());
            dst.put_u64(buffer.origin_id().get());
            dst.put_u64(buffer.watermark());
            dst.put_u64(buffer.sequence_number());
            dst.put_u64(buffer.chunk_number());
            dst.put_u8(u8::from(buffer.is_last_chunk()));
            dst.put_u64(buffer.creation_timestamp_ms());
            put_bytes(dst, buffer.as_slice())?;
            let children: Vec<TupleBuffer> = (0..buffer.num_child_buffers())
                .filter_map(|i| ChildIndex::try_from(i).ok())
                .filter_map(|i| buffer.load_child_buffer(i))
                .collect();
            let count = u32::try_from(children.len()).map_err(|_| ProtocolError::Malformed {
                msg_type: MessageType::DataBuffer,
                reason: format!("{} child buffers", children.len()),
            })?;
            dst.put_u32(count);
            for child in &children {
                put_bytes(dst, child.as_slice())?;
            }
        }
        Message::EndOfStream {
            partition,
            termination,
        } => {
            put_partition(dst, partition);
            dst.put_u8(termination.as_u8());
        }
        Message::Error {
            partition,
            kind,
            message,
        } => {
            put_partition(dst, partition);
            dst.put_u8(*kind as u8);
            put_bytes(dst, message.as_bytes())?;
        }
    }
    Ok(())
}

impl Decoder for ExchangeCodec {
    type Item = Message;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
        let Some(raw) = src.get(..HEADER_SIZE).and_then(|b| <&[u8; HEADER_SIZE]>::try_from(b).ok()) else {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        };
        let header = MessageHeader::read_from(raw);
        if header.magic != MAGIC {
            return Err(ProtocolError::BadMagic(header.magic));
        }
        let msg_type = MessageType::from_u8(header.msg_type)
            .ok_or(ProtocolError::UnknownMessageType(header.msg_type))?;
        let size = header.payload_size as usize;
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        if src.len() < HEADER_SIZE + size {
            src.reserve(HEADER_SIZE + size - src.len());
            return Ok(None);
        }
        src.advance(HEADER_SIZE);
        let mut payload = src.split_to(size);
        decode_payload(msg_type, &mut payload).map(Some)
    }
}

impl Encoder<Message> for ExchangeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = dst.len();
        dst.put_bytes(0, HEADER_SIZE);
        if let Err(e) = encode_payload(&message, dst) {
            dst.truncate(start);
            return Err(e);
        }
        let size = dst.len() - start - HEADER_SIZE;
        if size > self.max_frame_size {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        let header = MessageHeader {
            magic: MAGIC,
            msg_type: message.message_type() as u8,
            payload_size: u32::try_from(size).map_err(|_| ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            })?,
            sequence_number: message.sequence_number(),
        };
        let mut raw = [0u8; HEADER_SIZE];
        header.write_to(&mut raw);
        dst[start..start + HEADER_SIZE].copy_from_slice(&raw);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> NesPartition {
        NesPartition::new(QueryId(1), OperatorId(2), 0, 3)
    }

    fn encode(message: Message) -> BytesMut {
        let mut dst = BytesMut::new();
        ExchangeCodec::default().encode(message, &mut dst).unwrap();
        dst
    }

    #[test]
    fn test_data_buffer_keeps_metadata_and_children() {
        let buffer = TupleBuffer::from_vec(b"payload".to_vec());
        buffer.set_number_of_tuples(7);
        buffer.set_origin_id(OriginId(4));
        buffer.set_watermark(99);
        buffer.set_sequence_data(SequenceData::new(12, 1, false));
        buffer.set_creation_timestamp_ms(55);
        buffer.store_child_buffer(TupleBuffer::from_vec(b"var".to_vec()));

        let mut bytes = encode(Message::DataBuffer {
            partition: partition(),
            buffer,
        });
        // Sequence number is mirrored in the header.
        assert_eq!(&bytes[9..17], &12u64.to_be_bytes());

        let decoded = ExchangeCodec::default().decode(&mut bytes).unwrap().unwrap();
        let Message::DataBuffer { partition: p, buffer } = decoded else {
            panic!("expected a data buffer");
        };
        assert_eq!(p, partition());
        assert_eq!(buffer.as_slice(), b"payload");
        assert_eq!(buffer.number_of_tuples(), 7);
        assert_eq!(buffer.origin_id(), OriginId(4));
        assert_eq!(buffer.watermark(), 99);
        assert_eq!(buffer.sequence_data(), SequenceData::new(12, 1, false));
        assert_eq!(buffer.creation_timestamp_ms(), 55);
        assert_eq!(buffer.load_child_buffer(0).unwrap().as_slice(), b"var");
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_partial_frame_waits_for_more() {
        let full = encode(Message::EndOfStream {
            partition: partition(),
            termination: QueryTerminationType::HardStop,
        });
        let mut codec = ExchangeCodec::default();
        let mut partial = BytesMut::from(&full[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[10..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);
        assert!(matches!(
            codec.decode(&mut partial).unwrap(),
            Some(Message::EndOfStream {
                termination: QueryTerminationType::HardStop,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = encode(Message::ServerReady(partition()));
        bytes[0] = 0;
        assert!(matches!(
            ExchangeCodec::default().decode(&mut bytes),
            Err(ProtocolError::BadMagic(0x00DC_0FFE))
        ));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let mut bytes = encode(Message::ServerReady(partition()));
        bytes[4] = 9;
        assert!(matches!(
            ExchangeCodec::default().decode(&mut bytes),
            Err(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_frame_size_limit() {
        let mut bytes = encode(Message::Error {
            partition: partition(),
            kind: ErrorKind::Unknown,
            message: "x".repeat(64),
        });
        assert!(matches!(
            ExchangeCodec::new(16).decode(&mut bytes),
            Err(ProtocolError::FrameTooLarge { max: 16, .. })
        ));

        let mut dst = BytesMut::new();
        let result = ExchangeCodec::new(16).encode(Message::ServerReady(partition()), &mut dst);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 32, .. })));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_error_message_round_trip() {
        let mut bytes = encode(Message::Error {
            partition: partition(),
            kind: ErrorKind::DeletedPartition,
            message: "gone".into(),
        });
        let decoded = ExchangeCodec::default().decode(&mut bytes).unwrap();
        assert!(matches!(
            decoded,
            Some(Message::Error { kind: ErrorKind::DeletedPartition, ref message, .. }) if message == "gone"
        ));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let mut bytes = encode(Message::ServerReady(partition()));
        // Claim a shorter payload than the partition needs.
        bytes[8] = 8;
        bytes.truncate(HEADER_SIZE + 8);
        assert!(matches!(
            ExchangeCodec::default().decode(&mut bytes),
            Err(ProtocolError::Malformed { .. })
        ));
    }
}
