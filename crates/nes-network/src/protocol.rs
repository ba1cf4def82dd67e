//! Exchange addressing and wire messages.
//!
//! Every frame starts with a 17 byte big-endian header:
//!
//! ```text
//! ┌───────────┬──────────┬──────────────┬─────────────────┐
//! │ magic u32 │ type u8  │ payload u32  │ sequence u64    │
//! └───────────┴──────────┴──────────────┴─────────────────┘
//! ```
//!
//! followed by `payload` bytes whose layout depends on the type.

use std::fmt;

use nes_core::buffer::TupleBuffer;
use nes_core::engine::QueryTerminationType;
use nes_core::ids::{NodeId, OperatorId, QueryId};

/// Marks the start of every frame.
pub const MAGIC: u32 = 0xBADC_0FFE;

/// Bytes in a [`MessageHeader`].
pub const HEADER_SIZE: usize = 17;

/// Bytes in an encoded [`NesPartition`].
pub const PARTITION_SIZE: usize = 32;

/// Address of one exchange endpoint between two operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NesPartition {
    /// Query the exchange belongs to.
    pub query_id: QueryId,
    /// Operator that produces into the exchange.
    pub operator_id: OperatorId,
    /// Partition of the operator output.
    pub partition_id: u64,
    /// Subpartition within the partition.
    pub subpartition_id: u64,
}

impl NesPartition {
    /// Creates a partition address.
    #[must_use]
    pub const fn new(
        query_id: QueryId,
        operator_id: OperatorId,
        partition_id: u64,
        subpartition_id: u64,
    ) -> Self {
        Self {
            query_id,
            operator_id,
            partition_id,
            subpartition_id,
        }
    }
}

impl fmt::Display for NesPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}::{}::{}",
            self.query_id.get(),
            self.operator_id.get(),
            self.partition_id,
            self.subpartition_id
        )
    }
}

/// Where a worker node accepts exchange connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeLocation {
    /// Node identity.
    pub node_id: NodeId,
    /// Host name or IP address.
    pub hostname: String,
    /// Data port.
    pub port: u16,
}

impl NodeLocation {
    /// Creates a location.
    #[must_use]
    pub fn new(node_id: NodeId, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            node_id,
            hostname: hostname.into(),
            port,
        }
    }

    /// `host:port`, suitable for connecting.
    #[must_use]
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

impl fmt::Display for NodeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.node_id, self.hostname, self.port)
    }
}

/// Frame type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Consumer handshake, sent by the producer's channel.
    ClientAnnouncement = 0,
    /// Handshake acknowledgment.
    ServerReady = 1,
    /// One tuple buffer.
    DataBuffer = 2,
    /// The producer closed the partition.
    EndOfStream = 3,
    /// A failure report.
    ErrorMessage = 4,
}

impl MessageType {
    /// Parses the wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::ClientAnnouncement),
            1 => Some(Self::ServerReady),
            2 => Some(Self::DataBuffer),
            3 => Some(Self::EndOfStream),
            4 => Some(Self::ErrorMessage),
            _ => None,
        }
    }
}

/// Reason carried by an [`Message::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    /// No consumer registered the partition in time.
    PartitionNotRegistered = 0,
    /// The consumer of the partition is gone.
    DeletedPartition = 1,
    /// Anything else, including query failures.
    Unknown = 2,
}

impl ErrorKind {
    /// Parses the wire value.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PartitionNotRegistered),
            1 => Some(Self::DeletedPartition),
            2 => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PartitionNotRegistered => write!(f, "partition not registered"),
            Self::DeletedPartition => write!(f, "partition deleted"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

/// Fixed frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Always [`MAGIC`] on a healthy stream.
    pub magic: u32,
    /// Raw [`MessageType`].
    pub msg_type: u8,
    /// Bytes following the header.
    pub payload_size: u32,
    /// Buffer sequence number for data frames, 0 otherwise.
    pub sequence_number: u64,
}

impl MessageHeader {
    /// Writes the header into `out`.
    pub fn write_to(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0..4].copy_from_slice(&self.magic.to_be_bytes());
        out[4] = self.msg_type;
        out[5..9].copy_from_slice(&self.payload_size.to_be_bytes());
        out[9..17].copy_from_slice(&self.sequence_number.to_be_bytes());
    }

    /// Reads a header from `bytes`.
    #[must_use]
    pub fn read_from(bytes: &[u8; HEADER_SIZE]) -> Self {
        let word = |range: std::ops::Range<usize>| {
            let mut w = [0u8; 8];
            w[8 - range.len()..].copy_from_slice(&bytes[range]);
            u64::from_be_bytes(w)
        };
        #[allow(clippy::cast_possible_truncation)]
        Self {
            magic: word(0..4) as u32,
            msg_type: bytes[4],
            payload_size: word(5..9) as u32,
            sequence_number: word(9..17),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub enum Message {
    /// Producer asks the consumer of `partition` to accept data.
    ClientAnnouncement(NesPartition),
    /// Consumer accepted the announcement.
    ServerReady(NesPartition),
    /// One buffer for `partition`.
    DataBuffer {
        /// Target partition.
        partition: NesPartition,
        /// Received or outgoing buffer, with metadata and children.
        buffer: TupleBuffer,
    },
    /// The producer closed `partition`.
    EndOfStream {
        /// Closed partition.
        partition: NesPartition,
        /// How the producer ended.
        termination: QueryTerminationType,
    },
    /// A failure report.
    Error {
        /// Affected partition.
        partition: NesPartition,
        /// Reason.
        kind: ErrorKind,
        /// Human-readable detail.
        message: String,
    },
}

impl Message {
    /// Wire type of this message.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ClientAnnouncement(_) => MessageType::ClientAnnouncement,
            Self::ServerReady(_) => MessageType::ServerReady,
            Self::DataBuffer { .. } => MessageType::DataBuffer,
            Self::EndOfStream { .. } => MessageType::EndOfStream,
            Self::Error { .. } => MessageType::ErrorMessage,
        }
    }

    /// Partition the message is about.
    #[must_use]
    pub fn partition(&self) -> NesPartition {
        match self {
            Self::ClientAnnouncement(p) | Self::ServerReady(p) => *p,
            Self::DataBuffer { partition, .. }
            | Self::EndOfStream { partition, .. }
            | Self::Error { partition, .. } => *partition,
        }
    }

    /// Sequence number placed in the header.
    #[must_use]
    pub fn sequence_number(&self) -> u64 {
        match self {
            Self::DataBuffer { buffer, .. } => buffer.sequence_number(),
            _ => 0,
        }
    }
}
