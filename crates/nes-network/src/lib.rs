//! # `NebulaStream` Network
//!
//! Partition-addressed exchange of tuple buffers between worker nodes.
//!
//! ## Architecture
//!
//! ```text
//!   node A                                          node B
//! ┌─────────────┐  send_buffer  ┌──────────────┐   TCP   ┌───────────────┐
//! │ NetworkSink │ ────────────▶ │NetworkChannel│ ──────▶ │ NetworkServer │
//! │ (SpillBuffer│               │ writer task  │         │ handler tasks │
//! └─────────────┘               └──────────────┘         └───────┬───────┘
//!                                                                │ ExchangeProtocol
//!                                                        ┌───────▼───────┐
//!                                                        │ NetworkSource │─▶ Dispatcher
//!                                                        │  (Sequencer)  │
//!                                                        └───────────────┘
//! ```
//!
//! A channel announces its [`NesPartition`] first; the server replies once a
//! consumer registered it. Buffers keep their sequence metadata on the wire,
//! so the receiving source restores producer order with a sequencer.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

/// Outgoing channels and the channel registry
pub mod channel;
/// Frame encoding and decoding
pub mod codec;
/// Network and sink configuration
pub mod config;
/// Server-side exchange handshake and delivery
pub mod exchange;
/// Bundles the network components of one node
pub mod manager;
/// Consumer and producer partition bookkeeping
pub mod partition;
/// Addressing and wire messages
pub mod protocol;
/// TCP acceptor and connection handlers
pub mod server;
/// Sink that ships buffers to another node
pub mod sink;
/// Source that receives buffers from another node
pub mod source;

pub use channel::{ChannelRegistry, ChannelState, NetworkChannel, SendOutcome};
pub use codec::{ExchangeCodec, ProtocolError};
pub use config::{NetworkConfig, NetworkConfigBuilder, SinkConfig, SinkConfigBuilder};
pub use exchange::{ExchangeListener, ExchangeProtocol};
pub use manager::NetworkManager;
pub use partition::{PartitionManager, PartitionRegistrationStatus};
pub use protocol::{ErrorKind, Message, MessageHeader, MessageType, NesPartition, NodeLocation};
pub use server::NetworkServer;
pub use sink::{NetworkSink, SpillBuffer};
pub use source::NetworkSource;

/// Result type for nes-network operations
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors from the exchange layer
#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream corruption
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Spill file error
    #[error("Spill error: {0}")]
    Storage(#[from] nes_storage::StorageError),

    /// A consumer for the partition is already registered
    #[error("Partition {0} is already registered")]
    DuplicatePartition(NesPartition),

    /// No consumer registered the partition
    #[error("Partition {0} is not registered")]
    PartitionNotRegistered(NesPartition),

    /// The consumer of the partition has been removed
    #[error("Partition {0} was deleted")]
    PartitionDeleted(NesPartition),

    /// The receiver reported an error
    #[error("Server error on {partition}: {kind}: {message}")]
    Server {
        /// Affected partition
        partition: NesPartition,
        /// Reported kind
        kind: ErrorKind,
        /// Reported detail
        message: String,
    },

    /// The channel lost its connection
    #[error("Channel for {partition} failed: {reason}")]
    ChannelFailed {
        /// Affected partition
        partition: NesPartition,
        /// What happened
        reason: String,
    },

    /// The connection closed during the handshake
    #[error("Handshake for {partition} failed: {reason}")]
    Handshake {
        /// Announced partition
        partition: NesPartition,
        /// What happened
        reason: String,
    },

    /// The sink's spill storage is exhausted
    #[error("Spill buffer for {partition} is full ({capacity} buffers)")]
    SpillFull {
        /// Sink partition
        partition: NesPartition,
        /// Total spill capacity
        capacity: usize,
    },
}
