//! # Sources and Sinks
//!
//! Contracts for the I/O layer at both ends of a query, plus the thread that
//! drives a source.
//!
//! ## Architecture
//!
//! ```text
//!  ┌────────────┐  receive_data   ┌──────────────┐  add_work   ┌────────────┐
//!  │ DataSource │ ◀────────────── │ SourceRunner │ ──────────▶ │ Dispatcher │
//!  └────────────┘                 │ nes-source-N │             └─────┬──────┘
//!                                 └──────┬───────┘                   │ tasks
//!                                        │ local pool                ▼
//!                                 ┌──────┴───────┐           ┌──────────────┐
//!                                 │ BufferManager│           │   workers    │──▶ DataSink
//!                                 └──────────────┘           └──────────────┘
//! ```
//!
//! A runner stamps every buffer with its origin and a sequence number
//! starting at 1, then injects an end of stream once the source is exhausted
//! or asked to stop.

mod ingestion;
mod memory;
mod runner;
mod sink;

pub use ingestion::{IngestionRateMode, IngestionSchedule, INGESTION_PERIOD};
pub use memory::{LambdaSource, MemorySource};
pub use runner::{GatheringMode, SourceConfig, SourceConfigBuilder, SourceRunner};
pub use sink::{CollectSink, CollectedBuffers, PrintSink};

use std::sync::Arc;

use crate::buffer::{BufferManager, BufferProvider, TupleBuffer};
use crate::engine::{QueryTerminationType, ReconfigurationMessage};
use crate::ids::OperatorId;

/// Errors raised by sources.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source could not be opened.
    #[error("Failed to open source: {0}")]
    Open(String),

    /// Reading the next buffer failed.
    #[error("Failed to receive data: {0}")]
    Receive(String),

    /// Invalid source configuration.
    #[error("Invalid source configuration: {0}")]
    InvalidConfig(String),

    /// The requested ingestion mode exists but has no rate schedule.
    #[error("Ingestion mode {0} is not yet supported")]
    UnsupportedIngestionMode(IngestionRateMode),

    /// The source thread could not be spawned.
    #[error("Failed to spawn source {source_id}: {message}")]
    SpawnFailed {
        /// Source operator.
        source_id: OperatorId,
        /// Error message
        message: String,
    },

    /// Buffer pool setup failed.
    #[error("Buffer error: {0}")]
    Buffer(#[from] crate::buffer::BufferError),
}

/// Errors raised by sinks.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The sink could not be opened.
    #[error("Failed to open sink: {0}")]
    Open(String),

    /// A reconfiguration could not be applied.
    #[error("Reconfiguration failed: {0}")]
    Reconfigure(String),
}

/// Producer of tuple buffers.
///
/// Called from a single dedicated thread; implementations do not need to be
/// `Sync`.
pub trait DataSource: Send {
    /// Prepares the source.
    ///
    /// # Errors
    ///
    /// An open error ends the source with a failure.
    fn open(&mut self, _buffer_manager: &Arc<BufferManager>) -> Result<(), SourceError> {
        Ok(())
    }

    /// Produces the next buffer, acquiring it from `pool` when needed.
    ///
    /// `Ok(None)` signals end of stream. Sources acquire through
    /// [`BufferProvider::get_buffer_interruptible`] and return `Ok(None)`
    /// when it yields nothing, which happens once a stop was requested.
    ///
    /// # Errors
    ///
    /// A receive error ends the source with a failure.
    fn receive_data(&mut self, pool: &dyn BufferProvider) -> Result<Option<TupleBuffer>, SourceError>;

    /// Releases resources once the source stops.
    fn close(&mut self, _termination: QueryTerminationType) {}

    /// Name used in logs.
    fn name(&self) -> &str {
        "source"
    }
}

/// Consumer of tuple buffers at the end of a query.
pub trait DataSink: Send {
    /// Prepares the sink before the first buffer.
    ///
    /// # Errors
    ///
    /// An open error aborts the deployment.
    fn open(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Consumes one buffer. Returns false if the buffer could not be
    /// accepted, which fails the query.
    fn write_data(&mut self, buffer: &TupleBuffer) -> bool;

    /// Applies a control message (`Initialize` on deploy, an end of stream
    /// on termination).
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Reconfigure`] if the transition failed.
    fn reconfigure(&mut self, _message: &ReconfigurationMessage) -> Result<(), SinkError> {
        Ok(())
    }

    /// Called once after the last buffer.
    fn close(&mut self, _termination: QueryTerminationType) {}
}
