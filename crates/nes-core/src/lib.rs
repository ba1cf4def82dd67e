//! # `NebulaStream` Core
//!
//! The single-node execution runtime of `NebulaStream`.
//!
//! This crate provides:
//! - **Buffers**: Pooled, reference-counted tuple buffers with metadata
//! - **Sequencing**: In-order release of out-of-order sequence numbers and
//!   reassembly of records spanning buffer boundaries
//! - **Engine**: Task queue, worker thread pool and query lifecycle
//! - **Sources**: Source threads that feed the engine
//! - **Windows**: Slice-based window state driven by watermarks
//!
//! ## Design Principles
//!
//! 1. **Bounded memory** - Every pipeline buffer comes from a fixed pool
//! 2. **Explicit ownership** - No process globals; a [`RuntimeContext`] owns
//!    the pool, the dispatcher and the workers
//! 3. **Order from sequence numbers** - Workers run buffers in any order;
//!    consumers that need order restore it with a [`Sequencer`](sequence::Sequencer)
//!
//! ## Example
//!
//! ```rust,no_run
//! use nes_core::buffer::BufferManagerConfig;
//! use nes_core::engine::{RuntimeConfig, RuntimeContext};
//!
//! let config = RuntimeConfig::builder()
//!     .buffers(BufferManagerConfig::builder().num_buffers(1024).build())
//!     .build();
//! let runtime = RuntimeContext::new(config)?;
//! runtime.shutdown();
//! # Ok::<(), nes_core::engine::EngineError>(())
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod buffer;
pub mod engine;
pub mod ids;
pub mod sequence;
pub mod source;
pub mod time;
pub mod window;

pub use engine::RuntimeContext;

/// Result type for nes-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for nes-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Buffer errors
    #[error("Buffer error: {0}")]
    Buffer(#[from] buffer::BufferError),

    /// Sequencing errors
    #[error("Sequence error: {0}")]
    Sequence(#[from] sequence::SequenceError),

    /// Engine errors
    #[error("Engine error: {0}")]
    Engine(#[from] engine::EngineError),

    /// Source errors
    #[error("Source error: {0}")]
    Source(#[from] source::SourceError),

    /// Sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] source::SinkError),

    /// Time-related errors
    #[error("Time error: {0}")]
    Time(#[from] time::TimeError),

    /// Window errors
    #[error("Window error: {0}")]
    Window(#[from] window::WindowError),
}
