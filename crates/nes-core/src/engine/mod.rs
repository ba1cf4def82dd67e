//! # Query Execution Engine
//!
//! Turns buffers arriving from sources into tasks and runs them on a fixed
//! pool of worker threads.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────── RuntimeContext ─────────────────────────────┐
//! │                                                                         │
//! │  SourceRunner ──add_work──▶ ┌────────────────────┐                      │
//! │  SourceRunner ──add_work──▶ │     Dispatcher     │  registry:           │
//! │  NetworkSource ─add_work──▶ │  FIFO task queue   │  source → queries    │
//! │                             │  Mutex + Condvar   │  window → queries    │
//! │                             └─────────┬──────────┘  sink   → queries    │
//! │                                       │ get_work                        │
//! │                  ┌────────────────────┼────────────────────┐            │
//! │                  ▼                    ▼                    ▼            │
//! │            nes-worker-0         nes-worker-1         nes-worker-N       │
//! │            stage.execute        stage.execute        stage.execute      │
//! │                  │ emit                                                 │
//! │                  ├──▶ successor stage (new task)                        │
//! │                  └──▶ sink.write_data                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Termination
//!
//! Every source ends with an end-of-stream reconfiguration that travels the
//! plan behind the data. A stage is terminated once all of its inputs ended
//! and none of its data tasks is pending; the query is done when its last
//! sink closed. Hard stops and failures drop queued data first.

mod context;
mod dispatcher;
mod plan;
mod query;
mod reconfiguration;
mod stage;
mod task;
mod worker;

pub use context::{QueryDeployment, RuntimeConfig, RuntimeConfigBuilder, RuntimeContext};
pub use dispatcher::Dispatcher;
pub use plan::{ExecutablePlan, OperatorIndex, OperatorNode, Successors};
pub use query::{ExecutableQuery, QueryStatistics, QueryStatisticsSnapshot, QueryStatus};
pub use reconfiguration::{QueryTerminationType, ReconfigurationMessage, ReconfigurationType};
pub use stage::{ExecutionContext, PipelineContext, PipelineStage, StageError};
pub use task::{Task, TaskKind};
pub use worker::{WorkerPoolConfig, WorkerPoolConfigBuilder, WorkerThreadPool};

use crate::ids::QueryId;

/// Errors from the execution engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The physical plan is malformed.
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// Invalid engine configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The query is already registered.
    #[error("Query {0} is already registered")]
    DuplicateRegistration(QueryId),

    /// No query with this id is registered.
    #[error("Unknown query {0}")]
    UnknownQuery(QueryId),

    /// The query did not terminate in time.
    #[error("Timed out waiting for query {0}")]
    Timeout(QueryId),

    /// A stage failed during setup or open.
    #[error("Stage at operator {operator} failed: {source}")]
    Stage {
        /// Plan index of the stage.
        operator: usize,
        /// The underlying stage error.
        #[source]
        source: StageError,
    },

    /// A sink failed to open.
    #[error("Sink at operator {operator} failed: {message}")]
    Sink {
        /// Plan index of the sink.
        operator: usize,
        /// Error message
        message: String,
    },

    /// A worker thread could not be spawned.
    #[error("Failed to spawn worker {worker}: {message}")]
    SpawnFailed {
        /// Worker index.
        worker: usize,
        /// Error message
        message: String,
    },

    /// The worker pool was already started.
    #[error("Worker pool is already running")]
    AlreadyRunning,

    /// Source setup failed.
    #[error("Source error: {0}")]
    Source(#[from] crate::source::SourceError),

    /// Buffer pool setup failed.
    #[error("Buffer error: {0}")]
    Buffer(#[from] crate::buffer::BufferError),
}

#[cfg(test)]
mod tests;
