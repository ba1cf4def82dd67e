//! Contract between the runtime and compiled pipeline stages.

use std::sync::Arc;

use super::dispatcher::Dispatcher;
use super::plan::{OperatorIndex, OperatorNode};
use super::query::ExecutableQuery;
use super::reconfiguration::QueryTerminationType;
use super::task::Task;
use crate::buffer::{BufferError, BufferManager, TupleBuffer};
use crate::ids::{QueryId, WorkerThreadId};
use crate::time::TimeError;
use crate::window::WindowError;

/// Errors raised by a pipeline stage.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Generic execution failure.
    #[error("Stage execution failed: {0}")]
    Failed(String),

    /// Buffer handling failed.
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Window state handling failed.
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Watermark handling failed.
    #[error("Time error: {0}")]
    Time(#[from] TimeError),
}

/// Static information handed to a stage before execution starts.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    /// Query the stage belongs to.
    pub query_id: QueryId,
    /// Position of the stage in the plan.
    pub operator: OperatorIndex,
    /// Number of worker threads that may call `execute` concurrently.
    pub num_worker_threads: usize,
    /// Buffer manager of the runtime.
    pub buffer_manager: Arc<BufferManager>,
}

/// A compiled or interpreted unit executed per buffer.
///
/// `execute` is called concurrently from several worker threads; per-thread
/// state should be partitioned by [`ExecutionContext::worker_thread_id`].
pub trait PipelineStage: Send + Sync {
    /// Called once at deployment.
    ///
    /// # Errors
    ///
    /// A setup error aborts the deployment.
    fn setup(&self, _ctx: &PipelineContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Called once after setup, right before sources start.
    ///
    /// # Errors
    ///
    /// An open error aborts the deployment.
    fn open(&self, _ctx: &PipelineContext) -> Result<(), StageError> {
        Ok(())
    }

    /// Processes one input buffer.
    ///
    /// # Errors
    ///
    /// An error fails the whole query.
    fn execute(&self, buffer: &TupleBuffer, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError>;

    /// Called once after every upstream operator has ended.
    ///
    /// On a graceful termination the stage may still emit final results.
    ///
    /// # Errors
    ///
    /// An error fails the whole query.
    fn terminate(
        &self,
        _termination: QueryTerminationType,
        _ctx: &mut ExecutionContext<'_>,
    ) -> Result<(), StageError> {
        Ok(())
    }

    /// Name used in logs.
    fn name(&self) -> &str {
        "stage"
    }
}

/// Per-invocation handle a stage uses to allocate and emit buffers.
pub struct ExecutionContext<'a> {
    dispatcher: &'a Dispatcher,
    query: &'a Arc<ExecutableQuery>,
    node: OperatorIndex,
    worker: WorkerThreadId,
    buffer_manager: &'a Arc<BufferManager>,
    emitted: usize,
    failure: Option<String>,
}

impl<'a> ExecutionContext<'a> {
    pub(crate) fn new(
        dispatcher: &'a Dispatcher,
        query: &'a Arc<ExecutableQuery>,
        node: OperatorIndex,
        worker: WorkerThreadId,
        buffer_manager: &'a Arc<BufferManager>,
    ) -> Self {
        Self {
            dispatcher,
            query,
            node,
            worker,
            buffer_manager,
            emitted: 0,
            failure: None,
        }
    }

    /// Worker thread executing the stage.
    #[inline]
    #[must_use]
    pub fn worker_thread_id(&self) -> WorkerThreadId {
        self.worker
    }

    /// Number of worker threads in the pool.
    #[must_use]
    pub fn num_worker_threads(&self) -> usize {
        self.dispatcher.num_worker_threads()
    }

    /// Query being executed.
    #[must_use]
    pub fn query_id(&self) -> QueryId {
        self.query.id()
    }

    /// Operator being executed.
    #[must_use]
    pub fn operator(&self) -> OperatorIndex {
        self.node
    }

    /// Acquires an output buffer, blocking while the pool is exhausted.
    #[must_use]
    pub fn allocate_buffer(&self) -> TupleBuffer {
        self.buffer_manager.get_buffer_blocking()
    }

    /// The runtime's buffer manager.
    #[must_use]
    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        self.buffer_manager
    }

    /// Number of buffers emitted through this context.
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    /// Hands `buffer` to every successor of the current operator.
    ///
    /// Local stages receive a new task; sinks are written directly. A sink
    /// rejecting the buffer fails the query after the stage returns.
    pub fn emit(&mut self, buffer: TupleBuffer) {
        self.emitted += 1;
        let Some(node) = self.query.plan().node(self.node) else {
            return;
        };
        let mut tasks = Vec::new();
        let mut rejected = None;
        for successor in node.successors() {
            match self.query.plan().node(*successor) {
                Some(OperatorNode::Sink { .. }) => {
                    if !self.query.write_to_sink(*successor, &buffer) {
                        rejected = Some(*successor);
                    }
                }
                Some(OperatorNode::Pipeline { .. } | OperatorNode::Window { .. }) => {
                    tasks.push(Task::data(self.query.clone(), *successor, buffer.clone()));
                }
                Some(OperatorNode::Source { .. }) | None => {}
            }
        }
        if !tasks.is_empty() {
            self.dispatcher.enqueue(tasks);
        }
        if let Some(sink) = rejected {
            self.failure
                .get_or_insert_with(|| format!("sink at operator {} rejected a buffer", sink.0));
        }
    }

    /// Failure recorded while emitting; the worker fails the query with it
    /// once the stage returns.
    pub(crate) fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }
}

impl std::fmt::Debug for ExecutionContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("query", &self.query.id())
            .field("node", &self.node)
            .field("worker", &self.worker)
            .field("emitted", &self.emitted)
            .finish_non_exhaustive()
    }
}
