//! # Worker Thread Pool
//!
//! A fixed set of named OS threads pulling tasks from the [`Dispatcher`].
//!
//! ## Task execution
//!
//! - Data tasks run the target stage (or write the target sink). Errors and
//!   panics fail the query instead of killing the thread.
//! - End-of-stream tasks are counted against their target. The last one
//!   waits until no data task for the target is queued or running, then
//!   terminates the stage (or closes the sink) and forwards the end of stream
//!   to the successors.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info};

use super::dispatcher::Dispatcher;
use super::plan::OperatorNode;
use super::reconfiguration::ReconfigurationMessage;
use super::stage::ExecutionContext;
use super::task::{Task, TaskKind};
use super::EngineError;
use crate::ids::WorkerThreadId;

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker threads.
    pub num_threads: usize,
    /// Thread names are `{prefix}-{index}`.
    pub thread_name_prefix: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            num_threads: thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            thread_name_prefix: "nes-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> WorkerPoolConfigBuilder {
        WorkerPoolConfigBuilder::default()
    }
}

/// Builder for [`WorkerPoolConfig`].
#[derive(Debug, Default)]
pub struct WorkerPoolConfigBuilder {
    num_threads: Option<usize>,
    thread_name_prefix: Option<String>,
}

impl WorkerPoolConfigBuilder {
    /// Sets the number of threads.
    #[must_use]
    pub fn num_threads(mut self, n: usize) -> Self {
        self.num_threads = Some(n);
        self
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = Some(prefix.into());
        self
    }

    /// Builds the config.
    #[must_use]
    pub fn build(self) -> WorkerPoolConfig {
        let default = WorkerPoolConfig::default();
        WorkerPoolConfig {
            num_threads: self.num_threads.unwrap_or(default.num_threads),
            thread_name_prefix: self
                .thread_name_prefix
                .unwrap_or(default.thread_name_prefix),
        }
    }
}

/// Fixed pool of worker threads.
pub struct WorkerThreadPool {
    config: WorkerPoolConfig,
    dispatcher: Arc<Dispatcher>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl WorkerThreadPool {
    /// Creates a stopped pool.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if `num_threads` is zero.
    pub fn new(config: WorkerPoolConfig, dispatcher: Arc<Dispatcher>) -> Result<Self, EngineError> {
        if config.num_threads == 0 {
            return Err(EngineError::InvalidConfig(
                "worker pool needs at least one thread".into(),
            ));
        }
        Ok(Self {
            config,
            dispatcher,
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        })
    }

    /// Spawns the worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::AlreadyRunning`] if the pool was started, or
    /// [`EngineError::SpawnFailed`] if a thread could not be spawned.
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyRunning);
        }
        self.dispatcher.set_num_worker_threads(self.config.num_threads);
        for index in 0..self.config.num_threads {
            let dispatcher = Arc::clone(&self.dispatcher);
            let running = Arc::clone(&self.running);
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", self.config.thread_name_prefix))
                .spawn(move || worker_thread_main(&dispatcher, &running, WorkerThreadId(index)));
            match spawned {
                Ok(handle) => self.threads.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(EngineError::SpawnFailed {
                        worker: index,
                        message: e.to_string(),
                    });
                }
            }
        }
        info!(threads = self.config.num_threads, "worker pool started");
        Ok(())
    }

    /// Stops all workers and joins them. Queued tasks stay queued.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        self.dispatcher.wake_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// True between `start` and `stop`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Configured number of threads.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        self.config.num_threads
    }
}

impl Drop for WorkerThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for WorkerThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerThreadPool")
            .field("config", &self.config)
            .field("is_running", &self.is_running())
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

fn worker_thread_main(dispatcher: &Dispatcher, running: &AtomicBool, worker: WorkerThreadId) {
    debug!(%worker, "worker started");
    while let Some(task) = dispatcher.get_work(running) {
        process_task(dispatcher, task, worker);
    }
    debug!(%worker, "worker stopped");
}

/// Executes one task on the calling thread.
pub(crate) fn process_task(dispatcher: &Dispatcher, task: Task, worker: WorkerThreadId) {
    if task.is_data() {
        if let Err(reason) = execute_data(dispatcher, &task, worker) {
            let id = task.query.id();
            dispatcher.completed_work(task, worker);
            error!(query_id = %id, %worker, %reason, "task failed");
            dispatcher.fail_query(id, &reason);
        } else {
            dispatcher.completed_work(task, worker);
        }
    } else {
        handle_end_of_stream(dispatcher, task, worker);
    }
}

fn execute_data(dispatcher: &Dispatcher, task: &Task, worker: WorkerThreadId) -> Result<(), String> {
    let TaskKind::Data(buffer) = &task.kind else {
        return Ok(());
    };
    let query = &task.query;
    if query.is_discarding() || query.is_terminated(task.target) {
        return Ok(());
    }
    match query.plan().node(task.target) {
        Some(OperatorNode::Sink { .. }) => {
            if query.write_to_sink(task.target, buffer) {
                Ok(())
            } else {
                Err(format!("sink at operator {} rejected a buffer", task.target.0))
            }
        }
        Some(OperatorNode::Pipeline { .. } | OperatorNode::Window { .. }) => {
            let Some(stage) = query.stage(task.target) else {
                return Ok(());
            };
            let mut ctx = ExecutionContext::new(
                dispatcher,
                query,
                task.target,
                worker,
                dispatcher.buffer_manager(),
            );
            match catch_unwind(AssertUnwindSafe(|| stage.execute(buffer, &mut ctx))) {
                Ok(Ok(())) => ctx.take_failure().map_or(Ok(()), Err),
                Ok(Err(e)) => Err(format!("stage {} failed: {e}", stage.name())),
                Err(panic) => Err(format!("stage {} panicked: {}", stage.name(), panic_message(&*panic))),
            }
        }
        Some(OperatorNode::Source { .. }) | None => Ok(()),
    }
}

fn handle_end_of_stream(dispatcher: &Dispatcher, mut task: Task, worker: WorkerThreadId) {
    let message = match &task.kind {
        TaskKind::Reconfiguration(message) => message.clone(),
        TaskKind::Data(_) => return,
    };
    let Some(termination) = message.kind.termination() else {
        return;
    };
    let query = Arc::clone(&task.query);
    let target = task.target;

    if !task.counted {
        if !query.upstream_ended(target) {
            return;
        }
        task.counted = true;
    }
    if query.in_flight(target) > 0 {
        dispatcher.requeue(task);
        thread::yield_now();
        return;
    }

    let mut failure = None;
    match query.plan().node(target) {
        Some(OperatorNode::Sink { .. }) => {
            query.close_sink(target, termination, message.user_data.as_deref());
        }
        Some(node @ (OperatorNode::Pipeline { .. } | OperatorNode::Window { .. })) => {
            if !query.mark_terminated(target) {
                return;
            }
            if let Some(stage) = query.stage(target) {
                let mut ctx =
                    ExecutionContext::new(dispatcher, &query, target, worker, dispatcher.buffer_manager());
                failure = match catch_unwind(AssertUnwindSafe(|| stage.terminate(termination, &mut ctx))) {
                    Ok(Ok(())) => ctx.take_failure(),
                    Ok(Err(e)) => Some(format!("stage {} failed to terminate: {e}", stage.name())),
                    Err(panic) => Some(format!(
                        "stage {} panicked on termination: {}",
                        stage.name(),
                        panic_message(&*panic)
                    )),
                };
            }
            let forwarded = node
                .successors()
                .iter()
                .map(|s| {
                    let mut next = ReconfigurationMessage::new(query.id(), message.kind);
                    next.user_data.clone_from(&message.user_data);
                    Task::reconfiguration(Arc::clone(&query), *s, next)
                })
                .collect();
            dispatcher.enqueue(forwarded);
        }
        Some(OperatorNode::Source { .. }) | None => {}
    }

    if let Some(reason) = failure {
        error!(query_id = %query.id(), %worker, %reason, "termination failed");
        dispatcher.fail_query(query.id(), &reason);
    } else if query.status().is_terminal() {
        dispatcher.deregister_query(query.id());
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
