//! Explicitly owned runtime: buffer manager, dispatcher and worker pool.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use super::dispatcher::Dispatcher;
use super::plan::{ExecutablePlan, OperatorIndex};
use super::query::{ExecutableQuery, QueryStatus};
use super::reconfiguration::QueryTerminationType;
use super::stage::{PipelineContext, PipelineStage};
use super::worker::{WorkerPoolConfig, WorkerThreadPool};
use super::EngineError;
use crate::buffer::{BufferManager, BufferManagerConfig};
use crate::ids::QueryId;
use crate::source::{DataSink, DataSource, SourceConfig, SourceRunner};

/// Configuration of a [`RuntimeContext`].
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Global buffer pool.
    pub buffers: BufferManagerConfig,
    /// Worker threads.
    pub workers: WorkerPoolConfig,
}

impl RuntimeConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::default()
    }
}

/// Builder for [`RuntimeConfig`].
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    buffers: Option<BufferManagerConfig>,
    workers: Option<WorkerPoolConfig>,
}

impl RuntimeConfigBuilder {
    /// Sets the buffer pool configuration.
    #[must_use]
    pub fn buffers(mut self, config: BufferManagerConfig) -> Self {
        self.buffers = Some(config);
        self
    }

    /// Sets the worker pool configuration.
    #[must_use]
    pub fn workers(mut self, config: WorkerPoolConfig) -> Self {
        self.workers = Some(config);
        self
    }

    /// Builds the config.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        RuntimeConfig {
            buffers: self.buffers.unwrap_or_default(),
            workers: self.workers.unwrap_or_default(),
        }
    }
}

/// Everything needed to start one query.
pub struct QueryDeployment {
    query_id: QueryId,
    plan: ExecutablePlan,
    stages: Vec<(OperatorIndex, Arc<dyn PipelineStage>)>,
    sinks: Vec<(OperatorIndex, Box<dyn DataSink>)>,
    sources: Vec<(SourceConfig, Box<dyn DataSource>)>,
}

impl QueryDeployment {
    /// Starts a deployment of `plan`.
    #[must_use]
    pub fn new(query_id: QueryId, plan: ExecutablePlan) -> Self {
        Self {
            query_id,
            plan,
            stages: Vec::new(),
            sinks: Vec::new(),
            sources: Vec::new(),
        }
    }

    /// Binds a stage to a pipeline or window node.
    #[must_use]
    pub fn stage(mut self, index: OperatorIndex, stage: Arc<dyn PipelineStage>) -> Self {
        self.stages.push((index, stage));
        self
    }

    /// Binds a sink to a sink node.
    #[must_use]
    pub fn sink(mut self, index: OperatorIndex, sink: Box<dyn DataSink>) -> Self {
        self.sinks.push((index, sink));
        self
    }

    /// Runs `source` for the source node named in `config`.
    ///
    /// Source nodes without a bound source are fed externally through
    /// [`Dispatcher::add_work`].
    #[must_use]
    pub fn source(mut self, config: SourceConfig, source: Box<dyn DataSource>) -> Self {
        self.sources.push((config, source));
        self
    }
}

impl std::fmt::Debug for QueryDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryDeployment")
            .field("query_id", &self.query_id)
            .field("operators", &self.plan.len())
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

/// One independent runtime instance.
///
/// Owns the buffer manager, the dispatcher and the worker pool; several
/// contexts can live in one process.
pub struct RuntimeContext {
    buffer_manager: Arc<BufferManager>,
    dispatcher: Arc<Dispatcher>,
    pool: Mutex<WorkerThreadPool>,
}

impl RuntimeContext {
    /// Allocates the buffer pool and starts the workers.
    ///
    /// # Errors
    ///
    /// Returns an error for an invalid configuration or if a worker thread
    /// cannot be spawned.
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, EngineError> {
        let buffer_manager = BufferManager::new(config.buffers)?;
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&buffer_manager)));
        let mut pool = WorkerThreadPool::new(config.workers, Arc::clone(&dispatcher))?;
        pool.start()?;
        Ok(Arc::new(Self {
            buffer_manager,
            dispatcher,
            pool: Mutex::new(pool),
        }))
    }

    /// The buffer manager.
    #[must_use]
    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    /// The dispatcher.
    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Sets up stages and sinks, registers the query and starts its sources.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPlan`] for an invalid plan or
    /// binding, [`EngineError::DuplicateRegistration`] if the query is
    /// already registered, and stage, sink or source errors raised while
    /// starting.
    pub fn deploy(&self, deployment: QueryDeployment) -> Result<Arc<ExecutableQuery>, EngineError> {
        let QueryDeployment {
            query_id,
            plan,
            stages,
            sinks,
            sources,
        } = deployment;
        for (config, _) in &sources {
            if plan.source_index(config.source_id).is_none() {
                return Err(EngineError::InvalidPlan(format!(
                    "source {} is not part of the plan",
                    config.source_id
                )));
            }
        }
        let query = Arc::new(ExecutableQuery::new(query_id, plan, stages, sinks)?);
        if let Some(conflict) = self.dispatcher.registration_conflict(&query) {
            warn!(%query_id, %conflict, "deployment rejected");
            return Err(EngineError::DuplicateRegistration(query_id));
        }

        if let Err(e) = self.open_operators(&query) {
            self.dispatcher.abort_unregistered(&query, &e.to_string());
            return Err(e);
        }
        if !self.dispatcher.register_query(Arc::clone(&query)) {
            self.dispatcher.abort_unregistered(&query, "query registration rejected");
            return Err(EngineError::DuplicateRegistration(query_id));
        }
        query.set_running();

        for (config, source) in sources {
            let source_id = config.source_id;
            let dispatcher = Arc::clone(&self.dispatcher);
            let buffer_manager = Arc::clone(&self.buffer_manager);
            let started = self.dispatcher.start_source(source_id, move || {
                SourceRunner::spawn(config, source, dispatcher, buffer_manager)
            });
            match started {
                Ok(true) => {}
                Ok(false) => info!(%query_id, %source_id, "source already running, sharing it"),
                Err(e) => {
                    self.dispatcher.fail_query(query_id, &e.to_string());
                    return Err(e.into());
                }
            }
        }
        info!(%query_id, "query deployed");
        Ok(query)
    }

    fn open_operators(&self, query: &ExecutableQuery) -> Result<(), EngineError> {
        let num_worker_threads = self.pool.lock().num_threads();
        for (operator, stage) in query.stages() {
            let ctx = PipelineContext {
                query_id: query.id(),
                operator,
                num_worker_threads,
                buffer_manager: Arc::clone(&self.buffer_manager),
            };
            stage
                .setup(&ctx)
                .and_then(|()| stage.open(&ctx))
                .map_err(|source| EngineError::Stage {
                    operator: operator.0,
                    source,
                })?;
        }
        query.open_sinks()
    }

    /// Stops query `id` with `termination`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownQuery`] if the query is not registered.
    pub fn stop_query(&self, id: QueryId, termination: QueryTerminationType) -> Result<(), EngineError> {
        if self.dispatcher.stop_query(id, termination) {
            Ok(())
        } else {
            Err(EngineError::UnknownQuery(id))
        }
    }

    /// Waits until query `id` reaches a terminal status.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownQuery`] for an unknown id and
    /// [`EngineError::Timeout`] if the query is still running after
    /// `timeout`.
    pub fn wait_for_query(&self, id: QueryId, timeout: Duration) -> Result<QueryStatus, EngineError> {
        let status = match self.dispatcher.query(id) {
            Some(query) => query.wait_for_termination(timeout),
            None => self
                .dispatcher
                .query_status(id)
                .ok_or(EngineError::UnknownQuery(id))?,
        };
        if status.is_terminal() {
            Ok(status)
        } else {
            Err(EngineError::Timeout(id))
        }
    }

    /// Status of query `id`.
    #[must_use]
    pub fn query_status(&self, id: QueryId) -> Option<QueryStatus> {
        self.dispatcher.query_status(id)
    }

    /// Hard-stops every query and joins the workers.
    pub fn shutdown(&self) {
        let running = self.dispatcher.registered_queries();
        if !running.is_empty() {
            warn!(queries = running.len(), "shutting down with running queries");
        }
        self.dispatcher.shutdown();
        self.pool.lock().stop();
        info!("runtime stopped");
    }
}

impl Drop for RuntimeContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("buffer_manager", &self.buffer_manager)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
