//! Maps incoming buffers to tasks and hands them to worker threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fxhash::FxHashMap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, error, info, trace, warn};

use super::plan::OperatorIndex;
use super::query::{ExecutableQuery, QueryStatus};
use super::reconfiguration::{QueryTerminationType, ReconfigurationMessage};
use super::stage::ExecutionContext;
use super::task::{Task, TaskKind};
use crate::buffer::{now_millis, BufferManager, TupleBuffer};
use crate::ids::{OperatorId, QueryId, WorkerThreadId};
use crate::source::{SourceError, SourceRunner};

/// How long `get_work` sleeps before re-checking the running flag.
const WAIT_INTERVAL: Duration = Duration::from_millis(100);

type QueryList = SmallVec<[QueryId; 2]>;

#[derive(Default)]
struct SourceEntry {
    queries: QueryList,
    runner: Option<SourceRunner>,
}

#[derive(Default)]
struct Registry {
    queries: FxHashMap<QueryId, Arc<ExecutableQuery>>,
    sources: FxHashMap<OperatorId, SourceEntry>,
    windows: FxHashMap<OperatorId, QueryList>,
    sinks: FxHashMap<OperatorId, QueryList>,
    /// Final status of deregistered queries.
    retired: FxHashMap<QueryId, QueryStatus>,
}

impl Registry {
    fn conflict(&self, query: &ExecutableQuery) -> Option<String> {
        let id = query.id();
        if self.queries.contains_key(&id) {
            return Some(format!("{id} is already registered"));
        }
        let plan = query.plan();
        if let Some(source) = plan
            .source_ids()
            .into_iter()
            .find(|s| self.sources.get(s).is_some_and(|e| e.queries.contains(&id)))
        {
            return Some(format!("{id} is already registered on source {source}"));
        }
        if let Some(window) = plan
            .window_ids()
            .into_iter()
            .find(|w| self.windows.get(w).is_some_and(|q| q.contains(&id)))
        {
            return Some(format!("{id} is already registered on window {window}"));
        }
        plan.sink_ids()
            .into_iter()
            .find(|s| self.sinks.get(s).is_some_and(|q| q.contains(&id)))
            .map(|sink| format!("{id} is already registered on sink {sink}"))
    }

    fn queries_of(&self, source_id: OperatorId) -> Vec<Arc<ExecutableQuery>> {
        self.sources.get(&source_id).map_or_else(Vec::new, |entry| {
            entry
                .queries
                .iter()
                .filter_map(|id| self.queries.get(id).cloned())
                .collect()
        })
    }
}

fn remove_query(map: &mut FxHashMap<OperatorId, QueryList>, key: OperatorId, id: QueryId) {
    if let Some(queries) = map.get_mut(&key) {
        queries.retain(|q| *q != id);
        if queries.is_empty() {
            map.remove(&key);
        }
    }
}

/// Central task queue and query registry of one runtime.
///
/// Sources push buffers with [`Dispatcher::add_work`]; worker threads pull
/// tasks with [`Dispatcher::get_work`]. The queue is FIFO, so an end of
/// stream enqueued after data is seen after that data.
pub struct Dispatcher {
    queue: Mutex<VecDeque<Task>>,
    work_available: Condvar,
    registry: Mutex<Registry>,
    buffer_manager: Arc<BufferManager>,
    num_worker_threads: AtomicUsize,
}

impl Dispatcher {
    /// Creates an empty dispatcher.
    #[must_use]
    pub fn new(buffer_manager: Arc<BufferManager>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            work_available: Condvar::new(),
            registry: Mutex::new(Registry::default()),
            buffer_manager,
            num_worker_threads: AtomicUsize::new(1),
        }
    }

    /// Buffer manager of the runtime.
    #[must_use]
    pub fn buffer_manager(&self) -> &Arc<BufferManager> {
        &self.buffer_manager
    }

    /// Number of worker threads pulling from this dispatcher.
    #[must_use]
    pub fn num_worker_threads(&self) -> usize {
        self.num_worker_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn set_num_worker_threads(&self, n: usize) {
        self.num_worker_threads.store(n.max(1), Ordering::Relaxed);
    }

    /// Registers `query` on all of its sources, windows and sinks.
    ///
    /// Either every mapping is inserted or none is. Returns false and logs an
    /// error if the query is already registered on any of them.
    pub fn register_query(&self, query: Arc<ExecutableQuery>) -> bool {
        let id = query.id();
        let mut registry = self.registry.lock();
        if let Some(conflict) = registry.conflict(&query) {
            error!(query_id = %id, %conflict, "query registration rejected");
            return false;
        }

        let plan = query.plan();
        for source in plan.source_ids() {
            registry.sources.entry(source).or_default().queries.push(id);
        }
        for window in plan.window_ids() {
            registry.windows.entry(window).or_default().push(id);
        }
        for sink in plan.sink_ids() {
            registry.sinks.entry(sink).or_default().push(id);
        }
        registry.retired.remove(&id);
        registry.queries.insert(id, Arc::clone(&query));
        info!(query_id = %id, operators = plan.len(), "query registered");
        true
    }

    /// Why `query` cannot be registered right now, if anything.
    #[must_use]
    pub fn registration_conflict(&self, query: &ExecutableQuery) -> Option<String> {
        self.registry.lock().conflict(query)
    }

    /// Hard-stops the stages and sinks of a query that was set up but never
    /// registered.
    pub(crate) fn abort_unregistered(&self, query: &Arc<ExecutableQuery>, reason: &str) {
        warn!(query_id = %query.id(), reason, "aborting deployment");
        query.start_discarding();
        self.terminate_remaining(query, QueryTerminationType::HardStop, Some(reason));
    }

    /// Starts the runner of `source_id` unless one is already running.
    ///
    /// `spawn` is called with the registry locked, so two queries sharing a
    /// source never start it twice. Returns false if a runner existed.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::InvalidConfig`] if no query is registered on the
    /// source, or the error of `spawn`.
    pub fn start_source<F>(&self, source_id: OperatorId, spawn: F) -> Result<bool, SourceError>
    where
        F: FnOnce() -> Result<SourceRunner, SourceError>,
    {
        let mut registry = self.registry.lock();
        let entry = registry.sources.get_mut(&source_id).ok_or_else(|| {
            SourceError::InvalidConfig(format!("no query is registered on source {source_id}"))
        })?;
        if entry.runner.is_some() {
            return Ok(false);
        }
        entry.runner = Some(spawn()?);
        Ok(true)
    }

    /// Removes every mapping of query `id`.
    ///
    /// Sources left without queries are stopped and joined; anything of the
    /// query that is still open is closed with a hard stop. Returns false if
    /// the query was not registered.
    pub fn deregister_query(&self, id: QueryId) -> bool {
        let (query, runners) = {
            let mut registry = self.registry.lock();
            let Some(query) = registry.queries.remove(&id) else {
                return false;
            };
            let plan = query.plan();
            let mut runners = Vec::new();
            for source in plan.source_ids() {
                let now_unused = registry.sources.get_mut(&source).is_some_and(|entry| {
                    entry.queries.retain(|q| *q != id);
                    entry.queries.is_empty()
                });
                if now_unused {
                    if let Some(entry) = registry.sources.remove(&source) {
                        runners.extend(entry.runner);
                    }
                }
            }
            for window in plan.window_ids() {
                remove_query(&mut registry.windows, window, id);
            }
            for sink in plan.sink_ids() {
                remove_query(&mut registry.sinks, sink, id);
            }
            (query, runners)
        };

        for runner in runners {
            runner.request_stop(QueryTerminationType::HardStop);
            runner.join();
        }

        if !query.status().is_terminal() {
            warn!(query_id = %id, "deregistering a running query, closing it");
            query.start_discarding();
            self.purge(id);
            self.terminate_remaining(&query, QueryTerminationType::HardStop, None);
        }
        self.registry.lock().retired.insert(id, query.status());
        info!(query_id = %id, status = %query.status(), "query deregistered");
        true
    }

    /// Creates one task per consumer of `source_id` in every registered query
    /// and wakes all workers. Returns the number of tasks created.
    pub fn add_work(&self, source_id: OperatorId, buffer: TupleBuffer) -> usize {
        let targets: Vec<(Arc<ExecutableQuery>, OperatorIndex)> = {
            let registry = self.registry.lock();
            let mut targets = Vec::new();
            for query in registry.queries_of(source_id) {
                if query.is_discarding() {
                    continue;
                }
                let Some(index) = query.plan().source_index(source_id) else {
                    continue;
                };
                if query.is_terminated(index) {
                    continue;
                }
                if let Some(node) = query.plan().node(index) {
                    targets.extend(node.successors().iter().map(|s| (Arc::clone(&query), *s)));
                }
            }
            targets
        };
        if targets.is_empty() {
            trace!(%source_id, "no consumer for buffer");
            return 0;
        }
        let tasks: Vec<Task> = targets
            .into_iter()
            .map(|(query, target)| Task::data(query, target, buffer.clone()))
            .collect();
        let created = tasks.len();
        self.enqueue(tasks);
        created
    }

    /// Appends tasks to the queue and wakes all workers.
    pub(crate) fn enqueue(&self, tasks: Vec<Task>) {
        if tasks.is_empty() {
            return;
        }
        self.queue.lock().extend(tasks);
        self.work_available.notify_all();
    }

    /// Puts a task back at the end of the queue.
    pub(crate) fn requeue(&self, task: Task) {
        self.queue.lock().push_back(task);
        self.work_available.notify_one();
    }

    /// Ends `source_id` for every query registered on it.
    ///
    /// A graceful end queues behind all data already queued. A hard stop or
    /// failure first drops the queued data tasks of the affected queries.
    pub fn add_end_of_stream(&self, source_id: OperatorId, termination: QueryTerminationType) {
        let queries = self.registry.lock().queries_of(source_id);
        for query in queries {
            self.end_source_for_query(&query, source_id, termination);
        }
    }

    /// Counts `buffers` lost at `source_id` in the statistics of every query
    /// registered on it.
    pub fn record_dropped_buffers(&self, source_id: OperatorId, buffers: u64) {
        let queries = self.registry.lock().queries_of(source_id);
        for query in queries {
            warn!(query_id = %query.id(), %source_id, buffers, "buffers dropped before processing");
            query.statistics().record_dropped(buffers);
        }
    }

    fn end_source_for_query(
        &self,
        query: &Arc<ExecutableQuery>,
        source_id: OperatorId,
        termination: QueryTerminationType,
    ) {
        let Some(index) = query.plan().source_index(source_id) else {
            return;
        };
        if !query.mark_terminated(index) {
            debug!(query_id = %query.id(), %source_id, "source already ended");
            return;
        }
        if termination != QueryTerminationType::Graceful {
            query.start_discarding();
            self.purge(query.id());
        }
        debug!(query_id = %query.id(), %source_id, %termination, "end of stream");
        let tasks = query
            .plan()
            .node(index)
            .map(|node| {
                node.successors()
                    .iter()
                    .map(|s| {
                        Task::reconfiguration(
                            Arc::clone(query),
                            *s,
                            ReconfigurationMessage::new(query.id(), termination.end_of_stream()),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.enqueue(tasks);
    }

    /// Drops queued data tasks of query `id`.
    fn purge(&self, id: QueryId) -> usize {
        let purged: Vec<Task> = {
            let mut queue = self.queue.lock();
            let (purged, kept): (VecDeque<Task>, VecDeque<Task>) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(|t| t.is_data() && t.query.id() == id);
            *queue = kept;
            purged.into()
        };
        for task in &purged {
            task.query.note_completed(task.target);
        }
        if !purged.is_empty() {
            debug!(query_id = %id, dropped = purged.len(), "dropped queued buffers");
        }
        purged.len()
    }

    /// Blocks until a task is available or `running` turns false.
    ///
    /// The wait wakes up periodically so a flag flipped without a notify is
    /// observed too.
    pub fn get_work(&self, running: &AtomicBool) -> Option<Task> {
        let mut queue = self.queue.lock();
        loop {
            if !running.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            let _ = self.work_available.wait_for(&mut queue, WAIT_INTERVAL);
        }
    }

    /// Wakes every thread blocked in [`Dispatcher::get_work`].
    pub fn wake_all(&self) {
        self.work_available.notify_all();
    }

    /// Records statistics for a finished task and releases its buffer.
    pub fn completed_work(&self, task: Task, worker: WorkerThreadId) {
        if let TaskKind::Data(buffer) = &task.kind {
            if !task.query.is_discarding() {
                let latency = now_millis().saturating_sub(buffer.creation_timestamp_ms());
                task.query
                    .statistics()
                    .record(buffer.number_of_tuples(), latency);
            }
            task.query.note_completed(task.target);
        }
        trace!(%worker, query_id = %task.query.id(), target = task.target.0, "task completed");
    }

    /// Number of queued tasks.
    #[must_use]
    pub fn queued_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// The registered query `id`.
    #[must_use]
    pub fn query(&self, id: QueryId) -> Option<Arc<ExecutableQuery>> {
        self.registry.lock().queries.get(&id).cloned()
    }

    /// Ids of all registered queries.
    #[must_use]
    pub fn registered_queries(&self) -> Vec<QueryId> {
        self.registry.lock().queries.keys().copied().collect()
    }

    /// Status of query `id`, including queries that already finished.
    #[must_use]
    pub fn query_status(&self, id: QueryId) -> Option<QueryStatus> {
        let registry = self.registry.lock();
        registry
            .queries
            .get(&id)
            .map(|q| q.status())
            .or_else(|| registry.retired.get(&id).cloned())
    }

    /// Stops query `id`.
    ///
    /// Graceful stops let queued buffers drain; hard stops drop them; a
    /// failure goes through [`Dispatcher::fail_query`]. Sources shared with
    /// other queries keep running and only end for this query. Returns false
    /// if the query is unknown.
    pub fn stop_query(&self, id: QueryId, termination: QueryTerminationType) -> bool {
        let Some(query) = self.query(id) else {
            return false;
        };
        info!(query_id = %id, %termination, "stopping query");
        match termination {
            QueryTerminationType::Failure => {
                self.fail_query(id, "query stopped with failure");
                return true;
            }
            QueryTerminationType::HardStop => {
                query.start_discarding();
                self.purge(id);
            }
            QueryTerminationType::Graceful => {}
        }

        let mut end_here = Vec::new();
        {
            let mut registry = self.registry.lock();
            for source in query.plan().source_ids() {
                let Some(entry) = registry.sources.get_mut(&source) else {
                    continue;
                };
                match &entry.runner {
                    Some(runner) if entry.queries.len() == 1 => runner.request_stop(termination),
                    Some(_) => {
                        entry.queries.retain(|q| *q != id);
                        end_here.push(source);
                    }
                    None => end_here.push(source),
                }
            }
        }
        for source in end_here {
            self.end_source_for_query(&query, source, termination);
        }
        true
    }

    /// Fails query `id` with `reason`.
    ///
    /// Queued data is dropped, sources are told to stop, stages are
    /// terminated and every sink is closed with
    /// [`QueryTerminationType::Failure`]. Repeated calls are ignored.
    pub fn fail_query(&self, id: QueryId, reason: &str) {
        let Some(query) = self.query(id) else {
            return;
        };
        if !query.mark_failed(reason) {
            return;
        }
        query.start_discarding();
        self.purge(id);
        {
            let registry = self.registry.lock();
            for source in query.plan().source_ids() {
                if let Some(entry) = registry.sources.get(&source) {
                    if let (Some(runner), [only]) = (&entry.runner, entry.queries.as_slice()) {
                        if *only == id {
                            runner.request_stop(QueryTerminationType::Failure);
                        }
                    }
                }
            }
        }
        self.terminate_remaining(&query, QueryTerminationType::Failure, Some(reason));
        self.deregister_query(id);
    }

    /// Terminates every source, stage and sink of `query` not yet terminated.
    fn terminate_remaining(
        &self,
        query: &Arc<ExecutableQuery>,
        termination: QueryTerminationType,
        reason: Option<&str>,
    ) {
        for source in query.plan().source_ids() {
            if let Some(index) = query.plan().source_index(source) {
                query.mark_terminated(index);
            }
        }
        let stages: Vec<_> = query.stages().map(|(i, s)| (i, Arc::clone(s))).collect();
        for (index, stage) in stages {
            if !query.mark_terminated(index) {
                continue;
            }
            let mut ctx = ExecutionContext::new(
                self,
                query,
                index,
                WorkerThreadId(0),
                &self.buffer_manager,
            );
            if let Err(e) = stage.terminate(termination, &mut ctx) {
                warn!(query_id = %query.id(), stage = stage.name(), error = %e, "stage termination failed");
            }
        }
        for sink in query.sink_indices() {
            query.close_sink(sink, termination, reason);
        }
    }

    /// Deregisters every query.
    pub fn shutdown(&self) {
        for id in self.registered_queries() {
            self.deregister_query(id);
        }
        self.queue.lock().clear();
        self.work_available.notify_all();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued_tasks", &self.queued_tasks())
            .field("num_worker_threads", &self.num_worker_threads())
            .finish_non_exhaustive()
    }
}
