//! A deployed query: plan, stages, sinks and runtime bookkeeping.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use super::plan::{ExecutablePlan, OperatorIndex, OperatorNode};
use super::reconfiguration::{QueryTerminationType, ReconfigurationMessage};
use super::stage::PipelineStage;
use super::EngineError;
use crate::ids::QueryId;
use crate::source::DataSink;

/// Lifecycle state of a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    /// Registered with the dispatcher, sources not yet started.
    Registered,
    /// Sources are producing.
    Running,
    /// All sinks closed after a graceful or hard stop.
    Stopped,
    /// The query failed; carries a human-readable reason.
    Failed(String),
}

impl QueryStatus {
    /// True for `Stopped` and `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed(_))
    }
}

impl fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Processing counters of one query.
#[derive(Debug, Default)]
pub struct QueryStatistics {
    processed_tasks: AtomicU64,
    processed_tuples: AtomicU64,
    processed_buffers: AtomicU64,
    latency_sum_ms: AtomicU64,
    dropped_buffers: AtomicU64,
}

/// Point-in-time copy of [`QueryStatistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStatisticsSnapshot {
    /// Data tasks executed.
    pub processed_tasks: u64,
    /// Tuples in the buffers of executed tasks.
    pub processed_tuples: u64,
    /// Buffers consumed by executed tasks.
    pub processed_buffers: u64,
    /// Sum of buffer age at completion, in milliseconds.
    pub latency_sum_ms: u64,
    /// Buffers that reached the query but could never be processed, such as
    /// out-of-order network buffers still held back at end of stream.
    pub dropped_buffers: u64,
}

impl QueryStatistics {
    pub(crate) fn record(&self, tuples: u64, latency_ms: u64) {
        self.processed_tasks.fetch_add(1, Ordering::Relaxed);
        self.processed_buffers.fetch_add(1, Ordering::Relaxed);
        self.processed_tuples.fetch_add(tuples, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// Counts `buffers` that were lost before processing.
    pub fn record_dropped(&self, buffers: u64) {
        self.dropped_buffers.fetch_add(buffers, Ordering::Relaxed);
    }

    /// Takes a snapshot.
    #[must_use]
    pub fn snapshot(&self) -> QueryStatisticsSnapshot {
        QueryStatisticsSnapshot {
            processed_tasks: self.processed_tasks.load(Ordering::Relaxed),
            processed_tuples: self.processed_tuples.load(Ordering::Relaxed),
            processed_buffers: self.processed_buffers.load(Ordering::Relaxed),
            latency_sum_ms: self.latency_sum_ms.load(Ordering::Relaxed),
            dropped_buffers: self.dropped_buffers.load(Ordering::Relaxed),
        }
    }
}

/// Per-node runtime bookkeeping.
struct NodeState {
    stage: Option<Arc<dyn PipelineStage>>,
    sink: Option<Mutex<Box<dyn DataSink>>>,
    /// Upstream nodes that have not delivered their end of stream yet.
    pending_upstream: AtomicUsize,
    /// Data tasks queued or executing for this node.
    in_flight: AtomicUsize,
    terminated: AtomicBool,
}

/// A query as executed by the runtime.
pub struct ExecutableQuery {
    id: QueryId,
    plan: ExecutablePlan,
    nodes: Vec<NodeState>,
    open_sinks: AtomicUsize,
    discarding: AtomicBool,
    status: Mutex<QueryStatus>,
    status_changed: Condvar,
    stats: QueryStatistics,
}

impl ExecutableQuery {
    /// Binds stages and sinks to the nodes of `plan`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidPlan`] if the plan is invalid or a
    /// pipeline, window or sink node has nothing bound to it.
    pub fn new(
        id: QueryId,
        plan: ExecutablePlan,
        mut stages: Vec<(OperatorIndex, Arc<dyn PipelineStage>)>,
        mut sinks: Vec<(OperatorIndex, Box<dyn DataSink>)>,
    ) -> Result<Self, EngineError> {
        plan.validate()?;
        let mut nodes = Vec::with_capacity(plan.len());
        for (index, node) in plan.iter() {
            let stage = stages
                .iter()
                .position(|(i, _)| *i == index)
                .map(|p| stages.swap_remove(p).1);
            let sink = sinks
                .iter()
                .position(|(i, _)| *i == index)
                .map(|p| sinks.swap_remove(p).1);
            match node {
                OperatorNode::Pipeline { .. } | OperatorNode::Window { .. } if stage.is_none() => {
                    return Err(EngineError::InvalidPlan(format!(
                        "no stage bound to operator {}",
                        index.0
                    )));
                }
                OperatorNode::Sink { .. } if sink.is_none() => {
                    return Err(EngineError::InvalidPlan(format!(
                        "no sink bound to operator {}",
                        index.0
                    )));
                }
                _ => {}
            }
            nodes.push(NodeState {
                stage,
                sink: sink.map(Mutex::new),
                pending_upstream: AtomicUsize::new(plan.predecessors_of(index).len()),
                in_flight: AtomicUsize::new(0),
                terminated: AtomicBool::new(false),
            });
        }
        if !stages.is_empty() || !sinks.is_empty() {
            return Err(EngineError::InvalidPlan(
                "stage or sink bound to an unknown operator".into(),
            ));
        }
        let open_sinks = AtomicUsize::new(plan.sink_ids().len());
        Ok(Self {
            id,
            plan,
            nodes,
            open_sinks,
            discarding: AtomicBool::new(false),
            status: Mutex::new(QueryStatus::Registered),
            status_changed: Condvar::new(),
            stats: QueryStatistics::default(),
        })
    }

    /// Query id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> QueryId {
        self.id
    }

    /// The physical plan.
    #[must_use]
    pub fn plan(&self) -> &ExecutablePlan {
        &self.plan
    }

    /// Processing counters.
    #[must_use]
    pub fn statistics(&self) -> &QueryStatistics {
        &self.stats
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> QueryStatus {
        self.status.lock().clone()
    }

    pub(crate) fn set_running(&self) {
        let mut status = self.status.lock();
        if *status == QueryStatus::Registered {
            *status = QueryStatus::Running;
        }
    }

    /// Blocks until the query reaches a terminal status or `timeout` expires.
    ///
    /// Returns the status observed last.
    pub fn wait_for_termination(&self, timeout: Duration) -> QueryStatus {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock();
        while !status.is_terminal() {
            if self.status_changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }
        status.clone()
    }

    pub(crate) fn stage(&self, index: OperatorIndex) -> Option<&Arc<dyn PipelineStage>> {
        self.nodes.get(index.0)?.stage.as_ref()
    }

    pub(crate) fn stages(&self) -> impl Iterator<Item = (OperatorIndex, &Arc<dyn PipelineStage>)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.stage.as_ref().map(|s| (OperatorIndex(i), s)))
    }

    /// Writes `buffer` into the sink at `index`.
    ///
    /// Returns false only if the sink rejected the buffer; writes to a
    /// closed sink are dropped silently.
    pub(crate) fn write_to_sink(&self, index: OperatorIndex, buffer: &crate::buffer::TupleBuffer) -> bool {
        let Some(node) = self.nodes.get(index.0) else {
            return true;
        };
        let Some(sink) = node.sink.as_ref() else {
            return true;
        };
        if node.terminated.load(Ordering::Acquire) {
            return true;
        }
        let accepted = sink.lock().write_data(buffer);
        if !accepted {
            warn!(query_id = %self.id, sink = index.0, "sink rejected buffer");
        }
        accepted
    }

    /// Opens every sink and delivers `Initialize`.
    pub(crate) fn open_sinks(&self) -> Result<(), EngineError> {
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(sink) = &node.sink {
                let mut sink = sink.lock();
                sink.open().map_err(|e| EngineError::Sink {
                    operator: i,
                    message: e.to_string(),
                })?;
                sink.reconfigure(&ReconfigurationMessage::new(
                    self.id,
                    super::ReconfigurationType::Initialize,
                ))
                .map_err(|e| EngineError::Sink {
                    operator: i,
                    message: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    pub(crate) fn note_enqueued(&self, index: OperatorIndex) {
        if let Some(node) = self.nodes.get(index.0) {
            node.in_flight.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn note_completed(&self, index: OperatorIndex) {
        if let Some(node) = self.nodes.get(index.0) {
            node.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn in_flight(&self, index: OperatorIndex) -> usize {
        self.nodes
            .get(index.0)
            .map_or(0, |n| n.in_flight.load(Ordering::Acquire))
    }

    pub(crate) fn pending_upstream(&self, index: OperatorIndex) -> usize {
        self.nodes
            .get(index.0)
            .map_or(0, |n| n.pending_upstream.load(Ordering::Acquire))
    }

    /// Records one upstream end of stream; true if it was the last one.
    pub(crate) fn upstream_ended(&self, index: OperatorIndex) -> bool {
        self.nodes.get(index.0).is_some_and(|n| {
            n.pending_upstream
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1))
                .is_ok_and(|previous| previous == 1)
        })
    }

    pub(crate) fn is_terminated(&self, index: OperatorIndex) -> bool {
        self.nodes
            .get(index.0)
            .is_some_and(|n| n.terminated.load(Ordering::Acquire))
    }

    /// Marks the node terminated; false if it already was.
    pub(crate) fn mark_terminated(&self, index: OperatorIndex) -> bool {
        self.nodes
            .get(index.0)
            .is_some_and(|n| !n.terminated.swap(true, Ordering::AcqRel))
    }

    /// True once data tasks of this query are dropped instead of executed.
    #[must_use]
    pub fn is_discarding(&self) -> bool {
        self.discarding.load(Ordering::Acquire)
    }

    pub(crate) fn start_discarding(&self) {
        self.discarding.store(true, Ordering::Release);
    }

    /// Closes the sink at `index` with `termination`.
    pub(crate) fn close_sink(
        &self,
        index: OperatorIndex,
        termination: QueryTerminationType,
        reason: Option<&str>,
    ) {
        let Some(node) = self.nodes.get(index.0) else {
            return;
        };
        let Some(sink) = node.sink.as_ref() else {
            return;
        };
        if !self.mark_terminated(index) {
            return;
        }
        {
            let mut sink = sink.lock();
            let mut message = ReconfigurationMessage::new(self.id, termination.end_of_stream());
            if let Some(reason) = reason {
                message = message.with_user_data(reason);
            }
            if let Err(e) = sink.reconfigure(&message) {
                warn!(query_id = %self.id, sink = index.0, error = %e, "sink reconfiguration failed");
            }
            sink.close(termination);
        }
        if self.open_sinks.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish(termination);
        }
    }

    fn finish(&self, termination: QueryTerminationType) {
        let mut status = self.status.lock();
        if !status.is_terminal() {
            *status = if termination == QueryTerminationType::Failure {
                QueryStatus::Failed("terminated with failure".into())
            } else {
                QueryStatus::Stopped
            };
            info!(query_id = %self.id, %termination, "query terminated");
        }
        drop(status);
        self.status_changed.notify_all();
    }

    /// Marks the query failed. Returns false if it already was terminal.
    pub(crate) fn mark_failed(&self, reason: &str) -> bool {
        let mut status = self.status.lock();
        if status.is_terminal() {
            return false;
        }
        error!(query_id = %self.id, reason, "query failed");
        *status = QueryStatus::Failed(reason.to_string());
        drop(status);
        self.status_changed.notify_all();
        true
    }

    /// Sink indices.
    pub(crate) fn sink_indices(&self) -> Vec<OperatorIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.sink.is_some())
            .map(|(i, _)| OperatorIndex(i))
            .collect()
    }
}

impl fmt::Debug for ExecutableQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutableQuery")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}
