use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::worker::process_task;
use super::*;
use crate::buffer::{BufferManager, BufferManagerConfig, TupleBuffer};
use crate::ids::{OperatorId, OriginId, PipelineId, QueryId, WorkerThreadId};
use crate::source::{CollectSink, CollectedBuffers, DataSink};

struct PassThrough {
    executed: AtomicUsize,
}

impl PipelineStage for PassThrough {
    fn execute(&self, buffer: &TupleBuffer, ctx: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        self.executed.fetch_add(1, Ordering::Relaxed);
        ctx.emit(buffer.clone());
        Ok(())
    }
}

struct Failing;

impl PipelineStage for Failing {
    fn execute(&self, _: &TupleBuffer, _: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        Err(StageError::Failed("boom".into()))
    }
}

struct Panicking;

impl PipelineStage for Panicking {
    fn execute(&self, _: &TupleBuffer, _: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        panic!("stage exploded");
    }
}

fn dispatcher() -> Dispatcher {
    let manager = BufferManager::new(BufferManagerConfig::builder().buffer_size(16).num_buffers(8).build())
        .unwrap();
    Dispatcher::new(manager)
}

fn query_with(
    id: u64,
    source: u64,
    stage: Arc<dyn PipelineStage>,
) -> (Arc<ExecutableQuery>, CollectedBuffers) {
    let mut plan = ExecutablePlan::new();
    let src = plan.add_source(OperatorId(source), OriginId(source));
    let pipeline = plan.add_pipeline(PipelineId(id));
    let sink = plan.add_sink(OperatorId(100 + id));
    plan.connect(src, pipeline).unwrap();
    plan.connect(pipeline, sink).unwrap();
    let (collect, handle) = CollectSink::new();
    let query = ExecutableQuery::new(
        QueryId(id),
        plan,
        vec![(pipeline, stage)],
        vec![(sink, Box::new(collect) as Box<dyn DataSink>)],
    )
    .unwrap();
    query.open_sinks().unwrap();
    (Arc::new(query), handle)
}

fn pass_through() -> Arc<PassThrough> {
    Arc::new(PassThrough {
        executed: AtomicUsize::new(0),
    })
}

fn drain(dispatcher: &Dispatcher) {
    let running = AtomicBool::new(true);
    while dispatcher.queued_tasks() > 0 {
        let task = dispatcher.get_work(&running).unwrap();
        process_task(dispatcher, task, WorkerThreadId(0));
    }
}

fn buffer(tuples: u64) -> TupleBuffer {
    let buffer = TupleBuffer::from_vec(vec![0; 16]);
    buffer.set_number_of_tuples(tuples);
    buffer
}

#[test]
fn test_duplicate_registration_rejected() {
    let dispatcher = dispatcher();
    let (query, _) = query_with(1, 1, pass_through());
    assert!(dispatcher.register_query(Arc::clone(&query)));
    assert!(!dispatcher.register_query(Arc::clone(&query)));
    assert_eq!(dispatcher.add_work(OperatorId(1), buffer(1)), 1);
    assert_eq!(dispatcher.queued_tasks(), 1);
}

#[test]
fn test_rejected_registration_leaves_no_mapping() {
    let dispatcher = dispatcher();
    let (first, _) = query_with(1, 1, pass_through());
    assert!(dispatcher.register_query(first));
    // Same query id on a different source must not leave the new source mapped.
    let (second, _) = query_with(1, 2, pass_through());
    assert!(!dispatcher.register_query(second));
    assert_eq!(dispatcher.add_work(OperatorId(2), buffer(1)), 0);
}

#[test]
fn test_shared_source_creates_task_per_query() {
    let dispatcher = dispatcher();
    let (a, _) = query_with(1, 7, pass_through());
    let (b, _) = query_with(2, 7, pass_through());
    assert!(dispatcher.register_query(a));
    assert!(dispatcher.register_query(b));
    assert_eq!(dispatcher.add_work(OperatorId(7), buffer(3)), 2);
    assert_eq!(dispatcher.add_work(OperatorId(8), buffer(3)), 0);
}

#[test]
fn test_get_work_returns_none_when_stopped() {
    let dispatcher = dispatcher();
    let running = AtomicBool::new(false);
    assert!(dispatcher.get_work(&running).is_none());
}

#[test]
fn test_graceful_end_flushes_then_closes() {
    let dispatcher = dispatcher();
    let stage = pass_through();
    let (query, sink) = query_with(1, 1, stage.clone());
    assert!(dispatcher.register_query(Arc::clone(&query)));
    for tuples in 1..=3 {
        dispatcher.add_work(OperatorId(1), buffer(tuples));
    }
    dispatcher.add_end_of_stream(OperatorId(1), QueryTerminationType::Graceful);
    drain(&dispatcher);

    assert_eq!(sink.len(), 3);
    assert_eq!(sink.total_tuples(), 6);
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::Graceful));
    assert_eq!(
        sink.reconfigurations(),
        vec![ReconfigurationType::Initialize, ReconfigurationType::SoftEndOfStream]
    );
    assert_eq!(query.status(), QueryStatus::Stopped);
    assert_eq!(query.statistics().snapshot().processed_tasks, 3);
    // Finished queries are deregistered but their status stays visible.
    assert!(dispatcher.query(QueryId(1)).is_none());
    assert_eq!(dispatcher.query_status(QueryId(1)), Some(QueryStatus::Stopped));
    assert_eq!(stage.executed.load(Ordering::Relaxed), 3);
}

#[test]
fn test_hard_stop_drops_queued_buffers() {
    let dispatcher = dispatcher();
    let stage = pass_through();
    let (query, sink) = query_with(1, 1, stage.clone());
    assert!(dispatcher.register_query(Arc::clone(&query)));
    for _ in 0..5 {
        dispatcher.add_work(OperatorId(1), buffer(1));
    }
    assert!(dispatcher.stop_query(QueryId(1), QueryTerminationType::HardStop));
    assert_eq!(dispatcher.queued_tasks(), 1);
    assert_eq!(dispatcher.add_work(OperatorId(1), buffer(1)), 0);
    drain(&dispatcher);

    assert!(sink.is_empty());
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::HardStop));
    assert_eq!(stage.executed.load(Ordering::Relaxed), 0);
    assert_eq!(query.status(), QueryStatus::Stopped);
}

#[test]
fn test_failing_stage_fails_query() {
    let dispatcher = dispatcher();
    let (query, sink) = query_with(1, 1, Arc::new(Failing));
    assert!(dispatcher.register_query(Arc::clone(&query)));
    dispatcher.add_work(OperatorId(1), buffer(1));
    dispatcher.add_work(OperatorId(1), buffer(1));
    drain(&dispatcher);

    assert!(matches!(query.status(), QueryStatus::Failed(reason) if reason.contains("boom")));
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::Failure));
    assert!(sink.reconfigurations().contains(&ReconfigurationType::FailEndOfStream));
    assert!(dispatcher.query(QueryId(1)).is_none());
}

#[test]
fn test_panicking_stage_fails_query() {
    let dispatcher = dispatcher();
    let (query, sink) = query_with(1, 1, Arc::new(Panicking));
    assert!(dispatcher.register_query(Arc::clone(&query)));
    dispatcher.add_work(OperatorId(1), buffer(1));
    drain(&dispatcher);

    assert!(matches!(query.status(), QueryStatus::Failed(reason) if reason.contains("stage exploded")));
    assert_eq!(sink.wait_closed(Duration::from_secs(1)), Some(QueryTerminationType::Failure));
}

#[test]
fn test_stop_shared_source_ends_only_one_query() {
    let dispatcher = dispatcher();
    let (a, sink_a) = query_with(1, 7, pass_through());
    let (b, sink_b) = query_with(2, 7, pass_through());
    assert!(dispatcher.register_query(Arc::clone(&a)));
    assert!(dispatcher.register_query(Arc::clone(&b)));
    assert!(dispatcher.stop_query(QueryId(1), QueryTerminationType::Graceful));
    drain(&dispatcher);
    assert_eq!(sink_a.closed_with(), Some(QueryTerminationType::Graceful));
    assert_eq!(sink_b.closed_with(), None);

    assert_eq!(dispatcher.add_work(OperatorId(7), buffer(1)), 1);
    drain(&dispatcher);
    assert_eq!(sink_b.len(), 1);
    assert_eq!(b.status(), QueryStatus::Registered);
}

#[test]
fn test_unknown_query_operations() {
    let dispatcher = dispatcher();
    assert!(!dispatcher.stop_query(QueryId(9), QueryTerminationType::Graceful));
    assert!(!dispatcher.deregister_query(QueryId(9)));
    assert!(dispatcher.query_status(QueryId(9)).is_none());
    dispatcher.fail_query(QueryId(9), "nothing");
}
