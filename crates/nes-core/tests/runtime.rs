//! End-to-end tests of the runtime: sources, workers, window stages and
//! sinks wired through a `RuntimeContext`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nes_core::buffer::{BufferManagerConfig, TupleBuffer};
use nes_core::engine::{
    EngineError, ExecutablePlan, ExecutionContext, PipelineStage, QueryDeployment,
    QueryStatus, QueryTerminationType, RuntimeConfig, RuntimeContext, StageError,
    WorkerPoolConfig,
};
use nes_core::ids::{OperatorId, OriginId, PipelineId, QueryId};
use nes_core::source::{
    CollectSink, CollectedBuffers, DataSink, GatheringMode, IngestionRateMode, LambdaSource,
    MemorySource, SinkError, SourceConfig, SourceError,
};
use nes_core::window::{
    read_records, AggregateRecord, CountAccumulator, FixedRecord, KeyedRecord,
    KeyedWindowAggregation, KeyedWindowJoin, JoinRecord, SliceAssigner, SumAccumulator,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn runtime(workers: usize) -> Arc<RuntimeContext> {
    let config = RuntimeConfig::builder()
        .buffers(
            BufferManagerConfig::builder()
                .buffer_size(240)
                .num_buffers(128)
                .build(),
        )
        .workers(WorkerPoolConfig::builder().num_threads(workers).build())
        .build();
    RuntimeContext::new(config).unwrap()
}

fn image(records: impl IntoIterator<Item = KeyedRecord>) -> Vec<u8> {
    let mut bytes = Vec::new();
    for record in records {
        let mut row = [0u8; KeyedRecord::SIZE];
        record.write_to(&mut row);
        bytes.extend_from_slice(&row);
    }
    bytes
}

fn collected<R: FixedRecord>(sink: &CollectedBuffers) -> Vec<R> {
    sink.buffers()
        .iter()
        .flat_map(|b| read_records::<R>(b).unwrap())
        .collect()
}

/// Source -> stage -> sink.
fn linear_query(
    id: u64,
    source: u64,
    stage: Arc<dyn PipelineStage>,
) -> (QueryDeployment, CollectedBuffers) {
    let mut plan = ExecutablePlan::new();
    let src = plan.add_source(OperatorId(source), OriginId(source));
    let window = plan.add_window(OperatorId(50 + id));
    let sink = plan.add_sink(OperatorId(100 + id));
    plan.connect(src, window).unwrap();
    plan.connect(window, sink).unwrap();
    let (collect, handle) = CollectSink::new();
    let deployment = QueryDeployment::new(QueryId(id), plan)
        .stage(window, stage)
        .sink(sink, Box::new(collect));
    (deployment, handle)
}

fn source_config(source: u64) -> SourceConfig {
    SourceConfig::builder(OperatorId(source), OriginId(source))
        .num_local_buffers(8)
        .build()
}

#[test]
fn test_tumbling_count_end_to_end() {
    let runtime = runtime(2);
    let stage = Arc::new(KeyedWindowAggregation::<CountAccumulator>::new(
        SliceAssigner::tumbling(10).unwrap(),
        &[OriginId(1)],
        OriginId(500),
    ));
    let (deployment, sink) = linear_query(1, 1, stage);
    let records = (0..100u64).map(|ts| KeyedRecord {
        timestamp: ts,
        key: ts % 2,
        value: 1,
    });
    let source = MemorySource::new(image(records), KeyedRecord::SIZE).unwrap();
    runtime
        .deploy(deployment.source(source_config(1), Box::new(source)))
        .unwrap();

    assert_eq!(
        runtime.wait_for_query(QueryId(1), TIMEOUT).unwrap(),
        QueryStatus::Stopped
    );
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::Graceful));

    let mut rows: Vec<AggregateRecord> = collected(&sink);
    rows.sort_unstable_by_key(|r| (r.window_start, r.key));
    assert_eq!(rows.len(), 20);
    for (i, row) in rows.iter().enumerate() {
        let start = (i as u64 / 2) * 10;
        assert_eq!((row.window_start, row.window_end), (start, start + 10));
        assert_eq!(row.key, i as u64 % 2);
        assert_eq!(row.value, 5);
    }

    let mut sequence_numbers: Vec<_> = sink
        .buffers()
        .iter()
        .filter(|b| b.is_last_chunk())
        .map(TupleBuffer::sequence_number)
        .collect();
    sequence_numbers.sort_unstable();
    assert_eq!(sequence_numbers, (1..=10).collect::<Vec<_>>());
}

#[test]
fn test_sliding_sum_end_to_end() {
    let runtime = runtime(3);
    let stage = Arc::new(KeyedWindowAggregation::<SumAccumulator>::new(
        SliceAssigner::new(20, 10).unwrap(),
        &[OriginId(1)],
        OriginId(500),
    ));
    let (deployment, sink) = linear_query(1, 1, stage);
    let records = (0..40u64).map(|ts| KeyedRecord {
        timestamp: ts,
        key: 7,
        value: 1,
    });
    let source = MemorySource::new(image(records), KeyedRecord::SIZE)
        .unwrap()
        .wrapping();
    runtime
        .deploy(deployment.source(source_config(1), Box::new(source)))
        .unwrap();
    runtime.wait_for_query(QueryId(1), TIMEOUT).unwrap();

    let mut rows: Vec<AggregateRecord> = collected(&sink);
    rows.sort_unstable_by_key(|r| r.window_start);
    let windows: Vec<_> = rows
        .iter()
        .map(|r| (r.window_start, r.window_end, r.value))
        .collect();
    assert_eq!(windows, vec![(0, 20, 20), (10, 30, 20), (20, 40, 20), (30, 50, 10)]);
}

#[test]
fn test_window_join_end_to_end() {
    let runtime = runtime(2);
    let join = Arc::new(KeyedWindowJoin::new(
        SliceAssigner::tumbling(100).unwrap(),
        &[OriginId(1)],
        &[OriginId(2)],
        OriginId(500),
    ));

    let mut plan = ExecutablePlan::new();
    let left = plan.add_source(OperatorId(1), OriginId(1));
    let right = plan.add_source(OperatorId(2), OriginId(2));
    let window = plan.add_window(OperatorId(10));
    let sink = plan.add_sink(OperatorId(20));
    plan.connect(left, window).unwrap();
    plan.connect(right, window).unwrap();
    plan.connect(window, sink).unwrap();
    let (collect, handle) = CollectSink::new();

    let left_rows = [(5, 1, 10), (15, 2, 20)].map(|(timestamp, key, value)| KeyedRecord {
        timestamp,
        key,
        value,
    });
    let right_rows = [(7, 1, 100), (8, 3, 300)].map(|(timestamp, key, value)| KeyedRecord {
        timestamp,
        key,
        value,
    });
    let deployment = QueryDeployment::new(QueryId(1), plan)
        .stage(window, join)
        .sink(sink, Box::new(collect))
        .source(
            source_config(1),
            Box::new(MemorySource::new(image(left_rows), KeyedRecord::SIZE).unwrap()),
        )
        .source(
            source_config(2),
            Box::new(MemorySource::new(image(right_rows), KeyedRecord::SIZE).unwrap()),
        );
    runtime.deploy(deployment).unwrap();
    runtime.wait_for_query(QueryId(1), TIMEOUT).unwrap();

    let rows: Vec<JoinRecord> = collected(&handle);
    assert_eq!(
        rows,
        vec![JoinRecord {
            window_start: 0,
            window_end: 100,
            key: 1,
            left: 10,
            right: 100,
        }]
    );
}

#[test]
fn test_hard_stop_of_endless_source() {
    let runtime = runtime(2);
    let stage = Arc::new(KeyedWindowAggregation::<CountAccumulator>::new(
        SliceAssigner::tumbling(1_000_000).unwrap(),
        &[OriginId(1)],
        OriginId(500),
    ));
    let (deployment, sink) = linear_query(1, 1, stage);
    let next = AtomicU64::new(0);
    let source = LambdaSource::new(move |buffer: &mut TupleBuffer| {
        let record = KeyedRecord {
            timestamp: next.fetch_add(1, Ordering::Relaxed),
            key: 0,
            value: 1,
        };
        let out = buffer.as_mut_slice()?;
        record.write_to(&mut out[..KeyedRecord::SIZE]);
        Some(1)
    });
    let config = SourceConfig::builder(OperatorId(1), OriginId(1))
        .num_local_buffers(8)
        .gathering_mode(GatheringMode::Frequency(Duration::from_millis(1)))
        .build();
    runtime
        .deploy(deployment.source(config, Box::new(source)))
        .unwrap();
    std::thread::sleep(Duration::from_millis(50));

    runtime
        .stop_query(QueryId(1), QueryTerminationType::HardStop)
        .unwrap();
    assert_eq!(
        runtime.wait_for_query(QueryId(1), TIMEOUT).unwrap(),
        QueryStatus::Stopped
    );
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::HardStop));
    // Open windows are dropped, not flushed.
    assert!(sink.is_empty());
}

#[test]
fn test_hard_stop_while_sink_retains_every_buffer() {
    let runtime = runtime(2);
    let mut plan = ExecutablePlan::new();
    let src = plan.add_source(OperatorId(1), OriginId(1));
    let out = plan.add_sink(OperatorId(100));
    plan.connect(src, out).unwrap();
    let (collect, sink) = CollectSink::new();
    let source = LambdaSource::new(|buffer: &mut TupleBuffer| {
        buffer.as_mut_slice()?[0] = 1;
        Some(1)
    });
    let config = SourceConfig::builder(OperatorId(1), OriginId(1))
        .num_local_buffers(4)
        .build();
    runtime
        .deploy(
            QueryDeployment::new(QueryId(1), plan)
                .sink(out, Box::new(collect))
                .source(config, Box::new(source)),
        )
        .unwrap();
    std::thread::sleep(Duration::from_millis(300));
    // The sink holds every pooled buffer, so the source is stuck acquiring.
    assert_eq!(sink.len(), 4);

    runtime
        .stop_query(QueryId(1), QueryTerminationType::HardStop)
        .unwrap();
    assert_eq!(
        runtime.wait_for_query(QueryId(1), Duration::from_secs(3)).unwrap(),
        QueryStatus::Stopped
    );
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::HardStop));
    runtime.shutdown();
}

struct FailingOpen;

impl DataSink for FailingOpen {
    fn open(&mut self) -> Result<(), SinkError> {
        Err(SinkError::Open("no route".into()))
    }

    fn write_data(&mut self, _: &TupleBuffer) -> bool {
        true
    }
}

#[test]
fn test_failed_deployment_closes_opened_sinks() {
    let runtime = runtime(1);
    let mut plan = ExecutablePlan::new();
    let src = plan.add_source(OperatorId(1), OriginId(1));
    let healthy = plan.add_sink(OperatorId(100));
    let broken = plan.add_sink(OperatorId(101));
    plan.connect(src, healthy).unwrap();
    plan.connect(src, broken).unwrap();
    let (collect, sink) = CollectSink::new();
    let deployment = QueryDeployment::new(QueryId(1), plan)
        .sink(healthy, Box::new(collect))
        .sink(broken, Box::new(FailingOpen));

    assert!(matches!(runtime.deploy(deployment), Err(EngineError::Sink { .. })));
    assert_eq!(sink.closed_with(), Some(QueryTerminationType::HardStop));
    assert!(runtime.query_status(QueryId(1)).is_none());
}

#[test]
fn test_duplicate_deployment_rejected() {
    let runtime = runtime(1);
    let stage = |id| {
        Arc::new(KeyedWindowAggregation::<CountAccumulator>::new(
            SliceAssigner::tumbling(10).unwrap(),
            &[OriginId(1)],
            OriginId(id),
        ))
    };
    let (first, _sink) = linear_query(1, 1, stage(500));
    runtime.deploy(first).unwrap();
    let (second, rejected) = linear_query(1, 1, stage(501));
    assert!(matches!(
        runtime.deploy(second),
        Err(EngineError::DuplicateRegistration(QueryId(1)))
    ));
    // The rejected deployment never opened its sink.
    assert!(rejected.reconfigurations().is_empty());
    runtime
        .stop_query(QueryId(1), QueryTerminationType::Graceful)
        .unwrap();
    runtime.wait_for_query(QueryId(1), TIMEOUT).unwrap();
}

struct Exploding;

impl PipelineStage for Exploding {
    fn execute(&self, _: &TupleBuffer, _: &mut ExecutionContext<'_>) -> Result<(), StageError> {
        Err(StageError::Failed("corrupt input".into()))
    }
}

#[test]
fn test_failing_stage_fails_query() {
    let runtime = runtime(2);
    let (deployment, sink) = linear_query(1, 1, Arc::new(Exploding));
    let source = MemorySource::new(vec![0u8; 48], KeyedRecord::SIZE).unwrap();
    runtime
        .deploy(deployment.source(source_config(1), Box::new(source)))
        .unwrap();

    let status = runtime.wait_for_query(QueryId(1), TIMEOUT).unwrap();
    assert!(matches!(status, QueryStatus::Failed(reason) if reason.contains("corrupt input")));
    assert_eq!(sink.wait_closed(TIMEOUT), Some(QueryTerminationType::Failure));
}

#[test]
fn test_unsupported_ingestion_mode_rejected() {
    let runtime = runtime(1);
    let stage = Arc::new(Exploding);
    let (deployment, _) = linear_query(1, 1, stage);
    let config = SourceConfig::builder(OperatorId(1), OriginId(1))
        .gathering_mode(GatheringMode::IngestionRate {
            buffers_per_second: 100,
            mode: IngestionRateMode::Sinus,
        })
        .build();
    let source = MemorySource::new(vec![0u8; 24], KeyedRecord::SIZE).unwrap();
    let result = runtime.deploy(deployment.source(config, Box::new(source)));
    assert!(matches!(
        result,
        Err(EngineError::Source(SourceError::UnsupportedIngestionMode(
            IngestionRateMode::Sinus
        )))
    ));
    assert!(matches!(
        runtime.query_status(QueryId(1)),
        Some(QueryStatus::Failed(_))
    ));
}

#[test]
fn test_independent_runtimes() {
    let first = runtime(1);
    let second = runtime(1);
    for runtime in [&first, &second] {
        let stage = Arc::new(KeyedWindowAggregation::<CountAccumulator>::new(
            SliceAssigner::tumbling(10).unwrap(),
            &[OriginId(1)],
            OriginId(500),
        ));
        let (deployment, _) = linear_query(1, 1, stage);
        let records = (0..5u64).map(|ts| KeyedRecord {
            timestamp: ts,
            key: 0,
            value: 1,
        });
        let source = MemorySource::new(image(records), KeyedRecord::SIZE).unwrap();
        runtime
            .deploy(deployment.source(source_config(1), Box::new(source)))
            .unwrap();
    }
    assert_eq!(first.wait_for_query(QueryId(1), TIMEOUT).unwrap(), QueryStatus::Stopped);
    assert_eq!(second.wait_for_query(QueryId(1), TIMEOUT).unwrap(), QueryStatus::Stopped);
    first.shutdown();
    second.shutdown();
}
