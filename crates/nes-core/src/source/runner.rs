//! The per-source ingestion thread.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::ingestion::{IngestionRateMode, IngestionSchedule, INGESTION_PERIOD};
use super::{DataSource, SourceError};
use crate::buffer::{now_millis, BufferManager, FixedSizeBufferPool, PoolInterrupter};
use crate::engine::{Dispatcher, QueryTerminationType};
use crate::ids::{OperatorId, OriginId};
use crate::sequence::{INITIAL_CHUNK_NUMBER, INITIAL_SEQUENCE_NUMBER};

/// Default number of buffers reserved per source.
const DEFAULT_LOCAL_BUFFERS: usize = 64;

/// Longest uninterrupted sleep while pacing, so stop requests are noticed.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(10);

const RUNNING: u8 = u8::MAX;

/// How a source paces buffer production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringMode {
    /// One buffer per interval; a zero interval never sleeps.
    Frequency(Duration),
    /// A number of buffers per second, produced in 100 ms periods.
    IngestionRate {
        /// Target rate; at least 10.
        buffers_per_second: u64,
        /// Shape of the rate over time.
        mode: IngestionRateMode,
    },
}

impl Default for GatheringMode {
    fn default() -> Self {
        Self::Frequency(Duration::ZERO)
    }
}

/// Configuration of one source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    /// Source operator id.
    pub source_id: OperatorId,
    /// Origin stamped on every buffer.
    pub origin_id: OriginId,
    /// Buffers reserved in the source's local pool.
    pub num_local_buffers: usize,
    /// Pacing.
    pub gathering_mode: GatheringMode,
    /// Stop after this many buffers.
    pub max_buffers: Option<u64>,
}

impl SourceConfig {
    /// Creates a config with default pacing and pool size.
    #[must_use]
    pub fn new(source_id: OperatorId, origin_id: OriginId) -> Self {
        Self {
            source_id,
            origin_id,
            num_local_buffers: DEFAULT_LOCAL_BUFFERS,
            gathering_mode: GatheringMode::default(),
            max_buffers: None,
        }
    }

    /// Creates a builder.
    #[must_use]
    pub fn builder(source_id: OperatorId, origin_id: OriginId) -> SourceConfigBuilder {
        SourceConfigBuilder {
            config: Self::new(source_id, origin_id),
        }
    }
}

/// Builder for [`SourceConfig`].
#[derive(Debug, Clone)]
pub struct SourceConfigBuilder {
    config: SourceConfig,
}

impl SourceConfigBuilder {
    /// Sets the local pool size.
    #[must_use]
    pub fn num_local_buffers(mut self, count: usize) -> Self {
        self.config.num_local_buffers = count;
        self
    }

    /// Sets the pacing.
    #[must_use]
    pub fn gathering_mode(mut self, mode: GatheringMode) -> Self {
        self.config.gathering_mode = mode;
        self
    }

    /// Limits the number of produced buffers.
    #[must_use]
    pub fn max_buffers(mut self, count: u64) -> Self {
        self.config.max_buffers = Some(count);
        self
    }

    /// Builds the config.
    #[must_use]
    pub fn build(self) -> SourceConfig {
        self.config
    }
}

enum Pacer {
    Frequency(Duration),
    Rate {
        schedule: IngestionSchedule,
        period: u64,
        produced_in_period: u64,
        period_start: Instant,
    },
}

impl Pacer {
    fn new(mode: GatheringMode) -> Result<Self, SourceError> {
        Ok(match mode {
            GatheringMode::Frequency(interval) => Self::Frequency(interval),
            GatheringMode::IngestionRate {
                buffers_per_second,
                mode,
            } => Self::Rate {
                schedule: IngestionSchedule::new(buffers_per_second, mode)?,
                period: 0,
                produced_in_period: 0,
                period_start: Instant::now(),
            },
        })
    }

    /// Waits after one produced buffer. Returns early once `stop` is set.
    fn after_buffer(&mut self, stop: &AtomicU8) {
        match self {
            Self::Frequency(interval) => sleep_unless_stopped(*interval, stop),
            Self::Rate {
                schedule,
                period,
                produced_in_period,
                period_start,
            } => {
                *produced_in_period += 1;
                if *produced_in_period < schedule.buffers_in_period(*period) {
                    return;
                }
                let elapsed = period_start.elapsed();
                if elapsed > INGESTION_PERIOD {
                    warn!(period = *period, ?elapsed, "producing buffers took longer than one period");
                } else {
                    sleep_unless_stopped(INGESTION_PERIOD - elapsed, stop);
                }
                *period += 1;
                *produced_in_period = 0;
                *period_start = Instant::now();
            }
        }
    }
}

fn sleep_unless_stopped(duration: Duration, stop: &AtomicU8) {
    let deadline = Instant::now() + duration;
    loop {
        let now = Instant::now();
        if now >= deadline || stop.load(Ordering::Acquire) != RUNNING {
            return;
        }
        thread::sleep((deadline - now).min(STOP_POLL_INTERVAL));
    }
}

struct RunnerContext {
    config: SourceConfig,
    source: Box<dyn DataSource>,
    pool: FixedSizeBufferPool,
    pacer: Pacer,
    dispatcher: Arc<Dispatcher>,
    buffer_manager: Arc<BufferManager>,
    stop: Arc<AtomicU8>,
    produced: Arc<AtomicU64>,
}

/// Drives one [`DataSource`] on a dedicated thread.
///
/// The thread is named `nes-source-{id}`. Dropping the runner requests a
/// hard stop and joins the thread.
pub struct SourceRunner {
    source_id: OperatorId,
    thread: Option<JoinHandle<()>>,
    stop: Arc<AtomicU8>,
    interrupter: PoolInterrupter,
    produced: Arc<AtomicU64>,
}

impl SourceRunner {
    /// Reserves the source's local pool and starts its thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the gathering mode is invalid, the local pool does
    /// not fit, or the thread cannot be spawned.
    pub fn spawn(
        config: SourceConfig,
        source: Box<dyn DataSource>,
        dispatcher: Arc<Dispatcher>,
        buffer_manager: Arc<BufferManager>,
    ) -> Result<Self, SourceError> {
        let source_id = config.source_id;
        let pacer = Pacer::new(config.gathering_mode)?;
        let pool = buffer_manager.create_fixed_size_buffer_pool(config.num_local_buffers)?;
        let interrupter = pool.interrupter();
        let stop = Arc::new(AtomicU8::new(RUNNING));
        let produced = Arc::new(AtomicU64::new(0));

        let ctx = RunnerContext {
            config,
            source,
            pool,
            pacer,
            dispatcher,
            buffer_manager,
            stop: Arc::clone(&stop),
            produced: Arc::clone(&produced),
        };
        let thread = thread::Builder::new()
            .name(format!("nes-source-{}", source_id.get()))
            .spawn(move || source_thread_main(ctx))
            .map_err(|e| SourceError::SpawnFailed {
                source_id,
                message: e.to_string(),
            })?;

        Ok(Self {
            source_id,
            thread: Some(thread),
            stop,
            interrupter,
            produced,
        })
    }

    /// Source operator id.
    #[must_use]
    pub fn source_id(&self) -> OperatorId {
        self.source_id
    }

    /// Buffers handed to the dispatcher so far.
    #[must_use]
    pub fn produced(&self) -> u64 {
        self.produced.load(Ordering::Relaxed)
    }

    /// True while the source thread has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Asks the thread to stop with `termination`. The first request wins.
    ///
    /// A source blocked on its exhausted local pool is woken up, so the stop
    /// does not wait for downstream to release buffers.
    pub fn request_stop(&self, termination: QueryTerminationType) {
        let _ = self.stop.compare_exchange(
            RUNNING,
            termination.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.interrupter.interrupt();
    }

    /// Waits for the thread to exit.
    pub fn join(mut self) {
        self.join_thread();
    }

    fn join_thread(&mut self) {
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                error!(source_id = %self.source_id, "source thread panicked");
            }
        }
    }
}

impl Drop for SourceRunner {
    fn drop(&mut self) {
        self.request_stop(QueryTerminationType::HardStop);
        self.join_thread();
    }
}

impl std::fmt::Debug for SourceRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRunner")
            .field("source_id", &self.source_id)
            .field("produced", &self.produced())
            .field("is_running", &self.is_running())
            .finish_non_exhaustive()
    }
}

fn source_thread_main(mut ctx: RunnerContext) {
    let source_id = ctx.config.source_id;
    info!(%source_id, source = ctx.source.name(), "source started");

    let termination = match ctx.source.open(&ctx.buffer_manager) {
        Ok(()) => run_source(&mut ctx),
        Err(e) => {
            error!(%source_id, error = %e, "failed to open source");
            QueryTerminationType::Failure
        }
    };

    ctx.source.close(termination);
    ctx.pool.destroy();
    ctx.dispatcher.add_end_of_stream(source_id, termination);
    info!(
        %source_id,
        %termination,
        produced = ctx.produced.load(Ordering::Relaxed),
        "source stopped"
    );
}

fn run_source(ctx: &mut RunnerContext) -> QueryTerminationType {
    let source_id = ctx.config.source_id;
    let mut sequence_number = INITIAL_SEQUENCE_NUMBER;
    loop {
        if let Some(requested) = QueryTerminationType::from_u8(ctx.stop.load(Ordering::Acquire)) {
            debug!(%source_id, termination = %requested, "stop requested");
            return requested;
        }
        if ctx
            .config
            .max_buffers
            .is_some_and(|max| ctx.produced.load(Ordering::Relaxed) >= max)
        {
            return QueryTerminationType::Graceful;
        }
        match ctx.source.receive_data(&ctx.pool) {
            Ok(Some(buffer)) => {
                buffer.set_origin_id(ctx.config.origin_id);
                buffer.set_sequence_number(sequence_number);
                buffer.set_chunk_number(INITIAL_CHUNK_NUMBER);
                buffer.set_last_chunk(true);
                if buffer.creation_timestamp_ms() == 0 {
                    buffer.set_creation_timestamp_ms(now_millis());
                }
                sequence_number += 1;
                ctx.produced.fetch_add(1, Ordering::Relaxed);
                ctx.dispatcher.add_work(source_id, buffer);
                ctx.pacer.after_buffer(&ctx.stop);
            }
            Ok(None) => {
                return QueryTerminationType::from_u8(ctx.stop.load(Ordering::Acquire))
                    .unwrap_or(QueryTerminationType::Graceful);
            }
            Err(e) => {
                error!(%source_id, error = %e, "source failed");
                return QueryTerminationType::Failure;
            }
        }
    }
}
