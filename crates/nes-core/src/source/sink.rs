//! Built-in sinks.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use super::{DataSink, SinkError};
use crate::buffer::TupleBuffer;
use crate::engine::{QueryTerminationType, ReconfigurationMessage, ReconfigurationType};

#[derive(Debug, Default)]
struct Collected {
    buffers: Vec<TupleBuffer>,
    reconfigurations: Vec<ReconfigurationType>,
    closed: Option<QueryTerminationType>,
}

/// Shared view of what a [`CollectSink`] received.
#[derive(Debug, Clone, Default)]
pub struct CollectedBuffers {
    inner: Arc<(Mutex<Collected>, Condvar)>,
}

impl CollectedBuffers {
    /// Buffers received so far, in arrival order.
    #[must_use]
    pub fn buffers(&self) -> Vec<TupleBuffer> {
        self.inner.0.lock().buffers.clone()
    }

    /// Number of buffers received so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.0.lock().buffers.len()
    }

    /// True if nothing was received.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of `number_of_tuples` over all received buffers.
    #[must_use]
    pub fn total_tuples(&self) -> u64 {
        self.inner
            .0
            .lock()
            .buffers
            .iter()
            .map(TupleBuffer::number_of_tuples)
            .sum()
    }

    /// Reconfigurations delivered to the sink.
    #[must_use]
    pub fn reconfigurations(&self) -> Vec<ReconfigurationType> {
        self.inner.0.lock().reconfigurations.clone()
    }

    /// Termination the sink was closed with.
    #[must_use]
    pub fn closed_with(&self) -> Option<QueryTerminationType> {
        self.inner.0.lock().closed
    }

    /// Blocks until the sink is closed or `timeout` expires.
    pub fn wait_closed(&self, timeout: std::time::Duration) -> Option<QueryTerminationType> {
        let (lock, cond) = &*self.inner;
        let mut collected = lock.lock();
        if collected.closed.is_none() {
            let _ = cond.wait_while_for(&mut collected, |c| c.closed.is_none(), timeout);
        }
        collected.closed
    }
}

/// Keeps every buffer it receives.
#[derive(Debug, Default)]
pub struct CollectSink {
    collected: CollectedBuffers,
    reject_after: Option<usize>,
}

impl CollectSink {
    /// Creates a sink and the handle to inspect it.
    #[must_use]
    pub fn new() -> (Self, CollectedBuffers) {
        let sink = Self::default();
        let handle = sink.collected.clone();
        (sink, handle)
    }

    /// Rejects every buffer after the first `count`.
    #[must_use]
    pub fn reject_after(mut self, count: usize) -> Self {
        self.reject_after = Some(count);
        self
    }
}

impl DataSink for CollectSink {
    fn write_data(&mut self, buffer: &TupleBuffer) -> bool {
        let mut collected = self.collected.inner.0.lock();
        if self.reject_after.is_some_and(|n| collected.buffers.len() >= n) {
            return false;
        }
        collected.buffers.push(buffer.clone());
        true
    }

    fn reconfigure(&mut self, message: &ReconfigurationMessage) -> Result<(), SinkError> {
        self.collected.inner.0.lock().reconfigurations.push(message.kind);
        Ok(())
    }

    fn close(&mut self, termination: QueryTerminationType) {
        let (lock, cond) = &*self.collected.inner;
        lock.lock().closed = Some(termination);
        cond.notify_all();
    }
}

/// Logs a summary of every buffer.
#[derive(Debug, Default)]
pub struct PrintSink {
    written: u64,
}

impl PrintSink {
    /// Creates a print sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataSink for PrintSink {
    fn write_data(&mut self, buffer: &TupleBuffer) -> bool {
        self.written += 1;
        info!(
            origin = %buffer.origin_id(),
            sequence = %buffer.sequence_data(),
            tuples = buffer.number_of_tuples(),
            watermark = buffer.watermark(),
            "sink received buffer"
        );
        true
    }

    fn close(&mut self, termination: QueryTerminationType) {
        info!(written = self.written, %termination, "print sink closed");
    }
}
