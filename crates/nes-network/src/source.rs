//! Source fed by buffers that arrive over the exchange.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nes_core::buffer::TupleBuffer;
use nes_core::engine::{Dispatcher, QueryTerminationType};
use nes_core::ids::OperatorId;
use nes_core::sequence::Sequencer;
use tracing::{debug, info, trace, warn};

use crate::exchange::ExchangeListener;
use crate::protocol::NesPartition;

/// Emits received buffers into the [`Dispatcher`] as if they came from the
/// plan source `source_id`.
///
/// Buffers may arrive out of producer order; a [`Sequencer`] holds them back
/// until every predecessor was emitted.
pub struct NetworkSource {
    source_id: OperatorId,
    dispatcher: Arc<Dispatcher>,
    sequencer: Sequencer<TupleBuffer>,
    received: AtomicU64,
    emitted: AtomicU64,
}

impl NetworkSource {
    /// Creates a source emitting as `source_id`.
    #[must_use]
    pub fn new(source_id: OperatorId, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            source_id,
            dispatcher,
            sequencer: Sequencer::new(),
            received: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
        }
    }

    /// Plan source this network source feeds.
    #[must_use]
    pub fn source_id(&self) -> OperatorId {
        self.source_id
    }

    /// Buffers received so far.
    #[must_use]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Buffers handed to the dispatcher so far.
    #[must_use]
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Buffers waiting for a predecessor.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.sequencer.pending()
    }
}

impl ExchangeListener for NetworkSource {
    fn on_data_buffer(&self, partition: NesPartition, buffer: TupleBuffer) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let mut next = self.sequencer.is_next(buffer.sequence_data(), buffer);
        if next.is_none() {
            trace!(%partition, pending = self.sequencer.pending(), "buffer held back");
        }
        while let Some(buffer) = next {
            let data = buffer.sequence_data();
            self.dispatcher.add_work(self.source_id, buffer);
            self.emitted.fetch_add(1, Ordering::Relaxed);
            next = self.sequencer.advance_and_get_next(data);
        }
    }

    fn on_end_of_stream(&self, partition: NesPartition, termination: QueryTerminationType) {
        let pending = self.sequencer.pending();
        if pending > 0 {
            warn!(%partition, pending, %termination, "end of stream with buffers still out of order");
            let dropped = u64::try_from(pending).unwrap_or(u64::MAX);
            self.dispatcher.record_dropped_buffers(self.source_id, dropped);
        }
        info!(
            %partition,
            source_id = %self.source_id,
            received = self.received(),
            %termination,
            "network source ended"
        );
        self.dispatcher.add_end_of_stream(self.source_id, termination);
    }

    fn on_server_error(&self, partition: NesPartition, kind: crate::ErrorKind, message: &str) {
        warn!(%partition, %kind, message, source_id = %self.source_id, "upstream reported an error");
    }

    fn on_channel_error(&self, partition: NesPartition, reason: &str) {
        debug!(%partition, reason, source_id = %self.source_id, "upstream connection lost");
    }
}

impl std::fmt::Debug for NetworkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSource")
            .field("source_id", &self.source_id)
            .field("received", &self.received())
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}
