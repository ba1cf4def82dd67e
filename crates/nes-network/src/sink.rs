//! Sink that ships buffers to the consumer of a partition on another node.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nes_core::buffer::TupleBuffer;
use nes_core::engine::{QueryTerminationType, ReconfigurationMessage, ReconfigurationType};
use nes_core::source::{DataSink, SinkError};
use nes_storage::{SpillReader, SpillWriter};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelRegistry, ChannelState, NetworkChannel, SendOutcome};
use crate::config::SinkConfig;
use crate::protocol::{NesPartition, NodeLocation};
use crate::{NetworkError, Result};

static SPILL_SEGMENTS: AtomicU64 = AtomicU64::new(0);

struct Segment {
    path: PathBuf,
    reader: Option<SpillReader>,
    remaining: usize,
}

/// Bounded FIFO of buffers that could not be sent yet.
///
/// Up to `spill_in_memory` buffers stay in memory; the overflow is appended
/// to spill segments on disk, at most `spill_max_buffers` of them. Once any
/// buffer is on disk, new buffers go to disk too, so `pop_front` always
/// returns the oldest buffer.
///
/// Pooled buffers are copied into unpooled memory before they are held, so
/// a stalled receiver never pins the producer's pool segments.
pub struct SpillBuffer {
    partition: NesPartition,
    memory: VecDeque<TupleBuffer>,
    memory_capacity: usize,
    sealed: VecDeque<Segment>,
    open: Option<(PathBuf, SpillWriter)>,
    on_disk: usize,
    disk_capacity: usize,
    dir: PathBuf,
}

impl SpillBuffer {
    /// Creates an empty spill buffer for `partition`.
    #[must_use]
    pub fn new(partition: NesPartition, config: &SinkConfig) -> Self {
        Self {
            partition,
            memory: VecDeque::new(),
            memory_capacity: config.spill_in_memory,
            sealed: VecDeque::new(),
            open: None,
            on_disk: 0,
            disk_capacity: config.spill_max_buffers,
            dir: config.spill_dir.clone(),
        }
    }

    /// Buffers held in memory and on disk.
    #[must_use]
    pub fn len(&self) -> usize {
        self.memory.len() + self.on_disk
    }

    /// True if nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffers currently on disk.
    #[must_use]
    pub fn on_disk(&self) -> usize {
        self.on_disk
    }

    /// Total number of buffers this spill buffer can hold.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.memory_capacity + self.disk_capacity
    }

    /// Appends `buffer`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::SpillFull`] when both memory and disk are
    /// exhausted, or the I/O error of the spill segment.
    pub fn push_back(&mut self, buffer: &TupleBuffer) -> Result<()> {
        if self.on_disk == 0 && self.memory.len() < self.memory_capacity {
            let held = if buffer.is_pooled() {
                buffer.to_unpooled()
            } else {
                buffer.clone()
            };
            self.memory.push_back(held);
            return Ok(());
        }
        if self.on_disk >= self.disk_capacity {
            return Err(NetworkError::SpillFull {
                partition: self.partition,
                capacity: self.capacity(),
            });
        }
        if self.open.is_none() {
            self.open = Some(self.create_segment()?);
        }
        if let Some((_, writer)) = &mut self.open {
            writer.append(buffer)?;
            self.on_disk += 1;
        }
        Ok(())
    }

    fn create_segment(&self) -> Result<(PathBuf, SpillWriter)> {
        std::fs::create_dir_all(&self.dir)?;
        let id = SPILL_SEGMENTS.fetch_add(1, Ordering::Relaxed);
        let path = self
            .dir
            .join(format!("{}-{}-{id}.spill", self.partition, std::process::id()));
        let writer = SpillWriter::create(&path)?;
        debug!(partition = %self.partition, path = %path.display(), "opened spill segment");
        Ok((path, writer))
    }

    /// Puts `buffer` back at the front after a failed send.
    pub fn push_front(&mut self, buffer: TupleBuffer) {
        self.memory.push_front(buffer);
    }

    /// Removes the oldest buffer.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of a spill segment.
    pub fn pop_front(&mut self) -> Result<Option<TupleBuffer>> {
        if self.memory.is_empty() && self.on_disk > 0 {
            self.refill()?;
        }
        Ok(self.memory.pop_front())
    }

    fn seal(&mut self) -> Result<()> {
        if let Some((path, writer)) = self.open.take() {
            let remaining = usize::try_from(writer.count()).unwrap_or(usize::MAX);
            writer.finish()?;
            self.sealed.push_back(Segment {
                path,
                reader: None,
                remaining,
            });
        }
        Ok(())
    }

    fn refill(&mut self) -> Result<()> {
        if self.sealed.is_empty() {
            self.seal()?;
        }
        let want = self.memory_capacity.max(1);
        while self.memory.len() < want {
            let Some(segment) = self.sealed.front_mut() else {
                break;
            };
            if segment.reader.is_none() {
                segment.reader = Some(SpillReader::open(&segment.path)?);
            }
            let Some(reader) = segment.reader.as_mut() else {
                break;
            };
            match reader.next() {
                Some(buffer) => {
                    self.memory.push_back(buffer?);
                    segment.remaining -= 1;
                    self.on_disk -= 1;
                }
                None => segment.remaining = 0,
            }
            if segment.remaining == 0 {
                if let Some(done) = self.sealed.pop_front() {
                    remove_segment(&done.path);
                }
            }
        }
        Ok(())
    }

    /// Drops every held buffer and deletes the spill segments.
    pub fn clear(&mut self) {
        self.memory.clear();
        if let Some((path, _)) = self.open.take() {
            remove_segment(&path);
        }
        for segment in self.sealed.drain(..) {
            remove_segment(&segment.path);
        }
        self.on_disk = 0;
    }
}

fn remove_segment(path: &std::path::Path) {
    if let Err(err) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %err, "failed to remove spill segment");
    }
}

impl Drop for SpillBuffer {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for SpillBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpillBuffer")
            .field("partition", &self.partition)
            .field("in_memory", &self.memory.len())
            .field("on_disk", &self.on_disk)
            .field("capacity", &self.capacity())
            .finish_non_exhaustive()
    }
}

/// [`DataSink`] writing into a [`NetworkChannel`].
///
/// `Initialize` acquires the channel from the shared [`ChannelRegistry`],
/// an end of stream releases it. While the receiver is unreachable, or its
/// queue is full, buffers wait in a [`SpillBuffer`]; they are sent first
/// once the channel accepts data again. The sink runs on worker threads and
/// drives the async channel through a runtime [`Handle`].
///
/// Without an active channel the sink reconnects in the background, one
/// attempt at a time. After `max_reconnects` failed attempts it rejects
/// every further buffer, which fails the query.
pub struct NetworkSink {
    partition: NesPartition,
    location: NodeLocation,
    registry: Arc<ChannelRegistry>,
    handle: Handle,
    channel: Option<Arc<NetworkChannel>>,
    spill: SpillBuffer,
    reconnect: Option<JoinHandle<Result<Arc<NetworkChannel>>>>,
    failed_reconnects: usize,
    max_reconnects: usize,
    acquired: bool,
    closed: bool,
}

impl NetworkSink {
    /// Creates a sink for `partition` on the receiver at `location`.
    #[must_use]
    pub fn new(
        partition: NesPartition,
        location: NodeLocation,
        registry: Arc<ChannelRegistry>,
        handle: Handle,
        config: &SinkConfig,
    ) -> Self {
        Self {
            partition,
            location,
            registry,
            handle,
            channel: None,
            spill: SpillBuffer::new(partition, config),
            reconnect: None,
            failed_reconnects: 0,
            max_reconnects: config.max_reconnects.max(1),
            acquired: false,
            closed: false,
        }
    }

    /// Partition this sink produces.
    #[must_use]
    pub fn partition(&self) -> NesPartition {
        self.partition
    }

    /// Buffers waiting to be sent.
    #[must_use]
    pub fn spilled(&self) -> usize {
        self.spill.len()
    }

    /// Reconnects to a receiver at `location` and sends the spilled buffers
    /// before any new data.
    ///
    /// # Errors
    ///
    /// Returns the connection error; the spilled buffers are kept.
    pub fn relocate(&mut self, location: NodeLocation) -> Result<()> {
        info!(partition = %self.partition, %location, spilled = self.spill.len(), "relocating sink");
        self.cancel_reconnect();
        self.failed_reconnects = 0;
        self.location = location.clone();
        if !self.acquired {
            self.acquired = true;
            self.channel = Some(self.handle.block_on(self.registry.acquire(self.partition, location))?);
        } else {
            self.channel = Some(self.handle.block_on(self.registry.relocate(self.partition, location))?);
        }
        self.flush_blocking()
    }

    /// Failed background reconnects since the last active channel.
    #[must_use]
    pub fn failed_reconnects(&self) -> usize {
        self.failed_reconnects
    }

    fn has_active_channel(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.state() == ChannelState::Active)
    }

    /// Picks up a channel that another producer of the partition opened.
    fn refresh_channel(&mut self) {
        if self.acquired && !self.has_active_channel() {
            self.channel = self.registry.current(self.partition);
        }
    }

    /// Refreshes the channel and drives the background reconnect.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelFailed`] once the reconnect budget is
    /// spent.
    fn ensure_channel(&mut self) -> Result<()> {
        if self.failed_reconnects >= self.max_reconnects {
            return Err(self.unreachable());
        }
        self.refresh_channel();
        if !self.acquired || self.has_active_channel() {
            self.cancel_reconnect();
            self.failed_reconnects = 0;
            return Ok(());
        }
        match self.reconnect.take() {
            Some(task) if task.is_finished() => {
                let error = match self.handle.block_on(task) {
                    Ok(Ok(channel)) => {
                        info!(partition = %self.partition, location = %self.location, spilled = self.spill.len(), "receiver reachable again");
                        self.channel = Some(channel);
                        self.failed_reconnects = 0;
                        return Ok(());
                    }
                    Ok(Err(err)) => err.to_string(),
                    Err(join) => join.to_string(),
                };
                self.failed_reconnects += 1;
                warn!(
                    partition = %self.partition,
                    location = %self.location,
                    attempt = self.failed_reconnects,
                    budget = self.max_reconnects,
                    error = %error,
                    "reconnect failed"
                );
                if self.failed_reconnects >= self.max_reconnects {
                    return Err(self.unreachable());
                }
            }
            Some(task) => {
                self.reconnect = Some(task);
                return Ok(());
            }
            None => {}
        }
        let registry = Arc::clone(&self.registry);
        let partition = self.partition;
        self.reconnect = Some(self.handle.spawn(async move { registry.channel(partition).await }));
        Ok(())
    }

    fn cancel_reconnect(&mut self) {
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
    }

    fn unreachable(&self) -> NetworkError {
        NetworkError::ChannelFailed {
            partition: self.partition,
            reason: format!(
                "receiver {} unreachable after {} reconnects",
                self.location, self.failed_reconnects
            ),
        }
    }

    /// Sends spilled buffers until the channel pushes back.
    fn drain(&mut self) -> Result<()> {
        let Some(channel) = self.channel.clone() else {
            return Ok(());
        };
        while let Some(buffer) = self.spill.pop_front()? {
            match channel.send_buffer(&buffer) {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::Full | SendOutcome::Closed) => {
                    self.spill.push_front(buffer);
                    break;
                }
                Err(err) => {
                    self.spill.push_front(buffer);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Sends every spilled buffer, waiting for queue space.
    fn flush_blocking(&mut self) -> Result<()> {
        let Some(channel) = self.channel.clone() else {
            if self.spill.is_empty() {
                return Ok(());
            }
            return Err(NetworkError::ChannelFailed {
                partition: self.partition,
                reason: "receiver unreachable".to_string(),
            });
        };
        while let Some(buffer) = self.spill.pop_front()? {
            match self.handle.block_on(channel.send_buffer_wait(&buffer)) {
                Ok(SendOutcome::Sent) => {}
                Ok(_) => {
                    self.spill.push_front(buffer);
                    return Err(NetworkError::ChannelFailed {
                        partition: self.partition,
                        reason: "channel closed while flushing".to_string(),
                    });
                }
                Err(err) => {
                    self.spill.push_front(buffer);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    fn spill(&mut self, buffer: &TupleBuffer) -> bool {
        match self.spill.push_back(buffer) {
            Ok(()) => true,
            Err(err) => {
                error!(partition = %self.partition, error = %err, "cannot hold buffer for unreachable receiver");
                false
            }
        }
    }

    fn finish(&mut self, termination: QueryTerminationType, reason: Option<String>) -> std::result::Result<(), SinkError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.cancel_reconnect();
        let mut outcome = Ok(());
        if termination == QueryTerminationType::Graceful {
            self.refresh_channel();
            if self.acquired && !self.has_active_channel() && !self.spill.is_empty() {
                match self.handle.block_on(self.registry.channel(self.partition)) {
                    Ok(channel) => self.channel = Some(channel),
                    Err(err) => debug!(partition = %self.partition, error = %err, "last reconnect before end of stream failed"),
                }
            }
            if let Err(err) = self.flush_blocking() {
                outcome = Err(SinkError::Reconfigure(format!(
                    "{} buffers for {} undelivered: {err}",
                    self.spill.len(),
                    self.partition
                )));
            }
        }
        if !self.spill.is_empty() {
            warn!(partition = %self.partition, dropped = self.spill.len(), %termination, "dropping spilled buffers");
            self.spill.clear();
        }
        if self.acquired {
            self.acquired = false;
            self.channel = None;
            let released = self
                .handle
                .block_on(self.registry.release(self.partition, termination, reason));
            if let Err(err) = released {
                warn!(partition = %self.partition, error = %err, "channel close failed");
            }
        }
        outcome
    }
}

impl DataSink for NetworkSink {
    fn write_data(&mut self, buffer: &TupleBuffer) -> bool {
        if self.closed {
            return false;
        }
        if let Err(err) = self.ensure_channel() {
            error!(partition = %self.partition, error = %err, spilled = self.spill.len(), "giving up on receiver");
            return false;
        }
        if let Err(err) = self.drain() {
            debug!(partition = %self.partition, error = %err, "channel unavailable, spilling");
        }
        if !self.spill.is_empty() {
            return self.spill(buffer);
        }
        let outcome = match &self.channel {
            Some(channel) => channel.send_buffer(buffer),
            None => Ok(SendOutcome::Closed),
        };
        match outcome {
            Ok(SendOutcome::Sent) => true,
            Ok(SendOutcome::Full | SendOutcome::Closed) => self.spill(buffer),
            Err(err) => {
                debug!(partition = %self.partition, error = %err, "channel failed, spilling");
                self.spill(buffer)
            }
        }
    }

    fn reconfigure(&mut self, message: &ReconfigurationMessage) -> std::result::Result<(), SinkError> {
        match message.kind {
            ReconfigurationType::Initialize => {
                if self.acquired {
                    return Ok(());
                }
                self.acquired = true;
                let acquired = self
                    .handle
                    .block_on(self.registry.acquire(self.partition, self.location.clone()));
                match acquired {
                    Ok(channel) => self.channel = Some(channel),
                    Err(err) => {
                        warn!(partition = %self.partition, location = %self.location, error = %err, "receiver unreachable, spilling while reconnecting");
                    }
                }
                Ok(())
            }
            kind => match kind.termination() {
                Some(termination) => self.finish(termination, message.user_data.clone()),
                None => self.finish(QueryTerminationType::HardStop, None),
            },
        }
    }

    fn close(&mut self, termination: QueryTerminationType) {
        if let Err(err) = self.finish(termination, None) {
            warn!(partition = %self.partition, error = %err, "network sink closed with undelivered data");
        }
    }
}

impl Drop for NetworkSink {
    fn drop(&mut self) {
        self.cancel_reconnect();
    }
}

impl std::fmt::Debug for NetworkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkSink")
            .field("partition", &self.partition)
            .field("location", &self.location)
            .field("spill", &self.spill)
            .field("failed_reconnects", &self.failed_reconnects)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nes_core::buffer::{BufferManager, BufferManagerConfig, BufferProvider};
    use nes_core::ids::{OperatorId, QueryId};

    fn partition() -> NesPartition {
        NesPartition::new(QueryId(5), OperatorId(6), 0, 0)
    }

    fn buffer(seq: u64) -> TupleBuffer {
        let buffer = TupleBuffer::from_vec(seq.to_be_bytes().to_vec());
        buffer.set_sequence_number(seq);
        buffer.set_number_of_tuples(1);
        buffer
    }

    fn config(dir: &tempfile::TempDir, memory: usize, disk: usize) -> SinkConfig {
        SinkConfig::builder()
            .spill_in_memory(memory)
            .spill_max_buffers(disk)
            .spill_dir(dir.path())
            .build()
    }

    fn drain(spill: &mut SpillBuffer) -> Vec<u64> {
        let mut seqs = Vec::new();
        while let Some(buffer) = spill.pop_front().unwrap() {
            seqs.push(buffer.sequence_number());
        }
        seqs
    }

    #[test]
    fn test_spill_keeps_order_across_memory_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillBuffer::new(partition(), &config(&dir, 3, 100));
        for seq in 1..=10 {
            spill.push_back(&buffer(seq)).unwrap();
        }
        assert_eq!(spill.len(), 10);
        assert_eq!(spill.on_disk(), 7);

        // Interleave pops and pushes across the disk boundary.
        let first: Vec<u64> = (0..4)
            .map(|_| spill.pop_front().unwrap().unwrap().sequence_number())
            .collect();
        assert_eq!(first, vec![1, 2, 3, 4]);
        for seq in 11..=12 {
            spill.push_back(&buffer(seq)).unwrap();
        }
        assert_eq!(drain(&mut spill), (5..=12).collect::<Vec<_>>());
        assert!(spill.is_empty());
    }

    #[test]
    fn test_spilled_buffer_keeps_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillBuffer::new(partition(), &config(&dir, 0, 10));
        spill.push_back(&buffer(42)).unwrap();
        let restored = spill.pop_front().unwrap().unwrap();
        assert_eq!(restored.as_slice(), &42u64.to_be_bytes());
        assert_eq!(restored.number_of_tuples(), 1);
    }

    #[test]
    fn test_spill_capacity_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillBuffer::new(partition(), &config(&dir, 2, 2));
        for seq in 1..=4 {
            spill.push_back(&buffer(seq)).unwrap();
        }
        assert!(matches!(
            spill.push_back(&buffer(5)),
            Err(NetworkError::SpillFull { capacity: 4, .. })
        ));
    }

    #[test]
    fn test_held_buffers_do_not_pin_pool_segments() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BufferManager::new(
            BufferManagerConfig::builder().buffer_size(16).num_buffers(4).build(),
        )
        .unwrap();
        let pool = manager.create_fixed_size_buffer_pool(2).unwrap();
        let mut spill = SpillBuffer::new(partition(), &config(&dir, 4, 10));
        for seq in 1..=6 {
            let buffer = pool.get_buffer_no_blocking().unwrap();
            buffer.set_sequence_number(seq);
            spill.push_back(&buffer).unwrap();
        }
        assert_eq!(pool.available_buffers(), 2);
        assert_eq!(spill.on_disk(), 2);
        assert_eq!(drain(&mut spill), (1..=6).collect::<Vec<_>>());
    }

    #[test]
    fn test_push_front_requeues_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillBuffer::new(partition(), &config(&dir, 2, 10));
        for seq in 1..=3 {
            spill.push_back(&buffer(seq)).unwrap();
        }
        let oldest = spill.pop_front().unwrap().unwrap();
        spill.push_front(oldest);
        assert_eq!(drain(&mut spill), vec![1, 2, 3]);
    }

    #[test]
    fn test_clear_removes_segments() {
        let dir = tempfile::tempdir().unwrap();
        let mut spill = SpillBuffer::new(partition(), &config(&dir, 1, 10));
        for seq in 1..=5 {
            spill.push_back(&buffer(seq)).unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        spill.clear();
        assert!(spill.is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
