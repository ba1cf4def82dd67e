//! Outgoing channels and the registry that shares them between producers.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use fxhash::FxHashMap;
use nes_core::buffer::TupleBuffer;
use nes_core::engine::QueryTerminationType;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_retry2::strategy::{jitter, ExponentialBackoff};
use tokio_retry2::{Retry, RetryError};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{ExchangeCodec, ProtocolError};
use crate::config::NetworkConfig;
use crate::partition::PartitionManager;
use crate::protocol::{ErrorKind, Message, NesPartition, NodeLocation};
use crate::{NetworkError, Result};

type Connection = Framed<TcpStream, ExchangeCodec>;

/// Lifecycle of an outgoing partition.
///
/// `Uninitialized → Connecting → Active → {GracefulEnd | HardEnd | Failed} → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Not yet connecting.
    Uninitialized = 0,
    /// Connecting and announcing.
    Connecting = 1,
    /// Accepting buffers.
    Active = 2,
    /// Flushing queued buffers before a graceful end.
    GracefulEnd = 3,
    /// Dropping queued buffers before a hard end.
    HardEnd = 4,
    /// Ended by a failure, or the connection broke.
    Failed = 5,
    /// The end of stream was sent and the connection is gone.
    Closed = 6,
}

impl ChannelState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Uninitialized,
            1 => Self::Connecting,
            2 => Self::Active,
            3 => Self::GracefulEnd,
            4 => Self::HardEnd,
            5 => Self::Failed,
            _ => Self::Closed,
        }
    }

    const fn ending(termination: QueryTerminationType) -> Self {
        match termination {
            QueryTerminationType::Graceful => Self::GracefulEnd,
            QueryTerminationType::HardStop => Self::HardEnd,
            QueryTerminationType::Failure => Self::Failed,
        }
    }
}

/// Result of [`NetworkChannel::send_buffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for the writer.
    Sent,
    /// The outbound queue is full; retry later.
    Full,
    /// The channel is closing or closed.
    Closed,
}

enum ChannelCommand {
    Data(TupleBuffer),
    Close {
        termination: QueryTerminationType,
        reason: Option<String>,
        done: oneshot::Sender<()>,
    },
}

struct Shared {
    state: AtomicU8,
    discard: AtomicBool,
}

impl Shared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Marks a broken connection unless the channel already closed.
    fn fail(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ChannelState::Closed as u8).then_some(ChannelState::Failed as u8)
            });
    }
}

/// One outgoing connection for one partition.
///
/// Buffers are queued into a bounded queue and written by a dedicated task,
/// so `send_buffer` never blocks the calling worker.
pub struct NetworkChannel {
    partition: NesPartition,
    location: NodeLocation,
    shared: Arc<Shared>,
    commands: mpsc::Sender<ChannelCommand>,
    cancel: CancellationToken,
}

impl NetworkChannel {
    /// Connects to `location` and announces `partition`.
    ///
    /// Transient failures (refused connections, a consumer that has not
    /// registered yet) are retried with exponential backoff from 2 ms up to
    /// 500 ms with jitter, at most `max_connect_retries` times.
    ///
    /// # Errors
    ///
    /// Returns the last error once the retries are exhausted, or immediately
    /// if the receiver deleted the partition or spoke a foreign protocol.
    pub async fn connect(
        partition: NesPartition,
        location: NodeLocation,
        config: &NetworkConfig,
    ) -> Result<Arc<Self>> {
        let shared = Arc::new(Shared {
            state: AtomicU8::new(ChannelState::Uninitialized as u8),
            discard: AtomicBool::new(false),
        });
        shared.set(ChannelState::Connecting);

        let address = location.socket_addr();
        let max_frame_size = config.max_frame_size;
        let retry = ExponentialBackoff::from_millis(2)
            .max_delay_millis(500)
            .map(jitter)
            .take(config.max_connect_retries);
        let connection = Retry::spawn(retry, || connect_once(partition, &address, max_frame_size))
            .await
            .inspect_err(|err| warn!(%partition, %location, error = %err, "giving up on channel"))?;

        let (sink, stream) = connection.split();
        let (commands, queue) = mpsc::channel(config.sender_queue_size.max(1));
        let cancel = CancellationToken::new();
        shared.set(ChannelState::Active);
        tokio::spawn(run_writer(
            partition,
            sink,
            stream,
            queue,
            Arc::clone(&shared),
            cancel.clone(),
        ));
        info!(%partition, %location, "channel active");

        Ok(Arc::new(Self {
            partition,
            location,
            shared,
            commands,
            cancel,
        }))
    }

    /// Partition this channel produces.
    #[must_use]
    pub fn partition(&self) -> NesPartition {
        self.partition
    }

    /// Receiver of this channel.
    #[must_use]
    pub fn location(&self) -> &NodeLocation {
        &self.location
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    /// Queues `buffer` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelFailed`] if the connection broke.
    pub fn send_buffer(&self, buffer: &TupleBuffer) -> Result<SendOutcome> {
        match self.state() {
            ChannelState::Active => {}
            ChannelState::Failed => return Err(self.failed("connection lost")),
            ChannelState::Uninitialized | ChannelState::Connecting => return Ok(SendOutcome::Full),
            ChannelState::GracefulEnd | ChannelState::HardEnd | ChannelState::Closed => {
                return Ok(SendOutcome::Closed)
            }
        }
        match self.commands.try_send(ChannelCommand::Data(buffer.clone())) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(SendOutcome::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.failed("writer stopped")),
        }
    }

    /// Queues `buffer`, waiting for room in the queue.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelFailed`] if the connection broke.
    pub async fn send_buffer_wait(&self, buffer: &TupleBuffer) -> Result<SendOutcome> {
        match self.state() {
            ChannelState::Active => {}
            ChannelState::Failed => return Err(self.failed("connection lost")),
            _ => return Ok(SendOutcome::Closed),
        }
        self.commands
            .send(ChannelCommand::Data(buffer.clone()))
            .await
            .map(|()| SendOutcome::Sent)
            .map_err(|_| self.failed("writer stopped"))
    }

    /// Ends the partition.
    ///
    /// `Graceful` writes every queued buffer before the end of stream.
    /// `HardStop` drops the queue. `Failure` drops the queue and reports
    /// `reason` to the receiver before the end of stream. Closing twice is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelFailed`] if the end of stream could not
    /// be written.
    pub async fn close(&self, termination: QueryTerminationType, reason: Option<String>) -> Result<()> {
        let previous = self.state();
        match previous {
            ChannelState::Active => {}
            ChannelState::Closed | ChannelState::GracefulEnd | ChannelState::HardEnd => return Ok(()),
            ChannelState::Failed => {
                self.shared.set(ChannelState::Closed);
                return Err(self.failed("connection lost before close"));
            }
            ChannelState::Uninitialized | ChannelState::Connecting => {
                self.shared.set(ChannelState::Closed);
                return Ok(());
            }
        }
        if termination != QueryTerminationType::Graceful {
            self.shared.discard.store(true, Ordering::Release);
        }
        self.shared.set(ChannelState::ending(termination));
        debug!(partition = %self.partition, %termination, "closing channel");

        let (done, finished) = oneshot::channel();
        let command = ChannelCommand::Close {
            termination,
            reason,
            done,
        };
        if self.commands.send(command).await.is_err() || finished.await.is_err() {
            self.shared.set(ChannelState::Closed);
            return Err(self.failed("connection lost during close"));
        }
        Ok(())
    }

    fn failed(&self, reason: &str) -> NetworkError {
        NetworkError::ChannelFailed {
            partition: self.partition,
            reason: reason.to_string(),
        }
    }
}

impl Drop for NetworkChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for NetworkChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkChannel")
            .field("partition", &self.partition)
            .field("location", &self.location)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

async fn connect_once(
    partition: NesPartition,
    address: &str,
    max_frame_size: usize,
) -> std::result::Result<Connection, RetryError<NetworkError>> {
    let transient = |err: NetworkError| RetryError::Transient {
        err,
        retry_after: None,
    };

    let stream = TcpStream::connect(address)
        .await
        .map_err(|err| transient(err.into()))?;
    stream.set_nodelay(true).map_err(|err| transient(err.into()))?;
    let mut connection = Framed::new(stream, ExchangeCodec::new(max_frame_size));

    connection
        .send(Message::ClientAnnouncement(partition))
        .await
        .map_err(|err| transient(err.into()))?;

    match connection.next().await {
        Some(Ok(Message::ServerReady(echoed))) if echoed == partition => Ok(connection),
        Some(Ok(Message::Error {
            kind: ErrorKind::DeletedPartition,
            ..
        })) => Err(RetryError::Permanent(NetworkError::PartitionDeleted(partition))),
        Some(Ok(Message::Error { kind, message, .. })) => {
            debug!(%partition, %kind, message, "announcement rejected");
            Err(transient(NetworkError::PartitionNotRegistered(partition)))
        }
        Some(Ok(other)) => Err(RetryError::Permanent(NetworkError::Handshake {
            partition,
            reason: format!("unexpected {:?} reply", other.message_type()),
        })),
        Some(Err(err @ (ProtocolError::BadMagic(_) | ProtocolError::UnknownMessageType(_)))) => {
            Err(RetryError::Permanent(err.into()))
        }
        Some(Err(err)) => Err(transient(err.into())),
        None => Err(transient(NetworkError::Handshake {
            partition,
            reason: "connection closed".to_string(),
        })),
    }
}

async fn run_writer(
    partition: NesPartition,
    mut sink: SplitSink<Connection, Message>,
    mut stream: SplitStream<Connection>,
    mut queue: mpsc::Receiver<ChannelCommand>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Error { kind, message, .. })) => {
                        error!(%partition, %kind, message, "receiver reported an error");
                        shared.fail();
                        break;
                    }
                    Some(Ok(other)) => debug!(%partition, ?other, "ignoring message from receiver"),
                    Some(Err(err)) => {
                        error!(%partition, error = %err, "channel stream corrupted");
                        shared.fail();
                        break;
                    }
                    None => {
                        warn!(%partition, "receiver closed the connection");
                        shared.fail();
                        break;
                    }
                }
            }
            command = queue.recv() => {
                match command {
                    Some(ChannelCommand::Data(buffer)) => {
                        if shared.discard.load(Ordering::Acquire) {
                            continue;
                        }
                        if let Err(err) = sink.send(Message::DataBuffer { partition, buffer }).await {
                            error!(%partition, error = %err, "failed to write buffer");
                            shared.fail();
                            break;
                        }
                    }
                    Some(ChannelCommand::Close { termination, reason, done }) => {
                        if let Err(err) = write_end(&mut sink, partition, termination, reason).await {
                            error!(%partition, error = %err, "failed to write end of stream");
                            shared.fail();
                            break;
                        }
                        shared.set(ChannelState::Closed);
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    let _ = sink.close().await;
    debug!(%partition, state = ?shared.state(), "channel writer stopped");
}

async fn write_end(
    sink: &mut SplitSink<Connection, Message>,
    partition: NesPartition,
    termination: QueryTerminationType,
    reason: Option<String>,
) -> std::result::Result<(), ProtocolError> {
    if termination == QueryTerminationType::Failure {
        sink.feed(Message::Error {
            partition,
            kind: ErrorKind::Unknown,
            message: reason.unwrap_or_else(|| "upstream failure".to_string()),
        })
        .await?;
    }
    sink.send(Message::EndOfStream {
        partition,
        termination,
    })
    .await
}

/// Shares one [`NetworkChannel`] per partition between local producers.
///
/// The reference count lives in the [`PartitionManager`]'s producer table;
/// the channel is closed when the last producer releases it.
pub struct ChannelRegistry {
    partitions: Arc<PartitionManager>,
    config: NetworkConfig,
    channels: Mutex<FxHashMap<NesPartition, Arc<NetworkChannel>>>,
    connecting: tokio::sync::Mutex<()>,
}

impl ChannelRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(partitions: Arc<PartitionManager>, config: NetworkConfig) -> Self {
        Self {
            partitions,
            config,
            channels: Mutex::new(FxHashMap::default()),
            connecting: tokio::sync::Mutex::new(()),
        }
    }

    /// Takes a producer reference on `partition` and returns its channel,
    /// connecting to `location` if no active channel exists.
    ///
    /// The reference is held even when connecting fails; the caller must
    /// [`release`](Self::release) it.
    ///
    /// # Errors
    ///
    /// Returns the connection error.
    pub async fn acquire(
        &self,
        partition: NesPartition,
        location: NodeLocation,
    ) -> Result<Arc<NetworkChannel>> {
        let refs = self.partitions.register_subpartition_producer(partition, location);
        debug!(%partition, refs, "producer acquired channel");
        self.channel(partition).await
    }

    /// Active channel of `partition`, without connecting.
    #[must_use]
    pub fn current(&self, partition: NesPartition) -> Option<Arc<NetworkChannel>> {
        self.channels
            .lock()
            .get(&partition)
            .filter(|channel| channel.state() == ChannelState::Active)
            .cloned()
    }

    /// Active channel of `partition`, connecting to the registered location
    /// if needed.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::ChannelFailed`] if no producer holds the
    /// partition, or the connection error.
    pub async fn channel(&self, partition: NesPartition) -> Result<Arc<NetworkChannel>> {
        let _connecting = self.connecting.lock().await;
        if let Some(channel) = self.current(partition) {
            return Ok(channel);
        }
        let location = self
            .partitions
            .producer_location(partition)
            .ok_or_else(|| NetworkError::ChannelFailed {
                partition,
                reason: "no producer registered".to_string(),
            })?;
        let channel = NetworkChannel::connect(partition, location, &self.config).await?;
        self.channels.lock().insert(partition, Arc::clone(&channel));
        Ok(channel)
    }

    /// Moves `partition` to a new receiver: the old channel is closed hard
    /// and a new one is connected.
    ///
    /// # Errors
    ///
    /// Returns the connection error for the new receiver.
    pub async fn relocate(
        &self,
        partition: NesPartition,
        location: NodeLocation,
    ) -> Result<Arc<NetworkChannel>> {
        info!(%partition, %location, "relocating channel");
        self.partitions.update_producer_location(partition, location);
        let previous = {
            let _connecting = self.connecting.lock().await;
            self.channels.lock().remove(&partition)
        };
        if let Some(previous) = previous {
            if let Err(err) = previous
                .close(QueryTerminationType::HardStop, None)
                .await
            {
                debug!(%partition, error = %err, "old channel was already gone");
            }
        }
        self.channel(partition).await
    }

    /// Drops one producer reference. The last release closes the channel
    /// with `termination`. Returns true if the channel was closed.
    ///
    /// # Errors
    ///
    /// Returns the close error of the last release.
    pub async fn release(
        &self,
        partition: NesPartition,
        termination: QueryTerminationType,
        reason: Option<String>,
    ) -> Result<bool> {
        if !self.partitions.unregister_subpartition_producer(partition) {
            return Ok(false);
        }
        let channel = self.channels.lock().remove(&partition);
        if let Some(channel) = channel {
            channel.close(termination, reason).await?;
        }
        info!(%partition, %termination, "channel released");
        Ok(true)
    }

    /// Number of open channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.lock().len()
    }

    /// True if no channel is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.lock().is_empty()
    }

    /// Hard-closes every channel.
    pub async fn close_all(&self) {
        let channels: Vec<_> = self.channels.lock().drain().map(|(_, c)| c).collect();
        for channel in channels {
            let _ = channel.close(QueryTerminationType::HardStop, None).await;
        }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("channels", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{ExchangeListener, ExchangeProtocol};
    use crate::server::NetworkServer;
    use nes_core::ids::{NodeId, OperatorId, QueryId};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        buffers: parking_lot::Mutex<Vec<u64>>,
        errors: parking_lot::Mutex<Vec<String>>,
        ended: parking_lot::Mutex<Option<QueryTerminationType>>,
    }

    impl ExchangeListener for Recorder {
        fn on_data_buffer(&self, _: NesPartition, buffer: TupleBuffer) {
            self.buffers.lock().push(buffer.sequence_number());
        }

        fn on_end_of_stream(&self, _: NesPartition, termination: QueryTerminationType) {
            *self.ended.lock() = Some(termination);
        }

        fn on_server_error(&self, _: NesPartition, _: ErrorKind, message: &str) {
            self.errors.lock().push(message.to_string());
        }
    }

    struct Receiver {
        server: NetworkServer,
        partitions: Arc<PartitionManager>,
    }

    async fn receiver() -> Receiver {
        let partitions = Arc::new(PartitionManager::new());
        let exchange = Arc::new(ExchangeProtocol::new(Arc::clone(&partitions), Duration::from_millis(200)));
        let server = NetworkServer::bind("127.0.0.1:0", exchange, 1 << 20).await.unwrap();
        Receiver { server, partitions }
    }

    fn partition() -> NesPartition {
        NesPartition::new(QueryId(1), OperatorId(9), 0, 0)
    }

    fn location(receiver: &Receiver) -> NodeLocation {
        NodeLocation::new(NodeId(2), "127.0.0.1", receiver.server.local_addr().port())
    }

    fn config() -> NetworkConfig {
        NetworkConfig::builder().max_connect_retries(3).sender_queue_size(4).build()
    }

    fn buffer(seq: u64) -> TupleBuffer {
        let buffer = TupleBuffer::from_vec(vec![seq as u8; 8]);
        buffer.set_sequence_number(seq);
        buffer
    }

    async fn ended(recorder: &Recorder) -> Option<QueryTerminationType> {
        for _ in 0..400 {
            if let Some(termination) = *recorder.ended.lock() {
                return Some(termination);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_graceful_close_flushes_queue() {
        let receiver = receiver().await;
        let recorder = Arc::new(Recorder::default());
        receiver
            .partitions
            .register_subpartition_consumer(partition(), Arc::clone(&recorder) as Arc<dyn ExchangeListener>)
            .unwrap();

        let channel = NetworkChannel::connect(partition(), location(&receiver), &config())
            .await
            .unwrap();
        assert_eq!(channel.state(), ChannelState::Active);
        for seq in 1..=10 {
            assert_eq!(channel.send_buffer_wait(&buffer(seq)).await.unwrap(), SendOutcome::Sent);
        }
        channel.close(QueryTerminationType::Graceful, None).await.unwrap();

        assert_eq!(ended(&recorder).await, Some(QueryTerminationType::Graceful));
        assert_eq!(*recorder.buffers.lock(), (1..=10).collect::<Vec<_>>());
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(channel.send_buffer(&buffer(11)).unwrap(), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_failure_close_reports_reason() {
        let receiver = receiver().await;
        let recorder = Arc::new(Recorder::default());
        receiver
            .partitions
            .register_subpartition_consumer(partition(), Arc::clone(&recorder) as Arc<dyn ExchangeListener>)
            .unwrap();

        let channel = NetworkChannel::connect(partition(), location(&receiver), &config())
            .await
            .unwrap();
        channel
            .close(QueryTerminationType::Failure, Some("stage crashed".to_string()))
            .await
            .unwrap();

        assert_eq!(ended(&recorder).await, Some(QueryTerminationType::Failure));
        assert_eq!(*recorder.errors.lock(), vec!["stage crashed".to_string()]);
    }

    #[tokio::test]
    async fn test_connect_waits_for_late_consumer() {
        let receiver = receiver().await;
        let recorder = Arc::new(Recorder::default());
        let connecting = {
            let location = location(&receiver);
            tokio::spawn(async move {
                let config = NetworkConfig::builder()
                    .max_connect_retries(10)
                    .build();
                NetworkChannel::connect(partition(), location, &config).await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        receiver
            .partitions
            .register_subpartition_consumer(partition(), Arc::clone(&recorder) as Arc<dyn ExchangeListener>)
            .unwrap();
        let channel = connecting.await.unwrap().unwrap();
        assert_eq!(channel.state(), ChannelState::Active);
    }

    #[tokio::test]
    async fn test_connect_gives_up_on_unreachable_receiver() {
        let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = unused.local_addr().unwrap().port();
        drop(unused);

        let location = NodeLocation::new(NodeId(3), "127.0.0.1", port);
        let result = NetworkChannel::connect(partition(), location, &config()).await;
        assert!(matches!(result, Err(NetworkError::Io(_))));
    }

    #[tokio::test]
    async fn test_registry_shares_and_releases_channel() {
        let receiver = receiver().await;
        let recorder = Arc::new(Recorder::default());
        receiver
            .partitions
            .register_subpartition_consumer(partition(), Arc::clone(&recorder) as Arc<dyn ExchangeListener>)
            .unwrap();

        let registry = ChannelRegistry::new(Arc::new(PartitionManager::new()), config());
        let first = registry.acquire(partition(), location(&receiver)).await.unwrap();
        let second = registry.acquire(partition(), location(&receiver)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);

        assert!(!registry
            .release(partition(), QueryTerminationType::Graceful, None)
            .await
            .unwrap());
        assert_eq!(first.state(), ChannelState::Active);
        assert!(registry
            .release(partition(), QueryTerminationType::Graceful, None)
            .await
            .unwrap());
        assert!(registry.is_empty());
        assert_eq!(ended(&recorder).await, Some(QueryTerminationType::Graceful));
    }
}
