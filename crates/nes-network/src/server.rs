//! TCP acceptor of the exchange.

use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::ExchangeCodec;
use crate::exchange::ExchangeProtocol;
use crate::protocol::{ErrorKind, Message, NesPartition};
use crate::Result;

/// Accepts producer connections and feeds them into an [`ExchangeProtocol`].
///
/// Each connection is served by its own task: the first frame must be an
/// announcement, after which data frames and one end of stream follow.
pub struct NetworkServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
}

impl NetworkServer {
    /// Binds to `addr` and starts accepting on the current runtime.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the address cannot be bound.
    pub async fn bind(
        addr: &str,
        exchange: Arc<ExchangeProtocol>,
        max_frame_size: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        info!(%local_addr, "exchange server listening");

        tokio::spawn(accept_loop(listener, exchange, max_frame_size, cancel.clone()));
        Ok(Self { local_addr, cancel })
    }

    /// Bound address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and closes every connection.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for NetworkServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for NetworkServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkServer")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

async fn accept_loop(
    listener: TcpListener,
    exchange: Arc<ExchangeProtocol>,
    max_frame_size: usize,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                if let Err(err) = stream.set_nodelay(true) {
                    warn!(%peer, error = %err, "failed to disable nagle");
                }
                tokio::spawn(serve_connection(
                    stream,
                    Arc::clone(&exchange),
                    max_frame_size,
                    cancel.child_token(),
                ));
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
    debug!("exchange acceptor stopped");
}

async fn serve_connection(
    stream: TcpStream,
    exchange: Arc<ExchangeProtocol>,
    max_frame_size: usize,
    cancel: CancellationToken,
) {
    let mut framed = Framed::new(stream, ExchangeCodec::new(max_frame_size));
    // Partition this connection was accepted for and has not yet ended.
    let mut open: Option<NesPartition> = None;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = framed.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(error = %err, "closing connection on protocol error");
                break;
            }
            None => break,
        };

        match message {
            Message::ClientAnnouncement(partition) => {
                let reply = exchange.on_client_announcement(partition).await;
                if matches!(reply, Message::ServerReady(_)) {
                    open = Some(partition);
                }
                if let Err(err) = framed.send(reply).await {
                    warn!(%partition, error = %err, "failed to answer announcement");
                    break;
                }
            }
            Message::DataBuffer { partition, buffer } => {
                if let Err(err) = exchange.on_buffer(partition, buffer) {
                    let reply = Message::Error {
                        partition,
                        kind: ErrorKind::PartitionNotRegistered,
                        message: err.to_string(),
                    };
                    if framed.send(reply).await.is_err() {
                        break;
                    }
                }
            }
            Message::EndOfStream {
                partition,
                termination,
            } => {
                if open == Some(partition) {
                    open = None;
                    exchange.on_end_of_stream(partition, termination);
                } else {
                    debug!(%partition, "end of stream for a partition not accepted here");
                }
            }
            Message::Error {
                partition,
                kind,
                message,
            } => exchange.on_server_error(partition, kind, &message),
            Message::ServerReady(partition) => {
                warn!(%partition, "unexpected server ready from a producer");
            }
        }
    }

    if let Some(partition) = open {
        exchange.on_channel_error(partition, "connection closed before end of stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeListener;
    use crate::partition::PartitionManager;
    use nes_core::buffer::TupleBuffer;
    use nes_core::engine::QueryTerminationType;
    use nes_core::ids::{OperatorId, QueryId};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ExchangeListener for Recorder {
        fn on_data_buffer(&self, _: NesPartition, buffer: TupleBuffer) {
            self.events.lock().push(format!("data {}", buffer.sequence_number()));
        }

        fn on_end_of_stream(&self, _: NesPartition, termination: QueryTerminationType) {
            self.events.lock().push(format!("eos {termination}"));
        }

        fn on_channel_error(&self, _: NesPartition, _: &str) {
            self.events.lock().push("broken".to_string());
        }
    }

    async fn server(recorder: &Arc<Recorder>) -> (NetworkServer, NesPartition) {
        let partition = NesPartition::new(QueryId(1), OperatorId(2), 0, 0);
        let partitions = Arc::new(PartitionManager::new());
        partitions
            .register_subpartition_consumer(partition, Arc::clone(recorder) as Arc<dyn ExchangeListener>)
            .unwrap();
        let exchange = Arc::new(ExchangeProtocol::new(partitions, Duration::from_millis(200)));
        let server = NetworkServer::bind("127.0.0.1:0", exchange, 1 << 20).await.unwrap();
        (server, partition)
    }

    async fn connect(server: &NetworkServer) -> Framed<TcpStream, ExchangeCodec> {
        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        Framed::new(stream, ExchangeCodec::default())
    }

    async fn wait_for(recorder: &Recorder, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let events = recorder.events.lock().clone();
            if events.len() >= count {
                return events;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        recorder.events.lock().clone()
    }

    #[tokio::test]
    async fn test_announce_send_and_end() {
        let recorder = Arc::new(Recorder::default());
        let (server, partition) = server(&recorder).await;
        let mut client = connect(&server).await;

        client.send(Message::ClientAnnouncement(partition)).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert!(matches!(reply, Message::ServerReady(p) if p == partition));

        for seq in 1..=2 {
            let buffer = TupleBuffer::from_vec(vec![1, 2, 3]);
            buffer.set_sequence_number(seq);
            client.send(Message::DataBuffer { partition, buffer }).await.unwrap();
        }
        client
            .send(Message::EndOfStream {
                partition,
                termination: QueryTerminationType::Graceful,
            })
            .await
            .unwrap();

        let events = wait_for(&recorder, 3).await;
        assert_eq!(events, vec!["data 1", "data 2", "eos graceful"]);
    }

    #[tokio::test]
    async fn test_unknown_partition_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let (server, _) = server(&recorder).await;
        let mut client = connect(&server).await;

        let other = NesPartition::new(QueryId(7), OperatorId(7), 0, 0);
        client.send(Message::ClientAnnouncement(other)).await.unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert!(matches!(
            reply,
            Message::Error {
                kind: ErrorKind::PartitionNotRegistered,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dropped_connection_reports_channel_error() {
        let recorder = Arc::new(Recorder::default());
        let (server, partition) = server(&recorder).await;
        let mut client = connect(&server).await;
        client.send(Message::ClientAnnouncement(partition)).await.unwrap();
        client.next().await.unwrap().unwrap();
        drop(client);

        let events = wait_for(&recorder, 1).await;
        assert_eq!(events, vec!["broken"]);
    }
}
