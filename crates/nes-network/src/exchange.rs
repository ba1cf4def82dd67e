//! Server-side half of the exchange: handshake and delivery to consumers.

use std::sync::Arc;
use std::time::Duration;

use nes_core::buffer::TupleBuffer;
use nes_core::engine::QueryTerminationType;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::partition::{PartitionManager, PartitionRegistrationStatus};
use crate::protocol::{ErrorKind, Message, NesPartition};
use crate::NetworkError;

/// Consumer-side callbacks for one partition.
pub trait ExchangeListener: Send + Sync {
    /// A buffer arrived. Its sequence metadata is as the producer set it.
    fn on_data_buffer(&self, partition: NesPartition, buffer: TupleBuffer);

    /// The producer closed the partition.
    fn on_end_of_stream(&self, partition: NesPartition, termination: QueryTerminationType);

    /// The producer reported an error.
    fn on_server_error(&self, partition: NesPartition, kind: ErrorKind, message: &str) {
        warn!(%partition, %kind, message, "exchange error");
    }

    /// The connection carrying the partition broke.
    fn on_channel_error(&self, partition: NesPartition, reason: &str) {
        warn!(%partition, reason, "exchange channel error");
    }
}

/// Handshake and delivery logic shared by all server connections.
pub struct ExchangeProtocol {
    partitions: Arc<PartitionManager>,
    announcement_timeout: Duration,
}

impl ExchangeProtocol {
    /// Creates the protocol over `partitions`.
    #[must_use]
    pub fn new(partitions: Arc<PartitionManager>, announcement_timeout: Duration) -> Self {
        Self {
            partitions,
            announcement_timeout,
        }
    }

    /// Partition bookkeeping.
    #[must_use]
    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    /// Answers an announcement of `partition`.
    ///
    /// Waits up to the announcement timeout for the consumer to register.
    /// On success the connection holds a reference on the consumer until
    /// [`on_end_of_stream`](Self::on_end_of_stream) or
    /// [`on_channel_error`](Self::on_channel_error).
    pub async fn on_client_announcement(&self, partition: NesPartition) -> Message {
        let deadline = Instant::now() + self.announcement_timeout;
        loop {
            let registered = self.partitions.registrations().notified();
            tokio::pin!(registered);
            registered.as_mut().enable();

            match self.partitions.get_consumer_registration_status(partition) {
                PartitionRegistrationStatus::Registered => {
                    if self.partitions.pin_consumer(partition) {
                        debug!(%partition, "announcement accepted");
                        return Message::ServerReady(partition);
                    }
                }
                PartitionRegistrationStatus::Deleted => {
                    return Self::error(partition, ErrorKind::DeletedPartition, "consumer is gone");
                }
                PartitionRegistrationStatus::NotFound => {}
            }

            if tokio::time::timeout_at(deadline, registered).await.is_err() {
                warn!(%partition, "announcement timed out");
                return Self::error(
                    partition,
                    ErrorKind::PartitionNotRegistered,
                    "no consumer registered in time",
                );
            }
        }
    }

    fn error(partition: NesPartition, kind: ErrorKind, message: &str) -> Message {
        Message::Error {
            partition,
            kind,
            message: message.to_string(),
        }
    }

    /// Delivers `buffer` to the consumer of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::PartitionNotRegistered`] if no consumer is
    /// registered.
    pub fn on_buffer(&self, partition: NesPartition, buffer: TupleBuffer) -> Result<(), NetworkError> {
        let listener = self
            .partitions
            .get_consumer_listener(partition)
            .ok_or(NetworkError::PartitionNotRegistered(partition))?;
        listener.on_data_buffer(partition, buffer);
        Ok(())
    }

    /// Forwards the end of `partition` and releases the connection's
    /// reference.
    pub fn on_end_of_stream(&self, partition: NesPartition, termination: QueryTerminationType) {
        debug!(%partition, %termination, "end of stream received");
        if let Some(listener) = self.partitions.get_consumer_listener(partition) {
            listener.on_end_of_stream(partition, termination);
        }
        self.partitions.unregister_subpartition_consumer(partition);
    }

    /// Forwards an error reported by the producer of `partition`.
    pub fn on_server_error(&self, partition: NesPartition, kind: ErrorKind, message: &str) {
        error!(%partition, %kind, message, "producer reported an error");
        if let Some(listener) = self.partitions.get_consumer_listener(partition) {
            listener.on_server_error(partition, kind, message);
        }
    }

    /// Reports a broken connection on `partition` and releases its
    /// reference.
    pub fn on_channel_error(&self, partition: NesPartition, reason: &str) {
        if let Some(listener) = self.partitions.get_consumer_listener(partition) {
            listener.on_channel_error(partition, reason);
        }
        self.partitions.unregister_subpartition_consumer(partition);
    }
}

impl std::fmt::Debug for ExchangeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeProtocol")
            .field("partitions", &self.partitions)
            .field("announcement_timeout", &self.announcement_timeout)
            .finish()
    }
}
