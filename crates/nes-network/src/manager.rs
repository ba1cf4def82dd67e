//! One node's exchange endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use nes_core::engine::Dispatcher;
use nes_core::ids::OperatorId;
use tokio::runtime::{Handle, Runtime};
use tracing::info;

use crate::channel::ChannelRegistry;
use crate::config::{NetworkConfig, SinkConfig};
use crate::exchange::{ExchangeListener, ExchangeProtocol};
use crate::partition::PartitionManager;
use crate::protocol::{NesPartition, NodeLocation};
use crate::server::NetworkServer;
use crate::sink::NetworkSink;
use crate::source::NetworkSource;
use crate::Result;

/// Owns the network runtime, the server and the partition bookkeeping of a
/// node, and creates the network sources and sinks of its queries.
///
/// Must be created and dropped outside of an async context.
pub struct NetworkManager {
    runtime: Option<Runtime>,
    handle: Handle,
    partitions: Arc<PartitionManager>,
    registry: Arc<ChannelRegistry>,
    server: NetworkServer,
    config: NetworkConfig,
}

impl NetworkManager {
    /// Starts the network runtime and binds the server.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the runtime cannot start or the address
    /// cannot be bound.
    pub fn new(config: NetworkConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.handler_threads.max(1))
            .thread_name("nes-network")
            .enable_all()
            .build()?;

        let partitions = Arc::new(PartitionManager::new());
        let exchange = Arc::new(ExchangeProtocol::new(
            Arc::clone(&partitions),
            config.announcement_timeout,
        ));
        let registry = Arc::new(ChannelRegistry::new(Arc::clone(&partitions), config.clone()));
        let server = runtime.block_on(NetworkServer::bind(
            &config.bind_addr(),
            exchange,
            config.max_frame_size,
        ))?;
        info!(local_addr = %server.local_addr(), threads = config.handler_threads, "network manager started");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            partitions,
            registry,
            server,
            config,
        })
    }

    /// Address of the exchange server.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Handle of the network runtime.
    #[must_use]
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Partition bookkeeping.
    #[must_use]
    pub fn partitions(&self) -> &Arc<PartitionManager> {
        &self.partitions
    }

    /// Channels shared by this node's producers.
    #[must_use]
    pub fn channels(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Registers `listener` as the consumer of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::DuplicatePartition`](crate::NetworkError::DuplicatePartition)
    /// if the partition already has a consumer.
    pub fn register_subpartition_consumer(
        &self,
        partition: NesPartition,
        listener: Arc<dyn ExchangeListener>,
    ) -> Result<()> {
        self.partitions.register_subpartition_consumer(partition, listener)
    }

    /// Drops the registration of the consumer of `partition`.
    pub fn unregister_subpartition_consumer(&self, partition: NesPartition) -> bool {
        self.partitions.unregister_subpartition_consumer(partition)
    }

    /// Registers a producer of `partition` without opening a channel.
    /// Returns the producer count.
    pub fn register_subpartition_producer(&self, partition: NesPartition, location: NodeLocation) -> u64 {
        self.partitions.register_subpartition_producer(partition, location)
    }

    /// Creates a [`NetworkSource`] feeding `source_id` and registers it as
    /// the consumer of `partition`.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::DuplicatePartition`](crate::NetworkError::DuplicatePartition)
    /// if the partition already has a consumer.
    pub fn create_network_source(
        &self,
        partition: NesPartition,
        source_id: OperatorId,
        dispatcher: Arc<Dispatcher>,
    ) -> Result<Arc<NetworkSource>> {
        let source = Arc::new(NetworkSource::new(source_id, dispatcher));
        self.partitions
            .register_subpartition_consumer(partition, Arc::clone(&source) as Arc<dyn ExchangeListener>)?;
        Ok(source)
    }

    /// Creates a [`NetworkSink`] producing `partition` for the receiver at
    /// `location`. The channel is opened on `Initialize`.
    #[must_use]
    pub fn create_network_sink(
        &self,
        partition: NesPartition,
        location: NodeLocation,
        config: &SinkConfig,
    ) -> NetworkSink {
        NetworkSink::new(partition, location, Arc::clone(&self.registry), self.handle(), config)
    }

    /// Closes every channel, stops the server and the runtime.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        runtime.block_on(self.registry.close_all());
        self.server.shutdown();
        runtime.shutdown_timeout(std::time::Duration::from_secs(1));
        info!("network manager stopped");
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.server.shutdown();
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("local_addr", &self.local_addr())
            .field("partitions", &self.partitions)
            .field("channels", &self.registry)
            .finish_non_exhaustive()
    }
}
