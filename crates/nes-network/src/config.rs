//! Network and sink configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_SIZE;

/// Configuration of a node's exchange endpoint and its outgoing channels.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Address the server binds to.
    pub host: String,
    /// Data port; 0 picks a free port.
    pub port: u16,
    /// Worker threads of the network runtime.
    pub handler_threads: usize,
    /// How long an announcement waits for its consumer to register.
    pub announcement_timeout: Duration,
    /// Connection attempts before a channel gives up.
    pub max_connect_retries: usize,
    /// Buffers queued per channel before `send_buffer` reports `Full`.
    pub sender_queue_size: usize,
    /// Largest accepted frame payload.
    pub max_frame_size: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            handler_threads: 2,
            announcement_timeout: Duration::from_secs(5),
            max_connect_retries: 10,
            sender_queue_size: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl NetworkConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder::default()
    }

    /// `host:port` the server binds to.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for [`NetworkConfig`].
#[derive(Debug, Default)]
pub struct NetworkConfigBuilder {
    config: NetworkConfig,
}

impl NetworkConfigBuilder {
    /// Sets the bind host.
    #[must_use]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Sets the data port.
    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Sets the number of network runtime threads (at least 1).
    #[must_use]
    pub fn handler_threads(mut self, threads: usize) -> Self {
        self.config.handler_threads = threads.max(1);
        self
    }

    /// Sets the announcement timeout.
    #[must_use]
    pub fn announcement_timeout(mut self, timeout: Duration) -> Self {
        self.config.announcement_timeout = timeout;
        self
    }

    /// Sets the connection attempts per channel.
    #[must_use]
    pub fn max_connect_retries(mut self, retries: usize) -> Self {
        self.config.max_connect_retries = retries;
        self
    }

    /// Sets the outbound queue size per channel (at least 1).
    #[must_use]
    pub fn sender_queue_size(mut self, size: usize) -> Self {
        self.config.sender_queue_size = size.max(1);
        self
    }

    /// Sets the largest accepted frame payload.
    #[must_use]
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> NetworkConfig {
        self.config
    }
}

/// Configuration of a [`NetworkSink`](crate::NetworkSink).
#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Buffers held in memory while the receiver is unreachable.
    pub spill_in_memory: usize,
    /// Buffers held on disk once memory is full.
    pub spill_max_buffers: usize,
    /// Directory for spill segments.
    pub spill_dir: PathBuf,
    /// Failed background reconnects before the sink gives up on its
    /// receiver. Each reconnect runs the channel's full connect backoff.
    pub max_reconnects: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            spill_in_memory: 64,
            spill_max_buffers: 4096,
            spill_dir: std::env::temp_dir().join("nes-sink-spill"),
            max_reconnects: 5,
        }
    }
}

impl SinkConfig {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> SinkConfigBuilder {
        SinkConfigBuilder::default()
    }
}

/// Builder for [`SinkConfig`].
#[derive(Debug, Default)]
pub struct SinkConfigBuilder {
    config: SinkConfig,
}

impl SinkConfigBuilder {
    /// Sets the in-memory spill capacity.
    #[must_use]
    pub fn spill_in_memory(mut self, buffers: usize) -> Self {
        self.config.spill_in_memory = buffers;
        self
    }

    /// Sets the on-disk spill capacity.
    #[must_use]
    pub fn spill_max_buffers(mut self, buffers: usize) -> Self {
        self.config.spill_max_buffers = buffers;
        self
    }

    /// Sets the spill directory.
    #[must_use]
    pub fn spill_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.spill_dir = dir.into();
        self
    }

    /// Sets the reconnect budget (at least 1).
    #[must_use]
    pub fn max_reconnects(mut self, attempts: usize) -> Self {
        self.config.max_reconnects = attempts.max(1);
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> SinkConfig {
        self.config
    }
}
