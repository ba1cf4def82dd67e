//! Worker configuration file.

use std::path::{Path, PathBuf};

use nes_core::buffer::{BufferManagerConfig, DEFAULT_BUFFER_SIZE, DEFAULT_NUM_BUFFERS};
use nes_core::engine::{RuntimeConfig, WorkerPoolConfig};
use nes_core::ids::NodeId;
use nes_network::{NetworkConfig, SinkConfig};
use serde::Deserialize;

/// Errors while loading a [`WorkerConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// The file is not valid TOML for a worker.
    #[error("Failed to parse {path}: {source}")]
    Parse {
        /// Config file.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },

    /// A value is out of range.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings of one worker node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Identity of this node.
    pub node_id: u64,
    /// Address the data server binds to.
    pub host: String,
    /// Data port; 0 picks a free port.
    pub data_port: u16,
    /// Query worker threads.
    pub worker_threads: usize,
    /// Bytes per pooled tuple buffer.
    pub buffer_size: usize,
    /// Pooled tuple buffers.
    pub num_buffers: usize,
    /// Threads of the network runtime.
    pub network_handler_threads: usize,
    /// Spill directory of network sinks.
    pub spill_dir: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            host: "127.0.0.1".to_string(),
            data_port: 0,
            worker_threads: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            buffer_size: DEFAULT_BUFFER_SIZE,
            num_buffers: DEFAULT_NUM_BUFFERS,
            network_handler_threads: 2,
            spill_dir: std::env::temp_dir().join("nes-worker-spill"),
        }
    }
}

impl WorkerConfig {
    /// Loads `path`, or the defaults if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed or holds
    /// invalid values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_threads == 0 {
            return Err(ConfigError::Invalid("worker_threads must be at least 1".into()));
        }
        if self.network_handler_threads == 0 {
            return Err(ConfigError::Invalid(
                "network_handler_threads must be at least 1".into(),
            ));
        }
        self.buffers()
            .validate()
            .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    /// Identity of this node.
    #[must_use]
    pub fn node_id(&self) -> NodeId {
        NodeId(self.node_id)
    }

    fn buffers(&self) -> BufferManagerConfig {
        BufferManagerConfig::builder()
            .buffer_size(self.buffer_size)
            .num_buffers(self.num_buffers)
            .build()
    }

    /// Execution runtime settings.
    #[must_use]
    pub fn runtime(&self) -> RuntimeConfig {
        RuntimeConfig::builder()
            .buffers(self.buffers())
            .workers(
                WorkerPoolConfig::builder()
                    .num_threads(self.worker_threads)
                    .build(),
            )
            .build()
    }

    /// Exchange settings.
    #[must_use]
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig::builder()
            .host(self.host.clone())
            .port(self.data_port)
            .handler_threads(self.network_handler_threads)
            .build()
    }

    /// Settings for the network sinks of deployed queries.
    #[must_use]
    pub fn sinks(&self) -> SinkConfig {
        SinkConfig::builder().spill_dir(self.spill_dir.clone()).build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = WorkerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(
            &path,
            "node_id = 4\ndata_port = 9090\nworker_threads = 3\nspill_dir = \"/var/nes\"\n",
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.node_id(), NodeId(4));
        assert_eq!(config.data_port, 9090);
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.spill_dir, PathBuf::from("/var/nes"));
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.network().bind_addr(), "127.0.0.1:9090");
        assert_eq!(config.runtime().workers.num_threads, 3);
        assert_eq!(config.sinks().spill_dir, PathBuf::from("/var/nes"));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "nodeid = 4\n").unwrap();
        assert!(matches!(WorkerConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_zero_threads_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.toml");
        std::fs::write(&path, "worker_threads = 0\n").unwrap();
        assert!(matches!(WorkerConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}
