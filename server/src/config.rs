//! Server configuration, loaded from a TOML file.

use engine_buffer::{DEFAULT_CHUNK_CAPACITY, DEFAULT_CHUNK_MAX};
use engine_net::{ConnType, OverflowPolicy, SessionConfig};
use io_reactor::BackendKind;
use protocol_framing::FramerKind;
use serde::Deserialize;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Readiness backend: "epoll" or "poll".
    #[serde(default)]
    pub backend: BackendKind,

    /// Listeners to bind at startup.
    #[serde(default)]
    pub listener: Vec<ListenerConfig>,

    /// Buffer tuning applied to new connections.
    #[serde(default)]
    pub buffers: BufferConfig,

    /// Worker-thread settings.
    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub framer: FramerKind,
    #[serde(default)]
    pub conn_type: ConnType,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BufferConfig {
    /// Bytes per chunk.
    pub chunk_capacity: usize,
    /// Soft cap on send-buffer chunks before the overflow policy fires.
    pub send_chunk_max: usize,
    /// Soft cap on receive-buffer chunks.
    pub recv_chunk_max: usize,
    pub overflow: OverflowPolicy,
    /// Seconds a flushing close may keep draining.
    pub flush_grace_secs: u64,
    /// TCP_USER_TIMEOUT in seconds; 0 disables.
    pub user_timeout_secs: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_capacity: DEFAULT_CHUNK_CAPACITY,
            send_chunk_max: DEFAULT_CHUNK_MAX,
            recv_chunk_max: DEFAULT_CHUNK_MAX,
            overflow: OverflowPolicy::default(),
            flush_grace_secs: 5,
            user_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerConfig {
    /// Seconds between resource handshake attempts.
    pub retry_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { retry_secs: 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
    Compact,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "engine_net=debug".
    pub level: String,
    pub format: LogFormat,
    pub timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            timestamps: true,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// The session-layer view of this configuration.
    pub fn session(&self) -> SessionConfig {
        SessionConfig {
            backend: self.backend,
            chunk_capacity: self.buffers.chunk_capacity,
            send_chunk_max: self.buffers.send_chunk_max,
            recv_chunk_max: self.buffers.recv_chunk_max,
            overflow: self.buffers.overflow,
            flush_grace: Duration::from_secs(self.buffers.flush_grace_secs),
            user_timeout: match self.buffers.user_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            ..SessionConfig::default()
        }
    }

    pub fn worker_retry(&self) -> Duration {
        Duration::from_secs(self.worker.retry_secs)
    }
}
