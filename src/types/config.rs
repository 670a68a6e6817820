//! Configuration structures.
//!
//! Configuration is loaded from a JSON file and environment variables, with
//! defaults for every field.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use super::{Error, Result};

/// Smallest accepted `max_frame_payload`. An `Invoke` frame must at least fit
/// a short rpc name.
pub const MIN_FRAME_PAYLOAD: u32 = 16;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Per-connection protocol limits.
    #[serde(default)]
    pub conn: ConnConfig,

    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from a JSON file. Missing sections use defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        let config: Config = serde_json::from_slice(&raw)?;
        config.conn.validate()?;
        Ok(config)
    }

    /// Apply `MUXRPC_LISTEN_ADDR` and `MUXRPC_LOG_LEVEL` overrides.
    pub fn apply_env(mut self) -> Self {
        if let Ok(addr) = std::env::var("MUXRPC_LISTEN_ADDR") {
            if !addr.is_empty() {
                self.server.listen_addr = addr;
            }
        }
        if let Ok(level) = std::env::var("MUXRPC_LOG_LEVEL") {
            if !level.is_empty() {
                self.observability.log_level = level;
            }
        }
        self
    }
}

/// Protocol limits for one connection. Both peers are expected to run with
/// the same `max_frame_payload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnConfig {
    /// Maximum payload bytes per frame. Larger messages are chunked.
    pub max_frame_payload: u32,

    /// Maximum size of one reassembled message.
    pub max_message_bytes: usize,

    /// Receive window per stream, in complete messages. A peer that sends
    /// more than this without a window grant fails that stream. Both sides
    /// must agree on it.
    pub stream_recv_capacity: usize,

    /// Data frames a stream may have queued for the writer before
    /// `msg_send` waits.
    pub stream_send_capacity: usize,

    /// Inbound streams (server side) waiting for dispatch before the reader
    /// waits.
    pub incoming_stream_capacity: usize,

    /// Write timeout per frame. A peer that stops reading for longer than
    /// this brings the connection down.
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 64 * 1024,
            max_message_bytes: 4 * 1024 * 1024,
            stream_recv_capacity: 64,
            stream_send_capacity: 64,
            incoming_stream_capacity: 128,
            write_timeout: Duration::from_secs(10),
        }
    }
}

impl ConnConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload < MIN_FRAME_PAYLOAD {
            return Err(Error::internal(format!(
                "max_frame_payload must be at least {} bytes",
                MIN_FRAME_PAYLOAD
            )));
        }
        if self.max_message_bytes == 0 {
            return Err(Error::internal("max_message_bytes must be non-zero"));
        }
        if self.stream_recv_capacity == 0
            || self.stream_send_capacity == 0
            || self.incoming_stream_capacity == 0
        {
            return Err(Error::internal("queue capacities must be non-zero"));
        }
        Ok(())
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address used by the echo binary.
    pub listen_addr: String,

    /// Maximum concurrent connections. Connections beyond this limit are
    /// dropped at accept time.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7777".to_string(),
            max_connections: 1000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
