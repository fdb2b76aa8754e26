//! Connection configuration.
//!
//! Configuration is resolved in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if named by `BOTLINK_CONFIG`)
//! 3. Environment variables

use crate::queue::DEFAULT_QUEUE_DEPTH;
use botlink_protocol::{Command, MAX_PAYLOAD_SIZE, MIN_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default request timeout (3 seconds).
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 3_000;

/// Default link establishment timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default capacity of the unsolicited notification channel.
pub const DEFAULT_UNSOLICITED_CAPACITY: usize = 256;

/// Maximum queue depth.
pub const MAX_QUEUE_DEPTH: usize = 1024;

/// Largest frame the length byte can describe.
pub const MAX_FRAME_SIZE: usize = MIN_PACKET_SIZE + MAX_PAYLOAD_SIZE;

/// Command sent after link establishment; it must succeed before the
/// connection becomes ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeProbe {
    pub opcode: u8,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Reply opcode, if different from `opcode`.
    #[serde(default)]
    pub reply_opcode: Option<u8>,
    /// Offset of the status byte in the reply.
    #[serde(default)]
    pub status_offset: Option<usize>,
}

impl HandshakeProbe {
    pub fn new(opcode: u8) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
            reply_opcode: None,
            status_offset: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_reply_opcode(mut self, opcode: u8) -> Self {
        self.reply_opcode = Some(opcode);
        self
    }

    pub fn with_status_at(mut self, offset: usize) -> Self {
        self.status_offset = Some(offset);
        self
    }

    /// Builds the probe command.
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(self.opcode, self.payload.clone());
        if let Some(reply) = self.reply_opcode {
            command = command.with_reply_opcode(reply);
        }
        if let Some(offset) = self.status_offset {
            command = command.with_status_at(offset);
        }
        command
    }
}

/// Connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Per-request reply timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Link establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Frames that may wait for the link before `QueueFull`.
    pub queue_depth: usize,
    /// Largest frame written in one link write.
    pub max_frame_size: usize,
    /// Smallest acceptable link MTU.
    pub min_mtu: usize,
    /// Buffered notifications per unsolicited subscriber.
    pub unsolicited_capacity: usize,
    /// Optional capability probe.
    pub handshake: Option<HandshakeProbe>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_frame_size: botlink_protocol::DEFAULT_MAX_FRAME_SIZE,
            min_mtu: crate::transport::DEFAULT_ATT_PAYLOAD,
            unsolicited_capacity: DEFAULT_UNSOLICITED_CAPACITY,
            handshake: None,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("BOTLINK_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        let config: ConnectionConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("BOTLINK_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = value.parse() {
                self.request_timeout_ms = ms;
            }
        }

        if let Ok(value) = std::env::var("BOTLINK_CONNECT_TIMEOUT_MS") {
            if let Ok(ms) = value.parse() {
                self.connect_timeout_ms = ms;
            }
        }

        if let Ok(value) = std::env::var("BOTLINK_QUEUE_DEPTH") {
            if let Ok(depth) = value.parse::<usize>() {
                self.queue_depth = depth.clamp(1, MAX_QUEUE_DEPTH);
            }
        }

        if let Ok(value) = std::env::var("BOTLINK_MAX_FRAME_SIZE") {
            if let Ok(size) = value.parse::<usize>() {
                self.max_frame_size = size.clamp(MIN_PACKET_SIZE, MAX_FRAME_SIZE);
            }
        }

        if let Ok(value) = std::env::var("BOTLINK_MIN_MTU") {
            if let Ok(mtu) = value.parse() {
                self.min_mtu = mtu;
            }
        }
    }

    /// Checks that the values describe a usable connection.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "request_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(ConfigError::Validation(format!(
                "queue_depth must be between 1 and {}",
                MAX_QUEUE_DEPTH
            )));
        }
        if !(MIN_PACKET_SIZE..=MAX_FRAME_SIZE).contains(&self.max_frame_size) {
            return Err(ConfigError::Validation(format!(
                "max_frame_size must be between {} and {}",
                MIN_PACKET_SIZE, MAX_FRAME_SIZE
            )));
        }
        if self.unsolicited_capacity == 0 {
            return Err(ConfigError::Validation(
                "unsolicited_capacity must be greater than zero".to_string(),
            ));
        }
        if let Some(probe) = &self.handshake {
            if probe.payload.len() + MIN_PACKET_SIZE > self.max_frame_size {
                return Err(ConfigError::Validation(
                    "handshake probe does not fit in one frame".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.clamp(1, MAX_QUEUE_DEPTH);
        self
    }

    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.clamp(MIN_PACKET_SIZE, MAX_FRAME_SIZE);
        self
    }

    pub fn with_min_mtu(mut self, mtu: usize) -> Self {
        self.min_mtu = mtu;
        self
    }

    pub fn with_unsolicited_capacity(mut self, capacity: usize) -> Self {
        self.unsolicited_capacity = capacity.max(1);
        self
    }

    pub fn with_handshake(mut self, probe: HandshakeProbe) -> Self {
        self.handshake = Some(probe);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {1}", .0.display())]
    Io(PathBuf, String),

    #[error("failed to parse config file '{}': {1}", .0.display())]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}
