//! Client error types.

use botlink_protocol::{CorrelationKey, ProtocolError, RegistryError};
use thiserror::Error;

use crate::connection::ConnectionState;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("link not connected")]
    NotConnected,

    #[error("write failed: {0}")]
    Write(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("notification stream already taken")]
    StreamTaken,

    #[error("transport error: {0}")]
    Other(String),
}

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("connection not ready (state: {0})")]
    NotReady(ConnectionState),

    #[error("cannot connect while {0}")]
    AlreadyConnected(ConnectionState),

    #[error("command queue full ({capacity} pending)")]
    QueueFull { capacity: usize },

    #[error("request {0} is already pending")]
    DuplicateKey(CorrelationKey),

    #[error("disconnected")]
    Disconnected,

    #[error("request {0} timed out")]
    Timeout(CorrelationKey),

    #[error("connect timeout")]
    ConnectTimeout,

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("command {command} failed with status {code}")]
    CommandFailed { command: String, code: u8 },

    #[error("long command of {size} bytes exceeds the {capacity}-byte exchange area")]
    LongCommandTooLarge { size: usize, capacity: usize },

    #[error("long command reply CRC mismatch: announced {expected:#010x}, read {actual:#010x}")]
    LongReplyCrcMismatch { expected: u32, actual: u32 },
}

impl ClientError {
    /// Returns whether an outer retry policy may reasonably try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_)
                | ClientError::Timeout(_)
                | ClientError::ConnectTimeout
                | ClientError::Disconnected
                | ClientError::QueueFull { .. }
        )
    }
}
