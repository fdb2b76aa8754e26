//! Protocol error types.

use thiserror::Error;

/// Errors produced while parsing a received frame.
///
/// Decoding never panics: every malformed input maps to one of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("truncated frame: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("{extra} trailing bytes after checksum")]
    TrailingBytes { extra: usize },
}

/// Protocol-level errors that can occur while framing or classifying packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("frame too large: {size} bytes (link max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("reply to opcode {opcode:#04x} has no status byte at offset {offset}")]
    MissingStatus { opcode: u8, offset: usize },

    #[error("unexpected opcode {actual:#04x}, expected {expected:#04x}")]
    UnexpectedOpcode { expected: u8, actual: u8 },
}
