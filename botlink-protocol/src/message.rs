//! Commands, correlation keys and responses.

use crate::error::ProtocolError;
use crate::packet::Packet;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Identifies which received packet answers which outstanding request.
///
/// `sequence` is only set for opcodes whose replies echo a request counter
/// in their first four payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub opcode: u8,
    pub sequence: Option<u32>,
}

impl CorrelationKey {
    /// Key matched on opcode alone.
    pub fn opcode(opcode: u8) -> Self {
        Self {
            opcode,
            sequence: None,
        }
    }

    /// Key matched on opcode and sequence counter.
    pub fn sequenced(opcode: u8, sequence: u32) -> Self {
        Self {
            opcode,
            sequence: Some(sequence),
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(seq) => write!(f, "({:#04x}, #{})", self.opcode, seq),
            None => write!(f, "({:#04x})", self.opcode),
        }
    }
}

/// Describes the reply a command waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplySpec {
    /// Correlation key the reply will carry.
    pub key: CorrelationKey,
    /// Offset of a status byte in the reply payload (0 = success).
    pub status_offset: Option<usize>,
}

/// A command ready to be framed and written to the link.
///
/// Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    opcode: u8,
    payload: Bytes,
    reply: Option<ReplySpec>,
}

impl Command {
    /// Creates a command whose reply uses the same opcode.
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
            reply: Some(ReplySpec {
                key: CorrelationKey::opcode(opcode),
                status_offset: None,
            }),
        }
    }

    /// Creates a command that carries `sequence` as a little-endian `u32`
    /// prefix of its payload and waits for a reply echoing it.
    pub fn sequenced(opcode: u8, sequence: u32, rest: impl AsRef<[u8]>) -> Self {
        let rest = rest.as_ref();
        let mut payload = BytesMut::with_capacity(4 + rest.len());
        payload.put_u32_le(sequence);
        payload.put_slice(rest);
        Self {
            opcode,
            payload: payload.freeze(),
            reply: Some(ReplySpec {
                key: CorrelationKey::sequenced(opcode, sequence),
                status_offset: None,
            }),
        }
    }

    /// Makes this a fire-and-forget command.
    pub fn without_response(mut self) -> Self {
        self.reply = None;
        self
    }

    /// Waits for a reply with a different opcode than the request.
    pub fn with_reply_opcode(mut self, opcode: u8) -> Self {
        let spec = self.reply.get_or_insert(ReplySpec {
            key: CorrelationKey::opcode(opcode),
            status_offset: None,
        });
        spec.key.opcode = opcode;
        self
    }

    /// Classifies the reply by the status byte found at `offset`.
    pub fn with_status_at(mut self, offset: usize) -> Self {
        if let Some(spec) = self.reply.as_mut() {
            spec.status_offset = Some(offset);
        }
        self
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn expects_response(&self) -> bool {
        self.reply.is_some()
    }

    pub fn reply(&self) -> Option<&ReplySpec> {
        self.reply.as_ref()
    }

    /// Correlation key of the expected reply, if any.
    pub fn correlation_key(&self) -> Option<CorrelationKey> {
        self.reply.map(|spec| spec.key)
    }

    /// Builds the packet for this command.
    pub fn to_packet(&self) -> Packet {
        Packet::new(self.opcode, self.payload.clone())
    }
}

/// Success/failure classification of a matched reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    /// Non-zero status byte reported by the robot.
    Failure(u8),
}

/// A decoded reply handed to the caller whose request it matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub packet: Packet,
    pub status: ResponseStatus,
}

impl Response {
    /// Pairs a matched packet with its classification.
    pub fn classify(packet: Packet, status_offset: Option<usize>) -> Result<Self, ProtocolError> {
        let status = match status_offset {
            None => ResponseStatus::Success,
            Some(offset) => match packet.payload.get(offset) {
                Some(0) => ResponseStatus::Success,
                Some(code) => ResponseStatus::Failure(*code),
                None => {
                    return Err(ProtocolError::MissingStatus {
                        opcode: packet.opcode,
                        offset,
                    })
                }
            },
        };
        Ok(Self { packet, status })
    }

    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    pub fn opcode(&self) -> u8 {
        self.packet.opcode
    }

    pub fn payload(&self) -> &Bytes {
        &self.packet.payload
    }
}
