//! Binary packet format.
//!
//! Packet layout (2 bytes header + payload + 1 byte trailer):
//!
//! ```text
//! +--------+--------+------------------+----------+
//! | opcode | length | payload          | checksum |
//! | 1 byte | 1 byte | `length` bytes   | 1 byte   |
//! +--------+--------+------------------+----------+
//! ```
//!
//! The checksum is the 8-bit wrapping sum of the opcode and every payload
//! byte. Multi-byte values inside payloads are little-endian.

use crate::error::{DecodeError, ProtocolError};
use bytes::{BufMut, Bytes, BytesMut};

/// Size of the fixed packet header in bytes (opcode + length).
pub const PACKET_HEADER_SIZE: usize = 2;

/// Size of the trailing checksum in bytes.
pub const CHECKSUM_SIZE: usize = 1;

/// Smallest possible packet: header and checksum around an empty payload.
pub const MIN_PACKET_SIZE: usize = PACKET_HEADER_SIZE + CHECKSUM_SIZE;

/// Computes the checksum over an opcode and its payload.
pub fn checksum(opcode: u8, payload: &[u8]) -> u8 {
    payload
        .iter()
        .fold(opcode, |acc, byte| acc.wrapping_add(*byte))
}

/// A parsed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Message opcode.
    pub opcode: u8,
    /// Packet payload.
    pub payload: Bytes,
    /// Checksum carried by (or computed for) the packet.
    pub checksum: u8,
}

impl Packet {
    /// Creates a packet and computes its checksum.
    pub fn new(opcode: u8, payload: impl Into<Bytes>) -> Self {
        let payload = payload.into();
        let checksum = checksum(opcode, &payload);
        Self {
            opcode,
            payload,
            checksum,
        }
    }

    /// Returns the encoded size of this packet.
    pub fn encoded_len(&self) -> usize {
        MIN_PACKET_SIZE + self.payload.len()
    }

    /// Reads the little-endian `u32` stored in the first four payload bytes.
    pub fn sequence_prefix(&self) -> Option<u32> {
        let prefix: [u8; 4] = self.payload.get(..4)?.try_into().ok()?;
        Some(u32::from_le_bytes(prefix))
    }

    /// Encodes the packet into bytes.
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let len = self.payload.len();
        if len > crate::MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: crate::MAX_PAYLOAD_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.opcode);
        buf.put_u8(len as u8);
        buf.put_slice(&self.payload);
        buf.put_u8(self.checksum);

        Ok(buf.freeze())
    }

    /// Decodes exactly one packet from `buf`.
    ///
    /// A notification carries one complete frame, so leftover bytes are an
    /// error rather than the start of another packet.
    pub fn decode(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < MIN_PACKET_SIZE {
            return Err(DecodeError::Truncated {
                needed: MIN_PACKET_SIZE,
                actual: buf.len(),
            });
        }

        let opcode = buf[0];
        let len = buf[1] as usize;
        let total = MIN_PACKET_SIZE + len;

        if buf.len() < total {
            return Err(DecodeError::Truncated {
                needed: total,
                actual: buf.len(),
            });
        }
        if buf.len() > total {
            return Err(DecodeError::TrailingBytes {
                extra: buf.len() - total,
            });
        }

        let payload = &buf[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + len];
        let carried = buf[total - 1];
        let computed = checksum(opcode, payload);
        if carried != computed {
            return Err(DecodeError::ChecksumMismatch {
                expected: computed,
                actual: carried,
            });
        }

        Ok(Self {
            opcode,
            payload: Bytes::copy_from_slice(payload),
            checksum: carried,
        })
    }
}
