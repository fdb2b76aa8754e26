//! Encoder and decoder between commands and link frames.

use crate::error::{DecodeError, ProtocolError};
use crate::message::Command;
use crate::packet::Packet;
use bytes::Bytes;

/// Frames commands for a link with a bounded write size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketCodec {
    max_frame_size: usize,
}

impl PacketCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Largest payload that still fits in one frame on this link.
    pub fn max_payload_size(&self) -> usize {
        self.max_frame_size
            .saturating_sub(crate::packet::MIN_PACKET_SIZE)
            .min(crate::MAX_PAYLOAD_SIZE)
    }

    /// Encodes a command into a single frame.
    pub fn encode(&self, command: &Command) -> Result<Bytes, ProtocolError> {
        let frame = command.to_packet().encode()?;
        if frame.len() > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        Ok(frame)
    }

    /// Decodes one received notification frame.
    pub fn decode(&self, frame: &[u8]) -> Result<Packet, DecodeError> {
        Packet::decode(frame)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::DEFAULT_MAX_FRAME_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::CorrelationKey;
    use crate::packet::checksum;
    use proptest::prelude::*;

    #[test]
    fn test_get_name_request() {
        let codec = PacketCodec::default();
        let frame = codec.encode(&Command::new(0x01, Bytes::new())).unwrap();
        assert_eq!(&frame[..], &[0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_frame_size_limit() {
        let codec = PacketCodec::new(8);
        assert_eq!(codec.max_payload_size(), 5);

        assert!(codec.encode(&Command::new(0x01, vec![0u8; 5])).is_ok());

        let result = codec.encode(&Command::new(0x01, vec![0u8; 6]));
        assert_eq!(
            result,
            Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        );
    }

    #[test]
    fn test_max_payload_capped_by_length_byte() {
        let codec = PacketCodec::new(4096);
        assert_eq!(codec.max_payload_size(), crate::MAX_PAYLOAD_SIZE);
    }

    #[test]
    fn test_decode_reply() {
        let codec = PacketCodec::default();
        let sum = checksum(0x01, b"Hello");
        let mut frame = vec![0x01u8, 0x05];
        frame.extend_from_slice(b"Hello");
        frame.push(sum);

        let packet = codec.decode(&frame).unwrap();
        assert_eq!(packet.opcode, 0x01);
        assert_eq!(&packet.payload[..], b"Hello");
    }

    proptest! {
        #[test]
        fn prop_reply_frame_matches_request_key(
            opcode in any::<u8>(),
            payload in proptest::collection::vec(any::<u8>(), 0..17),
        ) {
            let codec = PacketCodec::default();
            let command = Command::new(opcode, payload.clone());
            let frame = codec.encode(&command).unwrap();

            // The robot answers with the same opcode; the decoded reply must
            // carry the command's opcode and payload.
            let packet = codec.decode(&frame).unwrap();
            prop_assert_eq!(command.correlation_key(), Some(CorrelationKey::opcode(packet.opcode)));
            prop_assert_eq!(&packet.payload[..], &payload[..]);
        }
    }
}
