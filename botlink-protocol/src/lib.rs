//! # botlink-protocol
//!
//! Wire protocol implementation for botlink, the robot command protocol
//! carried over a pair of BLE GATT characteristics.
//!
//! This crate provides:
//! - Packet framing with a length byte and an additive checksum
//! - Commands, correlation keys and classified responses
//! - The command registry interface used by higher layers

pub mod codec;
pub mod error;
pub mod message;
pub mod packet;
pub mod registry;

pub use codec::PacketCodec;
pub use error::{DecodeError, ProtocolError};
pub use message::{Command, CorrelationKey, ReplySpec, Response, ResponseStatus};
pub use packet::{checksum, Packet, MIN_PACKET_SIZE, PACKET_HEADER_SIZE};
pub use registry::{CommandEntry, CommandRegistry, RegistryError};

/// Maximum payload size (bounded by the one-byte length field).
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Default maximum frame size: the ATT payload of a default-MTU BLE link.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 20;
