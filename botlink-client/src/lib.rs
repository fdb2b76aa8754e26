//! # botlink-client
//!
//! Client library for botlink.
//!
//! This crate provides:
//! - A connection state machine over a pluggable BLE [`Transport`]
//! - Request/response correlation over the unordered notification stream
//! - A serialized, bounded write queue
//! - A registry-driven high-level [`Client`] with chunked memory access

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod mock;
pub mod queue;
pub mod table;
pub mod transport;

pub use client::{Client, LongCommandArea, MemoryOpcodes};
pub use config::{ConfigError, ConnectionConfig, HandshakeProbe};
pub use connection::{connect, with_connection, Connection, ConnectionState, UnsolicitedHandler};
pub use error::{ClientError, TransportError};
pub use queue::CommandQueue;
pub use table::{RequestHandle, RequestTable, Resolution};
pub use transport::{DisconnectCallback, NotificationStream, Transport};
