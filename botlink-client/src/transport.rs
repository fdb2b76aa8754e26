//! Link abstraction over the platform BLE stack.
//!
//! A transport exposes the command characteristic as [`Transport::write`] and
//! the notification characteristic as a stream of raw frames. Discovery,
//! pairing and the GATT plumbing itself live in the implementation.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

/// Notification frames in arrival order; ends when the link goes away.
pub type NotificationStream = BoxStream<'static, Bytes>;

/// Invoked by the transport when the link is lost.
pub type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

/// ATT payload size of a BLE link using the default 23-byte MTU.
pub const DEFAULT_ATT_PAYLOAD: usize = 20;

/// A BLE link to one robot.
///
/// Object-safe so a [`Connection`](crate::Connection) can own an
/// `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Establishes the link.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Tears the link down. Calling this on a closed link is not an error.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Writes one frame to the command characteristic.
    ///
    /// The caller guarantees at most one write is in flight at a time.
    async fn write(&self, frame: Bytes) -> Result<(), TransportError>;

    /// Returns the notification stream for the current link.
    ///
    /// The stream is not restartable; each established link hands it out once.
    fn notifications(&self) -> Result<NotificationStream, TransportError>;

    /// Registers the callback fired on link loss, replacing any previous one.
    fn on_disconnect(&self, callback: DisconnectCallback);

    /// Usable bytes per write on the current link.
    fn mtu(&self) -> usize {
        DEFAULT_ATT_PAYLOAD
    }
}
