//! In-memory transport for tests and benchmarks.
//!
//! [`MockTransport`] records every written frame, lets the test push
//! notification frames as if the robot had sent them, and can drop the link
//! on demand. An optional responder answers written frames automatically.

use crate::error::TransportError;
use crate::transport::{DisconnectCallback, NotificationStream, Transport, DEFAULT_ATT_PAYLOAD};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Produces the notification frames answering one written frame.
pub type Responder = Arc<dyn Fn(&[u8]) -> Vec<Bytes> + Send + Sync>;

#[derive(Default)]
struct MockState {
    connected: bool,
    sender: Option<mpsc::UnboundedSender<Bytes>>,
    stream: Option<mpsc::UnboundedReceiver<Bytes>>,
    on_disconnect: Option<Arc<dyn Fn() + Send + Sync>>,
    responder: Option<Responder>,
    writes: Vec<Bytes>,
    fail_connect: Option<TransportError>,
    fail_writes: Option<TransportError>,
    connects: usize,
}

/// Scriptable in-memory [`Transport`].
pub struct MockTransport {
    state: Mutex<MockState>,
    mtu: Mutex<usize>,
    written: watch::Sender<usize>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (written, _) = watch::channel(0);
        Self {
            state: Mutex::new(MockState::default()),
            mtu: Mutex::new(DEFAULT_ATT_PAYLOAD),
            written,
        }
    }

    /// Answers each written frame with the frames returned by `responder`.
    pub fn with_responder<F>(self, responder: F) -> Self
    where
        F: Fn(&[u8]) -> Vec<Bytes> + Send + Sync + 'static,
    {
        self.state.lock().responder = Some(Arc::new(responder));
        self
    }

    pub fn with_mtu(self, mtu: usize) -> Self {
        *self.mtu.lock() = mtu;
        self
    }

    /// Makes the next `connect` calls fail with `error`.
    pub fn fail_connect(&self, error: Option<TransportError>) {
        self.state.lock().fail_connect = error;
    }

    /// Makes writes fail with `error` until cleared.
    pub fn fail_writes(&self, error: Option<TransportError>) {
        self.state.lock().fail_writes = error;
    }

    /// Delivers a frame on the notification stream.
    pub fn push(&self, frame: impl Into<Bytes>) -> Result<(), TransportError> {
        let state = self.state.lock();
        let sender = state.sender.as_ref().ok_or(TransportError::NotConnected)?;
        sender
            .send(frame.into())
            .map_err(|_| TransportError::NotConnected)
    }

    /// Simulates the robot going out of range.
    pub fn drop_link(&self) {
        let callback = {
            let mut state = self.state.lock();
            state.connected = false;
            state.sender = None;
            state.stream = None;
            state.on_disconnect.clone()
        };
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Frames written so far, in write order.
    pub fn writes(&self) -> Vec<Bytes> {
        self.state.lock().writes.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Number of successful `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }

    /// Waits until at least `count` frames have been written.
    pub async fn wait_for_writes(&self, count: usize) {
        let mut rx = self.written.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_connect.clone() {
            return Err(err);
        }

        let (sender, stream) = mpsc::unbounded_channel();
        state.connected = true;
        state.sender = Some(sender);
        state.stream = Some(stream);
        state.connects += 1;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let was_connected = self.state.lock().connected;
        if was_connected {
            self.drop_link();
        }
        Ok(())
    }

    async fn write(&self, frame: Bytes) -> Result<(), TransportError> {
        let replies = {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(TransportError::NotConnected);
            }
            if let Some(err) = state.fail_writes.clone() {
                return Err(err);
            }
            state.writes.push(frame.clone());

            let replies = match &state.responder {
                Some(responder) => responder(&frame),
                None => Vec::new(),
            };
            if let Some(sender) = &state.sender {
                for reply in &replies {
                    let _ = sender.send(reply.clone());
                }
            }
            replies.len()
        };

        self.written.send_modify(|n| *n += 1);
        tracing::trace!("mock write of {} bytes, {} replies", frame.len(), replies);
        Ok(())
    }

    fn notifications(&self) -> Result<NotificationStream, TransportError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let rx = state.stream.take().ok_or(TransportError::StreamTaken)?;
        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed())
    }

    fn on_disconnect(&self, callback: DisconnectCallback) {
        self.state.lock().on_disconnect = Some(Arc::from(callback));
    }

    fn mtu(&self) -> usize {
        *self.mtu.lock()
    }
}
