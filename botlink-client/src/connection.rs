//! Connection management.
//!
//! A [`Connection`] owns one transport, the pending-request table and the
//! write queue. Two background tasks run per established link: the reader
//! consumes the notification stream and resolves pending requests, the writer
//! drains the queue one frame at a time.

use crate::config::ConnectionConfig;
use crate::error::ClientError;
use crate::queue::CommandQueue;
use crate::table::{RequestTable, Resolution};
use crate::transport::{NotificationStream, Transport};
use botlink_protocol::{Command, CorrelationKey, Packet, PacketCodec, Response};
use futures::StreamExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// First sequence number handed out by [`Connection::next_sequence`].
pub const INITIAL_SEQUENCE: u32 = 100;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Ready,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Callback for notifications no request was waiting for.
///
/// Runs on the reader task and must not block.
pub type UnsolicitedHandler = Arc<dyn Fn(&Packet) + Send + Sync>;

/// State shared between the connection handle and its background tasks.
struct Shared {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    codec: PacketCodec,
    table: Arc<RequestTable>,
    queue: CommandQueue,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every connect and every teardown; stale callbacks and tasks
    /// compare against it.
    session: AtomicU64,
    next_sequence: AtomicU32,
    unsolicited: broadcast::Sender<Packet>,
    handler: Mutex<Option<UnsolicitedHandler>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    /// Moves to `to` if the current state is one of `from`.
    ///
    /// Returns the state observed before the attempt on failure.
    fn transition(
        &self,
        from: &[ConnectionState],
        to: ConnectionState,
    ) -> Result<(), ConnectionState> {
        let mut observed = ConnectionState::Disconnected;
        let changed = self.state.send_if_modified(|state| {
            observed = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::debug!("connection state {} -> {}", observed, to);
            Ok(())
        } else {
            Err(observed)
        }
    }

    fn current_session(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Encodes, registers and queues a command, then waits for its reply.
    async fn dispatch(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Option<Response>, ClientError> {
        let frame = self.codec.encode(&command)?;

        let reply = match command.reply() {
            Some(reply) => *reply,
            None => {
                self.queue.submit(frame, None)?;
                return Ok(None);
            }
        };

        // Registered before queueing so the reply cannot outrun it
        let handle = self
            .table
            .register(reply.key, timeout, reply.status_offset)?;
        if let Err(e) = self.queue.submit(frame, Some(reply.key)) {
            handle.abandon();
            return Err(e);
        }

        handle.wait().await.map(Some)
    }

    fn handle_frame(&self, frame: &[u8]) {
        let packet = match self.codec.decode(frame) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("dropping corrupt frame ({} bytes): {}", frame.len(), e);
                return;
            }
        };

        match self.table.resolve(packet) {
            Resolution::Matched(_) => {}
            Resolution::Late(key) => {
                tracing::debug!("discarding late reply for {}", key);
            }
            Resolution::Unsolicited(packet) => self.dispatch_unsolicited(packet),
        }
    }

    fn dispatch_unsolicited(&self, packet: Packet) {
        let handler = self.handler.lock().clone();
        let handled = match handler {
            Some(handler) => {
                handler(&packet);
                true
            }
            None => false,
        };

        let opcode = packet.opcode;
        let delivered = self.unsolicited.send(packet).is_ok();
        if !handled && !delivered {
            tracing::debug!("no listener for unsolicited notification {:#04x}", opcode);
        }
    }

    /// Enters `Closing` and fails everything in flight.
    ///
    /// Returns false if the connection was not live, so teardown runs at most
    /// once per link.
    fn begin_close(&self, reason: ClientError) -> bool {
        if self
            .transition(
                &[
                    ConnectionState::Connecting,
                    ConnectionState::Connected,
                    ConnectionState::Ready,
                ],
                ConnectionState::Closing,
            )
            .is_err()
        {
            return false;
        }
        self.session.fetch_add(1, Ordering::SeqCst);

        // Queue first: a caller that registers after fail_all cannot queue
        let dropped = self.queue.drain();
        let failed = self.table.fail_all(reason);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        tracing::debug!(
            "closing: failed {} pending requests, dropped {} queued writes",
            failed,
            dropped.len()
        );
        true
    }

    fn finish_close(&self) {
        let _ = self.transition(&[ConnectionState::Closing], ConnectionState::Disconnected);
    }

    /// Link loss reported by the transport or by the end of the stream.
    fn link_lost(&self, session: u64) {
        if self.current_session() != session {
            return;
        }
        if self.begin_close(ClientError::Disconnected) {
            tracing::warn!("link lost");
            self.finish_close();
        }
    }

    /// Tears down without awaiting the transport.
    fn close_detached(&self) {
        if self.begin_close(ClientError::Disconnected) {
            let transport = Arc::clone(&self.transport);
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    if let Err(e) = transport.disconnect().await {
                        tracing::debug!("disconnect after drop failed: {}", e);
                    }
                });
            }
            self.finish_close();
        }
    }
}

/// Consumes the notification stream for one link.
async fn read_loop(shared: Arc<Shared>, mut stream: NotificationStream, session: u64) {
    tracing::debug!("read_loop started (session {})", session);
    while let Some(frame) = stream.next().await {
        if shared.current_session() != session {
            break;
        }
        shared.handle_frame(&frame);
    }
    tracing::debug!("read_loop: notification stream ended");
    shared.link_lost(session);
}

/// Writes queued frames in submission order, one at a time.
async fn write_loop(shared: Arc<Shared>) {
    while let Some(item) = shared.queue.next().await {
        let size = item.frame.len();
        match shared.transport.write(item.frame).await {
            Ok(()) => tracing::trace!("write_loop: wrote #{} ({} bytes)", item.ticket, size),
            Err(e) => {
                tracing::warn!("write_loop: write #{} failed: {}", item.ticket, e);
                if let Some(key) = item.key {
                    shared.table.fail(&key, ClientError::Transport(e));
                }
            }
        }
    }
    tracing::debug!("write_loop: queue closed");
}

/// A request/response connection to one robot.
///
/// Dropping the connection tears it down: pending requests fail with
/// [`ClientError::Disconnected`] and the transport is disconnected in the
/// background.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (unsolicited, _) = broadcast::channel(config.unsolicited_capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                transport,
                codec: PacketCodec::new(config.max_frame_size),
                table: Arc::new(RequestTable::new()),
                queue: CommandQueue::new(config.queue_depth),
                state,
                session: AtomicU64::new(0),
                next_sequence: AtomicU32::new(INITIAL_SEQUENCE),
                unsolicited,
                handler: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                config,
            }),
        }
    }

    /// Establishes the link and runs the capability handshake.
    ///
    /// Allowed from `Disconnected` only; a connection that lost its link may
    /// be connected again.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let shared = &self.shared;
        shared
            .transition(&[ConnectionState::Disconnected], ConnectionState::Connecting)
            .map_err(ClientError::AlreadyConnected)?;

        let session = shared.session.fetch_add(1, Ordering::SeqCst) + 1;
        let mut attempt = ConnectAttempt {
            connection: self,
            finished: false,
        };

        shared.table.reopen();
        shared.queue.reopen();

        let weak = Arc::downgrade(shared);
        shared.transport.on_disconnect(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.link_lost(session);
            }
        }));

        tracing::debug!("connecting (session {})...", session);
        match tokio::time::timeout(shared.config.connect_timeout(), shared.transport.connect()).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(attempt.fail(e.into()).await),
            Err(_) => {
                tracing::debug!("connect timeout");
                return Err(attempt.fail(ClientError::ConnectTimeout).await);
            }
        }

        let stream = match shared.transport.notifications() {
            Ok(stream) => stream,
            Err(e) => return Err(attempt.fail(e.into()).await),
        };

        // Teardown bumps the session before draining `tasks`, so checking it
        // under the lock keeps a dropped link from leaving tasks behind
        let spawned = {
            let mut tasks = shared.tasks.lock();
            if shared.current_session() != session {
                None
            } else {
                let reader = tokio::spawn(read_loop(Arc::clone(shared), stream, session));
                let writer = tokio::spawn(write_loop(Arc::clone(shared)));
                let aborts = [reader.abort_handle(), writer.abort_handle()];
                tasks.push(reader);
                tasks.push(writer);
                Some(aborts)
            }
        };

        let transitioned = spawned.is_some()
            && shared
                .transition(&[ConnectionState::Connecting], ConnectionState::Connected)
                .is_ok();
        if !transitioned {
            tracing::debug!("link dropped while connecting (session {})", session);
            for task in spawned.into_iter().flatten() {
                task.abort();
            }
            attempt.finished = true;
            return Err(ClientError::Disconnected);
        }

        if let Err(e) = self.handshake().await {
            tracing::debug!("handshake failed: {}", e);
            return Err(attempt.fail(e).await);
        }

        attempt.finished = true;
        shared
            .transition(&[ConnectionState::Connected], ConnectionState::Ready)
            .map_err(|_| ClientError::Disconnected)
    }

    async fn handshake(&self) -> Result<(), ClientError> {
        let config = &self.shared.config;

        let mtu = self.shared.transport.mtu();
        if mtu < config.min_mtu {
            return Err(ClientError::HandshakeFailed(format!(
                "link MTU {} below required {}",
                mtu, config.min_mtu
            )));
        }

        let probe = match &config.handshake {
            Some(probe) => probe,
            None => return Ok(()),
        };

        let reply = self
            .shared
            .dispatch(probe.to_command(), config.request_timeout())
            .await
            .map_err(|e| ClientError::HandshakeFailed(format!("probe failed: {}", e)))?;

        match reply {
            Some(response) if !response.is_ok() => Err(ClientError::HandshakeFailed(format!(
                "probe rejected with {:?}",
                response.status
            ))),
            _ => Ok(()),
        }
    }

    /// Sends a command using the configured request timeout.
    ///
    /// Returns `None` for fire-and-forget commands once the write has been
    /// queued, otherwise the matched reply.
    pub async fn send(&self, command: Command) -> Result<Option<Response>, ClientError> {
        self.send_with_timeout(command, self.shared.config.request_timeout())
            .await
    }

    /// Sends a command, waiting at most `timeout` for its reply.
    pub async fn send_with_timeout(
        &self,
        command: Command,
        timeout: Duration,
    ) -> Result<Option<Response>, ClientError> {
        self.ensure_ready()?;
        tracing::debug!(
            "send opcode={:#04x} ({} payload bytes)",
            command.opcode(),
            command.payload().len()
        );
        self.shared.dispatch(command, timeout).await
    }

    /// Waits for a notification matching `key` without writing anything.
    pub async fn wait_for(
        &self,
        key: CorrelationKey,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        self.ensure_ready()?;
        let handle = self.shared.table.register(key, timeout, None)?;
        handle.wait().await
    }

    /// Hands out the next request sequence number.
    pub fn next_sequence(&self) -> u32 {
        self.shared.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    /// Subscribes to notifications no request was waiting for.
    pub fn subscribe_unsolicited(&self) -> broadcast::Receiver<Packet> {
        self.shared.unsolicited.subscribe()
    }

    /// Installs (or removes) the unsolicited notification callback.
    pub fn set_unsolicited_handler(&self, handler: Option<UnsolicitedHandler>) {
        *self.shared.handler.lock() = handler;
    }

    /// Closes the connection, failing anything still in flight.
    pub async fn close(&self) -> Result<(), ClientError> {
        if !self.shared.begin_close(ClientError::Disconnected) {
            return Ok(());
        }
        tracing::debug!("Closing connection...");
        let result = self.shared.transport.disconnect().await;
        self.shared.finish_close();
        tracing::debug!("Connection closed");
        result.map_err(ClientError::from)
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Watches state transitions.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }

    /// Largest command payload that fits in one frame.
    pub fn max_payload_size(&self) -> usize {
        self.shared.codec.max_payload_size()
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.shared.table.len()
    }

    /// Returns the number of frames waiting for the link.
    pub fn queued_count(&self) -> usize {
        self.shared.queue.len()
    }

    fn ensure_ready(&self) -> Result<(), ClientError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            state => Err(ClientError::NotReady(state)),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close_detached();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("queued", &self.queued_count())
            .finish()
    }
}

/// Rolls back a connect attempt that did not reach `Ready`, including one
/// whose future was dropped mid-way.
struct ConnectAttempt<'a> {
    connection: &'a Connection,
    finished: bool,
}

impl ConnectAttempt<'_> {
    async fn fail(&mut self, error: ClientError) -> ClientError {
        self.finished = true;
        let shared = &self.connection.shared;
        if shared.begin_close(error.clone()) {
            if let Err(e) = shared.transport.disconnect().await {
                tracing::debug!("disconnect after failed connect: {}", e);
            }
            shared.finish_close();
        }
        error
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.connection.shared.close_detached();
        }
    }
}

/// Creates a connection and brings it to `Ready`.
pub async fn connect(
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
) -> Result<Connection, ClientError> {
    let connection = Connection::new(transport, config);
    connection.connect().await?;
    Ok(connection)
}

/// Runs `f` with a ready connection and closes it afterwards.
///
/// The connection is closed when `f` returns, whether it succeeded or not; if
/// this future is dropped instead, dropping the connection tears it down.
pub async fn with_connection<T, F, Fut>(
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
    f: F,
) -> Result<T, ClientError>
where
    F: FnOnce(Arc<Connection>) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let connection = Arc::new(connect(transport, config).await?);
    let result = f(Arc::clone(&connection)).await;
    if let Err(e) = connection.close().await {
        tracing::warn!("close failed: {}", e);
    }
    result
}
