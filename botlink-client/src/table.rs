//! Pending request bookkeeping.
//!
//! Every request that expects a reply is registered here under its
//! [`CorrelationKey`] before its frame is queued. The reader task resolves
//! entries as packets arrive; callers wait on a [`RequestHandle`] that enforces
//! the request deadline and removes the entry if the caller gives up.

use crate::error::ClientError;
use botlink_protocol::{CorrelationKey, Packet, Response};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Number of expired or cancelled keys remembered for late-reply detection.
pub const LATE_RESPONSE_MEMORY: usize = 64;

type Slot = oneshot::Sender<Result<Response, ClientError>>;

/// One outstanding request.
struct PendingRequest {
    id: u64,
    created_at: Instant,
    deadline: Instant,
    status_offset: Option<usize>,
    slot: Slot,
}

impl PendingRequest {
    /// Delivers the outcome. Consumes the entry, so a request resolves once.
    ///
    /// Returns false if the waiting caller has already gone away.
    fn complete(self, result: Result<Response, ClientError>) -> bool {
        self.slot.send(result).is_ok()
    }
}

/// Outcome of routing a received packet through the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Delivered to the request registered under this key.
    Matched(CorrelationKey),
    /// Reply to a request that already timed out or was cancelled; discarded.
    Late(CorrelationKey),
    /// No request was waiting for this packet.
    Unsolicited(Packet),
}

#[derive(Default)]
struct TableInner {
    pending: HashMap<CorrelationKey, PendingRequest>,
    /// Keys of requests that expired or were cancelled, oldest first.
    abandoned: VecDeque<CorrelationKey>,
    next_id: u64,
    closed: bool,
}

impl TableInner {
    fn remember_abandoned(&mut self, key: CorrelationKey) {
        if self.abandoned.len() == LATE_RESPONSE_MEMORY {
            self.abandoned.pop_front();
        }
        self.abandoned.push_back(key);
    }

    fn take_abandoned(&mut self, key: &CorrelationKey) -> bool {
        match self.abandoned.iter().position(|k| k == key) {
            Some(pos) => {
                self.abandoned.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Keys a packet may answer: opcode-only first, then opcode plus sequence.
    fn candidate_keys(packet: &Packet) -> [Option<CorrelationKey>; 2] {
        [
            Some(CorrelationKey::opcode(packet.opcode)),
            packet
                .sequence_prefix()
                .map(|seq| CorrelationKey::sequenced(packet.opcode, seq)),
        ]
    }
}

/// Outstanding requests keyed by correlation key.
///
/// At most one request is pending per key. The table starts closed and is
/// opened for each established link.
pub struct RequestTable {
    inner: Mutex<TableInner>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                closed: true,
                ..TableInner::default()
            }),
        }
    }

    /// Accepts registrations again after [`fail_all`](Self::fail_all).
    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        inner.closed = false;
        inner.abandoned.clear();
    }

    /// Registers a request under `key`, expiring `timeout` from now.
    pub fn register(
        self: &Arc<Self>,
        key: CorrelationKey,
        timeout: Duration,
        status_offset: Option<usize>,
    ) -> Result<RequestHandle, ClientError> {
        let (slot, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = now + timeout;

        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(ClientError::Disconnected);
        }
        if inner.pending.contains_key(&key) {
            return Err(ClientError::DuplicateKey(key));
        }

        // A reply for this key now belongs to the new request
        inner.take_abandoned(&key);

        inner.next_id += 1;
        let id = inner.next_id;
        inner.pending.insert(
            key,
            PendingRequest {
                id,
                created_at: now,
                deadline,
                status_offset,
                slot,
            },
        );
        drop(inner);

        tracing::debug!("registered request {} (id={})", key, id);
        Ok(RequestHandle {
            table: Arc::clone(self),
            key,
            id,
            deadline,
            rx,
            finished: false,
        })
    }

    /// Routes a received packet to the request waiting for it.
    pub fn resolve(&self, packet: Packet) -> Resolution {
        let mut inner = self.inner.lock();

        let mut matched = None;
        for key in TableInner::candidate_keys(&packet).into_iter().flatten() {
            if let Some(pending) = inner.pending.remove(&key) {
                matched = Some((key, pending));
                break;
            }
        }

        let (key, pending) = match matched {
            Some(found) => found,
            None => {
                for key in TableInner::candidate_keys(&packet).into_iter().flatten() {
                    if inner.take_abandoned(&key) {
                        return Resolution::Late(key);
                    }
                }
                return Resolution::Unsolicited(packet);
            }
        };
        drop(inner);

        let elapsed = pending.created_at.elapsed();
        let result = Response::classify(packet, pending.status_offset).map_err(ClientError::from);
        if !pending.complete(result) {
            tracing::debug!("caller for {} went away before its reply", key);
        } else {
            tracing::debug!("resolved request {} after {:?}", key, elapsed);
        }
        Resolution::Matched(key)
    }

    /// Fails the request registered under `key`, if any.
    pub fn fail(&self, key: &CorrelationKey, error: ClientError) -> bool {
        let pending = self.inner.lock().pending.remove(key);
        match pending {
            Some(pending) => {
                pending.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fails every pending request and refuses new ones until reopened.
    ///
    /// Returns the number of requests failed.
    pub fn fail_all(&self, error: ClientError) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.abandoned.clear();
            inner.pending.drain().collect()
        };

        let count = drained.len();
        for (key, pending) in drained {
            tracing::debug!("failing request {}: {}", key, error);
            pending.complete(Err(error.clone()));
        }
        count
    }

    /// Removes the entry for `key` if it still belongs to request `id`.
    fn remove(&self, key: &CorrelationKey, id: u64, remember: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.get(key) {
            Some(pending) if pending.id == id => {
                inner.pending.remove(key);
                if remember {
                    inner.remember_abandoned(*key);
                }
                true
            }
            _ => false,
        }
    }

    /// Earliest deadline among pending requests.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().pending.values().map(|p| p.deadline).min()
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.inner.lock().pending.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().pending.is_empty()
    }
}

impl Default for RequestTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Caller side of a registered request.
///
/// Dropping the handle before the request resolves cancels it: the entry is
/// removed and a reply arriving later is discarded.
pub struct RequestHandle {
    table: Arc<RequestTable>,
    key: CorrelationKey,
    id: u64,
    deadline: Instant,
    rx: oneshot::Receiver<Result<Response, ClientError>>,
    finished: bool,
}

impl RequestHandle {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for the reply, the deadline or a connection failure.
    pub async fn wait(mut self) -> Result<Response, ClientError> {
        let outcome = tokio::time::timeout_at(self.deadline, &mut self.rx).await;
        self.finished = true;

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ClientError::Disconnected),
            Err(_) => {
                if self.table.remove(&self.key, self.id, true) {
                    tracing::debug!("request {} timed out", self.key);
                    return Err(ClientError::Timeout(self.key));
                }
                // Whoever took the entry delivers to it, possibly after the
                // deadline fired
                match (&mut self.rx).await {
                    Ok(result) => result,
                    Err(_) => Err(ClientError::Disconnected),
                }
            }
        }
    }

    /// Removes the registration without remembering it as abandoned.
    ///
    /// Used when the request frame never made it into the queue.
    pub fn abandon(mut self) {
        self.finished = true;
        self.table.remove(&self.key, self.id, false);
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if !self.finished && self.table.remove(&self.key, self.id, true) {
            tracing::debug!("request {} cancelled by caller", self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use botlink_protocol::{ProtocolError, ResponseStatus};
    use bytes::Bytes;

    const TIMEOUT: Duration = Duration::from_secs(3);

    fn open_table() -> Arc<RequestTable> {
        let table = Arc::new(RequestTable::new());
        table.reopen();
        table
    }

    #[tokio::test]
    async fn test_register_and_resolve() {
        let table = open_table();
        let handle = table
            .register(CorrelationKey::opcode(0x01), TIMEOUT, None)
            .unwrap();
        assert_eq!(table.len(), 1);

        let resolution = table.resolve(Packet::new(0x01, &b"Hello"[..]));
        assert_eq!(resolution, Resolution::Matched(CorrelationKey::opcode(0x01)));
        assert!(table.is_empty());

        let response = handle.wait().await.unwrap();
        assert_eq!(&response.payload()[..], b"Hello");
    }

    #[tokio::test]
    async fn test_closed_table_rejects() {
        let table = Arc::new(RequestTable::new());
        let result = table.register(CorrelationKey::opcode(0x01), TIMEOUT, None);
        assert!(matches!(result, Err(ClientError::Disconnected)));
    }

    #[tokio::test]
    async fn test_duplicate_key() {
        let table = open_table();
        let key = CorrelationKey::opcode(0x01);
        let _first = table.register(key, TIMEOUT, None).unwrap();

        let second = table.register(key, TIMEOUT, None);
        assert!(matches!(second, Err(ClientError::DuplicateKey(k)) if k == key));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_sequenced_lookup() {
        let table = open_table();
        let a = table
            .register(CorrelationKey::sequenced(0x65, 100), TIMEOUT, Some(4))
            .unwrap();
        let b = table
            .register(CorrelationKey::sequenced(0x65, 101), TIMEOUT, Some(4))
            .unwrap();

        // Replies arrive out of order
        let reply_b = Packet::new(0x65, vec![101u8, 0, 0, 0, 0]);
        let reply_a = Packet::new(0x65, vec![100u8, 0, 0, 0, 7]);
        assert!(matches!(table.resolve(reply_b), Resolution::Matched(_)));
        assert!(matches!(table.resolve(reply_a), Resolution::Matched(_)));

        assert_eq!(a.wait().await.unwrap().status, ResponseStatus::Failure(7));
        assert_eq!(b.wait().await.unwrap().status, ResponseStatus::Success);
    }

    #[tokio::test]
    async fn test_missing_status_fails_only_that_request() {
        let table = open_table();
        let handle = table
            .register(CorrelationKey::opcode(0x6f), TIMEOUT, Some(0))
            .unwrap();
        let other = table
            .register(CorrelationKey::opcode(0x02), TIMEOUT, None)
            .unwrap();

        table.resolve(Packet::new(0x6f, Bytes::new()));
        assert!(matches!(
            handle.wait().await,
            Err(ClientError::Protocol(ProtocolError::MissingStatus { .. }))
        ));
        assert!(table.contains(&other.key()));
    }

    #[tokio::test]
    async fn test_unsolicited() {
        let table = open_table();
        let packet = Packet::new(0x30, vec![1u8]);
        assert_eq!(table.resolve(packet.clone()), Resolution::Unsolicited(packet));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_then_late_reply() {
        let table = open_table();
        let key = CorrelationKey::opcode(0x01);
        let handle = table.register(key, TIMEOUT, None).unwrap();

        let result = handle.wait().await;
        assert_eq!(result, Err(ClientError::Timeout(key)));
        assert!(table.is_empty());

        // Discarded once, then treated as unsolicited
        assert_eq!(table.resolve(Packet::new(0x01, Bytes::new())), Resolution::Late(key));
        assert!(matches!(
            table.resolve(Packet::new(0x01, Bytes::new())),
            Resolution::Unsolicited(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_yields_to_resolution_in_flight() {
        let table = open_table();
        let key = CorrelationKey::opcode(0x01);
        let handle = table
            .register(key, Duration::from_millis(100), None)
            .unwrap();

        // Entry claimed by a resolver that has not delivered yet
        let pending = table.inner.lock().pending.remove(&key).unwrap();

        let waiter = tokio::spawn(handle.wait());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished());

        let packet = Packet::new(0x01, Bytes::from_static(b"ok"));
        assert!(pending.complete(Response::classify(packet, None).map_err(ClientError::from)));

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(&response.payload()[..], b"ok");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let table = open_table();
        let key = CorrelationKey::opcode(0x01);
        let handle = table.register(key, TIMEOUT, None).unwrap();
        drop(handle);

        assert!(table.is_empty());
        assert_eq!(table.resolve(Packet::new(0x01, Bytes::new())), Resolution::Late(key));

        // Key is free again
        assert!(table.register(key, TIMEOUT, None).is_ok());
    }

    #[tokio::test]
    async fn test_abandon_is_not_remembered() {
        let table = open_table();
        let key = CorrelationKey::opcode(0x01);
        table.register(key, TIMEOUT, None).unwrap().abandon();

        assert!(matches!(
            table.resolve(Packet::new(0x01, Bytes::new())),
            Resolution::Unsolicited(_)
        ));
    }

    #[tokio::test]
    async fn test_fail_all() {
        let table = open_table();
        let handles: Vec<_> = (0..5u8)
            .map(|op| table.register(CorrelationKey::opcode(op), TIMEOUT, None).unwrap())
            .collect();

        assert_eq!(table.fail_all(ClientError::Disconnected), 5);
        assert!(table.is_empty());
        for handle in handles {
            assert_eq!(handle.wait().await, Err(ClientError::Disconnected));
        }

        // Closed until reopened
        assert!(table.register(CorrelationKey::opcode(9), TIMEOUT, None).is_err());
        table.reopen();
        assert!(table.register(CorrelationKey::opcode(9), TIMEOUT, None).is_ok());
    }

    #[tokio::test]
    async fn test_fail_single() {
        let table = open_table();
        let key = CorrelationKey::opcode(0x01);
        let handle = table.register(key, TIMEOUT, None).unwrap();

        let err = ClientError::Transport(crate::error::TransportError::Write("gatt".into()));
        assert!(table.fail(&key, err.clone()));
        assert!(!table.fail(&key, err.clone()));
        assert_eq!(handle.wait().await, Err(err));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_memory_is_bounded() {
        let table = open_table();
        for seq in 0..(LATE_RESPONSE_MEMORY as u32 + 1) {
            let handle = table
                .register(CorrelationKey::sequenced(0x65, seq), Duration::ZERO, None)
                .unwrap();
            let _ = handle.wait().await;
        }

        // The oldest key was forgotten
        let oldest = Packet::new(0x65, vec![0u8, 0, 0, 0]);
        assert!(matches!(table.resolve(oldest), Resolution::Unsolicited(_)));
        let newest = Packet::new(0x65, (LATE_RESPONSE_MEMORY as u32).to_le_bytes().to_vec());
        assert!(matches!(table.resolve(newest), Resolution::Late(_)));
    }

    #[tokio::test]
    async fn test_next_deadline() {
        let table = open_table();
        assert!(table.next_deadline().is_none());
        let _short = table
            .register(CorrelationKey::opcode(1), Duration::from_millis(10), None)
            .unwrap();
        let _long = table
            .register(CorrelationKey::opcode(2), Duration::from_secs(10), None)
            .unwrap();
        assert!(table.next_deadline().unwrap() <= Instant::now() + Duration::from_millis(10));
    }
}
