//! Outbound write queue.
//!
//! The link accepts one write at a time, so frames are serialized through a
//! bounded FIFO drained by a single writer task.

use crate::error::ClientError;
use botlink_protocol::CorrelationKey;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Default number of frames that may wait for the link.
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// A frame waiting for its turn on the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedWrite {
    pub frame: Bytes,
    /// Key of the request waiting on this frame's reply, if any.
    pub key: Option<CorrelationKey>,
    /// Submission order.
    pub ticket: u64,
}

struct QueueInner {
    items: VecDeque<QueuedWrite>,
    open: bool,
    next_ticket: u64,
}

/// Bounded FIFO of frames awaiting transmission.
pub struct CommandQueue {
    inner: Mutex<QueueInner>,
    ready: Notify,
    capacity: usize,
}

impl CommandQueue {
    /// Creates a closed queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity),
                open: false,
                next_ticket: 0,
            }),
            ready: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Opens the queue for a new link, discarding anything left over.
    pub fn reopen(&self) {
        let mut inner = self.inner.lock();
        inner.items.clear();
        inner.open = true;
    }

    /// Appends a frame. Fails immediately when full or closed.
    pub fn submit(&self, frame: Bytes, key: Option<CorrelationKey>) -> Result<u64, ClientError> {
        let mut inner = self.inner.lock();
        if !inner.open {
            return Err(ClientError::Disconnected);
        }
        if inner.items.len() >= self.capacity {
            return Err(ClientError::QueueFull {
                capacity: self.capacity,
            });
        }

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;
        inner.items.push_back(QueuedWrite { frame, key, ticket });
        drop(inner);

        self.ready.notify_one();
        Ok(ticket)
    }

    /// Waits for the next frame in submission order.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<QueuedWrite> {
        loop {
            {
                let mut inner = self.inner.lock();
                if let Some(item) = inner.items.pop_front() {
                    return Some(item);
                }
                if !inner.open {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Closes the queue and returns the frames that were never written.
    pub fn drain(&self) -> Vec<QueuedWrite> {
        let drained = {
            let mut inner = self.inner.lock();
            inner.open = false;
            inner.items.drain(..).collect()
        };
        self.ready.notify_one();
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_queue(capacity: usize) -> CommandQueue {
        let queue = CommandQueue::new(capacity);
        queue.reopen();
        queue
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = open_queue(8);
        for i in 0..5u8 {
            queue.submit(Bytes::from(vec![i]), None).unwrap();
        }

        for i in 0..5u8 {
            let item = queue.next().await.unwrap();
            assert_eq!(&item.frame[..], &[i]);
            assert_eq!(item.ticket, i as u64);
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = open_queue(2);
        queue.submit(Bytes::from_static(b"a"), None).unwrap();
        queue.submit(Bytes::from_static(b"b"), None).unwrap();

        let result = queue.submit(Bytes::from_static(b"c"), None);
        assert_eq!(result, Err(ClientError::QueueFull { capacity: 2 }));
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn test_closed_rejects() {
        let queue = CommandQueue::new(4);
        assert!(!queue.is_open());
        assert_eq!(
            queue.submit(Bytes::from_static(b"a"), None),
            Err(ClientError::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_drain_closes_and_wakes_writer() {
        let queue = std::sync::Arc::new(open_queue(4));

        let writer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        let drained = queue.drain();
        assert!(drained.is_empty());
        assert_eq!(writer.await.unwrap(), None);
        assert!(!queue.is_open());
    }

    #[tokio::test]
    async fn test_drain_returns_unsent() {
        let queue = open_queue(4);
        let key = CorrelationKey::opcode(0x01);
        queue.submit(Bytes::from_static(b"a"), Some(key)).unwrap();
        queue.submit(Bytes::from_static(b"b"), None).unwrap();

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].key, Some(key));
        assert!(queue.next().await.is_none());

        // Reopen discards leftovers and accepts again
        queue.reopen();
        assert!(queue.submit(Bytes::from_static(b"c"), None).is_ok());
    }

    #[tokio::test]
    async fn test_writer_wakes_on_submit() {
        let queue = std::sync::Arc::new(open_queue(4));
        let writer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.submit(Bytes::from_static(b"x"), None).unwrap();
        let item = writer.await.unwrap().unwrap();
        assert_eq!(&item.frame[..], b"x");
    }
}
