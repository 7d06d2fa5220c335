//! Bounded FIFO buffer coupling pipeline stages.
//!
//! Both the message buffer (listeners → workers) and the done channel
//! (handlers → ack dispatcher) are instances of this type: a bounded
//! multi-producer multi-consumer channel whose blocking send is what turns a
//! slow downstream stage into backpressure on the remote queue.
//!
//! Closing is one-way and idempotent. After close, receivers drain whatever
//! is already buffered and then see end-of-stream; senders fail.

use thiserror::Error;

use crate::types::Message;

/// Error returned when sending into a closed buffer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("buffer is closed")]
pub struct BufferClosed;

/// A bounded MPMC queue of [`Message`]s with diagnostics for tests and
/// shutdown logic.
///
/// Clones share the same underlying channel; any clone may send, receive,
/// or close.
#[derive(Debug, Clone)]
pub struct MessageBuffer {
    tx: async_channel::Sender<Message>,
    rx: async_channel::Receiver<Message>,
    capacity: usize,
}

impl MessageBuffer {
    /// Creates a buffer holding at most `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = async_channel::bounded(capacity);
        MessageBuffer { tx, rx, capacity }
    }

    /// Number of messages currently buffered.
    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Maximum number of messages the buffer holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    /// Free slots remaining. The listener gate uses this to wait for room
    /// for a whole dequeue batch before fetching it.
    pub fn room(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Closes the buffer. Idempotent; returns `true` on the first call.
    pub fn close(&self) -> bool {
        self.tx.close()
    }

    /// Sends a message, waiting for room. Fails once the buffer is closed.
    pub async fn send(&self, message: Message) -> Result<(), BufferClosed> {
        self.tx.send(message).await.map_err(|_| BufferClosed)
    }

    /// Sends without waiting. Fails when the buffer is full or closed.
    pub fn try_send(&self, message: Message) -> Result<(), BufferClosed> {
        self.tx.try_send(message).map_err(|_| BufferClosed)
    }

    /// Receives the next message, waiting for one to arrive.
    ///
    /// Returns `None` once the buffer is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        self.rx.recv().await.ok()
    }

    /// Receives without waiting. Returns `None` when nothing is buffered,
    /// whether or not the buffer is closed.
    pub fn try_recv(&self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}
