//! The queue-client boundary.
//!
//! The engine does not speak to any queue service directly; it consumes the
//! [`QueueClient`] trait. A production deployment implements the trait over
//! its service's SDK; tests and local development use the bundled
//! [`InMemoryQueue`], which implements the full at-least-once delivery
//! semantics (visibility timeout, redelivery, dead-letter redirection) in
//! process.
//!
//! # Contract
//!
//! - `dequeue` long-polls: it may wait up to the poll timeout for at least
//!   one message, and an empty result is normal, not an error.
//! - `ack` permanently removes a message; `nack` makes it immediately
//!   visible again for redelivery.
//! - Both take the receipt handle from the delivery being acknowledged; a
//!   handle superseded by redelivery is rejected.
//! - Errors are classified transient or fatal via [`ClientError::is_transient`].
//!   The engine retries transient errors with backoff and treats everything
//!   else as a reason to stop the failing task.

mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{Message, QueueName, ReceiptHandle};

pub use memory::{InMemoryQueue, QueueStats};

/// Errors surfaced by a queue client.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// A retryable failure: network timeout, throttling, service hiccup.
    #[error("transient queue error: {reason}")]
    Transient {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// Connection establishment failed (authentication, endpoint, permissions).
    #[error("failed to connect to queue {queue}: {reason}")]
    Connect {
        /// The queue that could not be reached.
        queue: QueueName,
        /// Why the connection failed.
        reason: String,
    },

    /// The named queue does not exist.
    #[error("unknown queue: {queue}")]
    UnknownQueue {
        /// The missing queue.
        queue: QueueName,
    },

    /// The receipt handle was superseded by a redelivery and no longer
    /// identifies a live delivery attempt.
    #[error("receipt handle no longer valid: {receipt}")]
    StaleReceipt {
        /// The rejected handle.
        receipt: ReceiptHandle,
    },
}

impl ClientError {
    /// Whether retrying the same call can reasonably succeed.
    ///
    /// Stale receipts are not transient: the redelivered message will carry a
    /// fresh handle, so retrying with the old one is futile, and harmless to
    /// skip because the queue redelivers anything left unacknowledged.
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient { .. })
    }
}

/// Result type for queue-client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// An opaque handle identifying a primary queue and its dead-letter queue.
///
/// Produced by [`QueueClient::connect`] and owned by the consumer for its
/// lifetime. Shared read-only by the listener and dispatcher tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConnection {
    queue: QueueName,
    dead_letter: QueueName,
}

impl QueueConnection {
    /// Creates a connection handle. Called by client implementations.
    pub fn new(queue: QueueName, dead_letter: QueueName) -> Self {
        QueueConnection { queue, dead_letter }
    }

    /// The primary queue this connection consumes from.
    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    /// The dead-letter queue configured for the primary queue.
    pub fn dead_letter(&self) -> &QueueName {
        &self.dead_letter
    }
}

/// The operations the engine requires of a queue service.
///
/// Implementations must be safe to share across tasks; every method takes
/// `&self` and the engine calls them concurrently from multiple listeners
/// and the ack dispatcher.
#[async_trait]
pub trait QueueClient: Send + Sync + 'static {
    /// Establishes a connection to `queue`, binding (and if the service
    /// allows, creating) its dead-letter queue.
    async fn connect(&self, queue: &QueueName, dead_letter: &QueueName)
    -> Result<QueueConnection>;

    /// Long-polls for up to `max_messages` messages, waiting at most
    /// `poll_timeout` for the first one. An empty result is normal.
    async fn dequeue(
        &self,
        conn: &QueueConnection,
        max_messages: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<Message>>;

    /// Permanently removes `message` from the queue.
    async fn ack(&self, conn: &QueueConnection, message: &Message) -> Result<()>;

    /// Returns `message` to the queue for immediate redelivery.
    async fn nack(&self, conn: &QueueConnection, message: &Message) -> Result<()>;
}
