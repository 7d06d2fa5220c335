//! In-process queue client with full at-least-once delivery semantics.
//!
//! This is the engine's test double and local-development backend. It
//! implements the same contract a hosted queue service provides:
//!
//! - **Long-poll dequeue**: waits up to the poll timeout for a visible
//!   message instead of returning empty immediately.
//! - **Visibility timeout**: a delivered message becomes invisible; if it is
//!   not acked before the timeout expires it reappears with an incremented
//!   receive count and a fresh receipt handle.
//! - **Dead-letter redirection**: a message whose receive count exceeds the
//!   configured budget is moved to the connection's dead-letter queue
//!   instead of being delivered again.
//!
//! All state lives behind one mutex; clones of the client share it, so a
//! test can keep a clone for seeding and inspection while the consumer owns
//! the original.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::types::{Message, MessageId, QueueName, ReceiptHandle};

use super::{ClientError, QueueClient, QueueConnection, Result};

/// Default duration a delivered message stays invisible.
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of deliveries before a message is dead-lettered.
const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// Delivery counters, inspectable by tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages handed out by `dequeue`, counting redeliveries.
    pub delivered: u64,
    /// Messages permanently removed by `ack`.
    pub acked: u64,
    /// Messages returned for redelivery by `nack`.
    pub nacked: u64,
}

/// A message at rest in a queue, plus its visibility deadline.
struct StoredMessage {
    message: Message,
    /// The message is eligible for delivery once this instant has passed.
    visible_at: Instant,
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<QueueName, VecDeque<StoredMessage>>,
    /// Errors to surface from upcoming `dequeue` calls, in order.
    injected_errors: VecDeque<ClientError>,
    /// Errors to surface from upcoming `ack`/`nack` calls, in order.
    injected_ack_errors: VecDeque<ClientError>,
    next_message: u64,
    next_receipt: u64,
    stats: QueueStats,
}

/// An in-memory queue service hosting any number of named queues.
#[derive(Clone)]
pub struct InMemoryQueue {
    state: Arc<Mutex<QueueState>>,
    /// Wakes long-pollers when a message is pushed or nacked.
    notify: Arc<Notify>,
    visibility_timeout: Duration,
    max_receive_count: u32,
    create_missing: bool,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        InMemoryQueue {
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
            create_missing: true,
        }
    }

    /// Sets how long a delivered message stays invisible before redelivery.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Sets how many deliveries a message gets before it is dead-lettered.
    pub fn with_max_receive_count(mut self, count: u32) -> Self {
        self.max_receive_count = count;
        self
    }

    /// Makes `connect` fail with `UnknownQueue` instead of creating missing
    /// queues, matching services where queues must be provisioned up front.
    pub fn existing_queues_only(mut self) -> Self {
        self.create_missing = false;
        self
    }

    /// Enqueues a message body, creating the queue if needed.
    pub fn push(&self, queue: &QueueName, body: impl Into<String>) -> MessageId {
        let mut state = self.lock();
        state.next_message += 1;
        let id = MessageId::new(format!("m-{}", state.next_message));
        let message = Message::new(id.clone(), ReceiptHandle::new(""), body);
        state
            .queues
            .entry(queue.clone())
            .or_default()
            .push_back(StoredMessage {
                message,
                visible_at: Instant::now(),
            });
        drop(state);
        self.notify.notify_waiters();
        trace!(queue = %queue, id = %id, "message enqueued");
        id
    }

    /// Queues an error to be returned by an upcoming `dequeue` call, ahead
    /// of any message delivery. Errors are consumed in injection order.
    pub fn inject_dequeue_error(&self, error: ClientError) {
        self.lock().injected_errors.push_back(error);
        self.notify.notify_waiters();
    }

    /// Queues an error to be returned by an upcoming `ack` or `nack` call.
    pub fn inject_ack_error(&self, error: ClientError) {
        self.lock().injected_ack_errors.push_back(error);
    }

    /// Current delivery counters.
    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    /// Number of messages (visible or not) currently in `queue`.
    pub fn queue_len(&self, queue: &QueueName) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue state lock poisoned")
    }

    /// One non-blocking delivery attempt. Returns delivered messages and, if
    /// nothing was deliverable, the earliest future visibility deadline.
    fn try_deliver(
        &self,
        conn: &QueueConnection,
        max_messages: usize,
    ) -> Result<(Vec<Message>, Option<Instant>)> {
        let now = Instant::now();
        let mut state = self.lock();

        if let Some(error) = state.injected_errors.pop_front() {
            return Err(error);
        }

        // Reserve receipt numbers up front; the queue entry borrow below
        // would otherwise conflict with the counter.
        let first_receipt = state.next_receipt;
        state.next_receipt += max_messages as u64;

        let max_receive_count = self.max_receive_count;
        let visibility_timeout = self.visibility_timeout;

        let mut delivered = Vec::new();
        let mut dead = Vec::new();
        let mut next_visible: Option<Instant> = None;
        {
            let queue = state
                .queues
                .get_mut(conn.queue())
                .ok_or_else(|| ClientError::UnknownQueue {
                    queue: conn.queue().clone(),
                })?;

            let mut idx = 0;
            while idx < queue.len() && delivered.len() < max_messages {
                if queue[idx].visible_at > now {
                    next_visible = Some(match next_visible {
                        Some(t) => t.min(queue[idx].visible_at),
                        None => queue[idx].visible_at,
                    });
                    idx += 1;
                    continue;
                }

                if queue[idx].message.receive_count >= max_receive_count {
                    // Redelivery budget exhausted; redirect instead of deliver.
                    if let Some(entry) = queue.remove(idx) {
                        dead.push(entry.message);
                    }
                    continue;
                }

                let entry = &mut queue[idx];
                entry.message.receive_count += 1;
                entry.message.first_received.get_or_insert_with(Utc::now);
                entry.message.receipt = ReceiptHandle::new(format!(
                    "r-{}",
                    first_receipt + delivered.len() as u64 + 1
                ));
                entry.visible_at = now + visibility_timeout;
                delivered.push(entry.message.clone());
                idx += 1;
            }
        }

        if !dead.is_empty() {
            let dlq = state.queues.entry(conn.dead_letter().clone()).or_default();
            for message in dead {
                debug!(
                    id = %message.id,
                    receive_count = message.receive_count,
                    dead_letter = %conn.dead_letter(),
                    "redelivery budget exhausted, moving to dead-letter queue"
                );
                dlq.push_back(StoredMessage {
                    message,
                    visible_at: now,
                });
            }
        }

        state.stats.delivered += delivered.len() as u64;
        Ok((delivered, next_visible))
    }

    /// Locates `message` by id in the connection's primary queue, verifying
    /// the receipt handle still identifies the live delivery attempt.
    fn position_of(
        state: &mut QueueState,
        conn: &QueueConnection,
        message: &Message,
    ) -> Result<usize> {
        let queue = state
            .queues
            .get_mut(conn.queue())
            .ok_or_else(|| ClientError::UnknownQueue {
                queue: conn.queue().clone(),
            })?;

        queue
            .iter()
            .position(|entry| {
                entry.message.id == message.id && entry.message.receipt == message.receipt
            })
            .ok_or_else(|| ClientError::StaleReceipt {
                receipt: message.receipt.clone(),
            })
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn connect(
        &self,
        queue: &QueueName,
        dead_letter: &QueueName,
    ) -> Result<QueueConnection> {
        let mut state = self.lock();
        if self.create_missing {
            state.queues.entry(queue.clone()).or_default();
            state.queues.entry(dead_letter.clone()).or_default();
        } else if !state.queues.contains_key(queue) {
            return Err(ClientError::UnknownQueue {
                queue: queue.clone(),
            });
        }
        Ok(QueueConnection::new(queue.clone(), dead_letter.clone()))
    }

    async fn dequeue(
        &self,
        conn: &QueueConnection,
        max_messages: usize,
        poll_timeout: Duration,
    ) -> Result<Vec<Message>> {
        let deadline = Instant::now() + poll_timeout;

        loop {
            // Register for wake-ups before scanning, so a push that lands
            // between the scan and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (delivered, next_visible) = self.try_deliver(conn, max_messages)?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                // Long poll expired with nothing to deliver; that's normal.
                return Ok(Vec::new());
            }

            // Sleep until the deadline, a message becomes visible again, or
            // a push/nack wakes us, whichever comes first.
            let mut wait = deadline - now;
            if let Some(visible_at) = next_visible {
                wait = wait.min(visible_at.saturating_duration_since(now));
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, conn: &QueueConnection, message: &Message) -> Result<()> {
        let mut state = self.lock();
        if let Some(error) = state.injected_ack_errors.pop_front() {
            return Err(error);
        }
        let position = Self::position_of(&mut state, conn, message)?;
        if let Some(queue) = state.queues.get_mut(conn.queue()) {
            queue.remove(position);
        }
        state.stats.acked += 1;
        trace!(id = %message.id, "acked");
        Ok(())
    }

    async fn nack(&self, conn: &QueueConnection, message: &Message) -> Result<()> {
        let mut state = self.lock();
        if let Some(error) = state.injected_ack_errors.pop_front() {
            return Err(error);
        }
        let position = Self::position_of(&mut state, conn, message)?;
        if let Some(queue) = state.queues.get_mut(conn.queue()) {
            queue[position].visible_at = Instant::now();
        }
        state.stats.nacked += 1;
        drop(state);
        self.notify.notify_waiters();
        trace!(id = %message.id, "nacked, visible again");
        Ok(())
    }
}
