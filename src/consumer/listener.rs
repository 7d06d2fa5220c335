//! Long-polling listener pool.
//!
//! Each listener repeatedly fetches a batch of messages from the queue and
//! deposits it into the message buffer. The buffer's bounded capacity is the
//! backpressure mechanism: when workers fall behind, sends block, the
//! listener stops fetching, and the remote queue keeps the excess.
//!
//! # Room gate
//!
//! Before fetching, a listener waits until the buffer has room for a whole
//! batch. Without the gate, listeners could each claim a single free slot,
//! fetch a full batch anyway, and hold the remainder in memory outside the
//! buffer, which is exactly the unbounded growth the buffer exists to
//! prevent.
//!
//! # Failure semantics
//!
//! Transient dequeue errors are retried with exponential backoff; nothing
//! has been acked, so nothing is lost. A fatal error (bad credentials,
//! unknown queue) stops this listener and parks the error for the consumer
//! handle to report; workers keep draining whatever is already buffered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, trace, warn};

use crate::client::{ClientError, QueueClient, QueueConnection};

use super::backoff::{Backoff, RetryConfig};
use super::buffer::MessageBuffer;

/// How often a listener re-checks the buffer while waiting for batch room.
const ROOM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shared slot where listeners park a fatal client error for the consumer
/// handle to report.
#[derive(Debug, Clone, Default)]
pub(crate) struct FatalErrorSlot(Arc<Mutex<Option<ClientError>>>);

impl FatalErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `error`, keeping the first one if several listeners fail.
    pub fn record(&self, error: ClientError) {
        let mut slot = self.0.lock().expect("fatal error slot poisoned");
        slot.get_or_insert(error);
    }

    pub fn get(&self) -> Option<ClientError> {
        self.0.lock().expect("fatal error slot poisoned").clone()
    }
}

/// Everything one listener task needs. Symmetric across the pool: listeners
/// have no affinity for specific messages.
pub(crate) struct ListenerContext<C> {
    pub client: Arc<C>,
    pub conn: Arc<QueueConnection>,
    pub buffer: MessageBuffer,
    pub dequeue_limit: usize,
    pub poll_timeout: Duration,
    pub retry: RetryConfig,
    pub stop: CancellationToken,
    pub fatal: FatalErrorSlot,
}

/// Runs one listener until the stop signal is raised, the buffer closes, or
/// a fatal client error occurs.
#[instrument(skip(ctx), fields(listener = index, queue = %ctx.conn.queue()))]
pub(crate) async fn run_listener<C: QueueClient>(index: usize, ctx: ListenerContext<C>) {
    debug!("listener started");
    let mut backoff = Backoff::new();

    'fetch: loop {
        if !wait_for_room(&ctx).await {
            break;
        }

        let batch = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            result = ctx.client.dequeue(&ctx.conn, ctx.dequeue_limit, ctx.poll_timeout) => result,
        };

        match batch {
            Ok(messages) => {
                backoff.reset();
                if messages.is_empty() {
                    // An empty long poll is normal, not an error.
                    continue;
                }
                trace!(count = messages.len(), "fetched batch");
                for message in messages {
                    tokio::select! {
                        _ = ctx.stop.cancelled() => {
                            // Abandon the rest of the batch; the unsent
                            // messages were never acked and will redeliver.
                            debug!("stop raised mid-batch");
                            break 'fetch;
                        }
                        sent = ctx.buffer.send(message) => {
                            if sent.is_err() {
                                debug!("message buffer closed mid-batch");
                                break 'fetch;
                            }
                        }
                    }
                }
            }
            Err(error) if error.is_transient() => {
                let delay = backoff.next_delay(&ctx.retry);
                warn!(
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "transient dequeue failure, backing off"
                );
                tokio::select! {
                    _ = ctx.stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(error) => {
                error!(error = %error, "fatal queue error, listener terminating");
                ctx.fatal.record(error);
                break;
            }
        }
    }

    debug!("listener stopped");
}

/// Waits until the buffer can hold a full batch.
///
/// Returns `false` when fetching should stop instead (buffer closed or stop
/// raised).
async fn wait_for_room<C>(ctx: &ListenerContext<C>) -> bool {
    loop {
        if ctx.buffer.is_closed() {
            return false;
        }
        if ctx.buffer.room() >= ctx.dequeue_limit {
            return true;
        }
        tokio::select! {
            _ = ctx.stop.cancelled() => return false,
            _ = tokio::time::sleep(ROOM_POLL_INTERVAL) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryQueue;
    use crate::types::QueueName;
    use tokio::task::JoinHandle;

    fn queue_name() -> QueueName {
        QueueName::new("orders")
    }

    async fn spawn_listener(
        client: &InMemoryQueue,
        buffer: &MessageBuffer,
        dequeue_limit: usize,
    ) -> (JoinHandle<()>, CancellationToken, FatalErrorSlot) {
        let queue = queue_name();
        let conn = client.connect(&queue, &queue.dead_letter()).await.unwrap();
        let stop = CancellationToken::new();
        let fatal = FatalErrorSlot::new();
        let ctx = ListenerContext {
            client: Arc::new(client.clone()),
            conn: Arc::new(conn),
            buffer: buffer.clone(),
            dequeue_limit,
            poll_timeout: Duration::from_millis(50),
            retry: RetryConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                max_attempts: 5,
            },
            stop: stop.clone(),
            fatal: fatal.clone(),
        };
        (
            tokio::spawn(run_listener(0, ctx)),
            stop,
            fatal,
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    #[tokio::test]
    async fn listener_fills_buffer_and_stops_fetching() {
        let client = InMemoryQueue::new();
        let buffer = MessageBuffer::new(2);
        for i in 0..4 {
            client.push(&queue_name(), format!("msg-{i}"));
        }

        let (task, stop, _) = spawn_listener(&client, &buffer, 1).await;

        // The buffer fills to capacity and the listener blocks on the gate.
        wait_until(|| buffer.is_full()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(client.stats().delivered, 2);

        // Draining one slot lets exactly one more fetch through.
        buffer.try_recv().unwrap();
        wait_until(|| buffer.is_full()).await;
        assert_eq!(client.stats().delivered, 3);

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn room_gate_requires_space_for_a_full_batch() {
        let client = InMemoryQueue::new();
        let buffer = MessageBuffer::new(2);
        // Occupy one slot so only one is free, less than the batch size.
        client.push(&queue_name(), "occupier");
        client.push(&queue_name(), "second");
        let conn_queue = queue_name();
        let seed = {
            let conn = client
                .connect(&conn_queue, &conn_queue.dead_letter())
                .await
                .unwrap();
            client
                .dequeue(&conn, 1, Duration::from_millis(10))
                .await
                .unwrap()
                .remove(0)
        };
        buffer.try_send(seed).unwrap();

        let (task, stop, _) = spawn_listener(&client, &buffer, 2).await;

        // Room (1) < batch size (2): no fetch happens.
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(client.stats().delivered, 1);

        // Freeing the slot unblocks the gate.
        buffer.try_recv().unwrap();
        wait_until(|| client.stats().delivered == 2).await;

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let client = InMemoryQueue::new();
        let buffer = MessageBuffer::new(4);
        client.inject_dequeue_error(ClientError::Transient {
            reason: "timeout".into(),
        });
        client.inject_dequeue_error(ClientError::Transient {
            reason: "throttled".into(),
        });
        client.push(&queue_name(), "payload");

        let (task, stop, fatal) = spawn_listener(&client, &buffer, 1).await;

        wait_until(|| buffer.len() == 1).await;
        assert!(fatal.get().is_none());

        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn fatal_error_terminates_listener_and_is_reported() {
        let client = InMemoryQueue::new();
        let buffer = MessageBuffer::new(4);
        client.inject_dequeue_error(ClientError::Connect {
            queue: queue_name(),
            reason: "credentials rejected".into(),
        });
        client.push(&queue_name(), "unreachable");

        let (task, _stop, fatal) = spawn_listener(&client, &buffer, 1).await;

        // The listener exits on its own, without a stop signal.
        task.await.unwrap();
        assert!(matches!(fatal.get(), Some(ClientError::Connect { .. })));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn stop_interrupts_an_in_flight_long_poll() {
        let client = InMemoryQueue::new();
        let buffer = MessageBuffer::new(4);

        let queue = queue_name();
        let conn = client.connect(&queue, &queue.dead_letter()).await.unwrap();
        let stop = CancellationToken::new();
        let ctx = ListenerContext {
            client: Arc::new(client.clone()),
            conn: Arc::new(conn),
            buffer: buffer.clone(),
            dequeue_limit: 1,
            poll_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            stop: stop.clone(),
            fatal: FatalErrorSlot::new(),
        };
        let task = tokio::spawn(run_listener(0, ctx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        stop.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("listener should stop promptly")
            .unwrap();
    }
}
