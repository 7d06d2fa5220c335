//! Ack dispatcher: the completion side of the pipeline.
//!
//! Consumes the done channel until it is closed and drained. Each completed
//! message is routed on its `nack` flag (set means return to the queue for
//! redelivery, unset means acknowledge and remove), and then one in-flight
//! permit is restored, closing the loop opened when a worker took the
//! message.
//!
//! Acknowledgment failures are not fatal. A transient failure is retried
//! with backoff up to the attempt budget; after that the dispatcher moves
//! on, because an unacknowledged message simply reappears after its
//! visibility timeout. Lost acks are self-healing by construction.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, trace, warn};

use crate::client::{QueueClient, QueueConnection};
use crate::types::Message;

use super::backoff::RetryConfig;
use super::buffer::MessageBuffer;

/// Everything the dispatcher task needs.
pub(crate) struct DispatcherContext<C> {
    pub client: Arc<C>,
    pub conn: Arc<QueueConnection>,
    pub done: MessageBuffer,
    pub in_flight: Arc<Semaphore>,
    pub retry: RetryConfig,
}

/// Runs the dispatcher until the done channel is closed and drained.
///
/// Dispatch is sequential: one completion is fully resolved (including
/// retries) before the next is taken. The permit is restored whether or not
/// the acknowledgment succeeded; the message's fate now rests with the
/// queue's redelivery.
#[instrument(skip(ctx), fields(queue = %ctx.conn.queue()))]
pub(crate) async fn run_dispatcher<C: QueueClient>(ctx: DispatcherContext<C>) {
    debug!("ack dispatcher started");

    while let Some(message) = ctx.done.recv().await {
        dispatch_one(&ctx, &message).await;
        ctx.in_flight.add_permits(1);
    }

    debug!("ack dispatcher stopped");
}

/// Routes one completion to ack or nack, retrying transient failures.
async fn dispatch_one<C: QueueClient>(ctx: &DispatcherContext<C>, message: &Message) {
    let mut attempt = 0;
    loop {
        let result = if message.nack {
            ctx.client.nack(&ctx.conn, message).await
        } else {
            ctx.client.ack(&ctx.conn, message).await
        };

        match result {
            Ok(()) => {
                trace!(id = %message.id, nack = message.nack, "completion dispatched");
                return;
            }
            Err(error) if error.is_transient() && attempt + 1 < ctx.retry.max_attempts => {
                let delay = ctx.retry.delay_for(attempt);
                attempt += 1;
                warn!(
                    id = %message.id,
                    error = %error,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "acknowledgment failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                // Not worth more attempts; the queue will redeliver.
                warn!(
                    id = %message.id,
                    nack = message.nack,
                    error = %error,
                    "giving up on acknowledgment"
                );
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, InMemoryQueue};
    use crate::types::QueueName;
    use std::time::Duration;

    fn queue_name() -> QueueName {
        QueueName::new("orders")
    }

    fn retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            max_attempts: 3,
        }
    }

    async fn context(
        client: &InMemoryQueue,
        done: &MessageBuffer,
        permits: usize,
    ) -> (DispatcherContext<InMemoryQueue>, Arc<Semaphore>) {
        let queue = queue_name();
        let conn = client.connect(&queue, &queue.dead_letter()).await.unwrap();
        let semaphore = Arc::new(Semaphore::new(permits));
        let ctx = DispatcherContext {
            client: Arc::new(client.clone()),
            conn: Arc::new(conn),
            done: done.clone(),
            in_flight: Arc::clone(&semaphore),
            retry: retry(),
        };
        (ctx, semaphore)
    }

    #[tokio::test]
    async fn routes_on_the_nack_flag_and_restores_permits() {
        let client = InMemoryQueue::new();
        let conn_queue = queue_name();
        client.push(&conn_queue, "keep");
        client.push(&conn_queue, "retry");

        let done = MessageBuffer::new(4);
        let (ctx, semaphore) = context(&client, &done, 0).await;

        let mut messages = client
            .dequeue(&ctx.conn, 2, Duration::from_millis(10))
            .await
            .unwrap();
        let to_nack = {
            let mut m = messages.remove(1);
            m.mark_nack();
            m
        };
        done.try_send(messages.remove(0)).unwrap();
        done.try_send(to_nack).unwrap();
        done.close();

        run_dispatcher(ctx).await;

        let stats = client.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.nacked, 1);
        // One permit restored per completion consumed.
        assert_eq!(semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn transient_ack_failure_is_retried_until_success() {
        let client = InMemoryQueue::new();
        client.push(&queue_name(), "payload");

        let done = MessageBuffer::new(2);
        let (ctx, _semaphore) = context(&client, &done, 0).await;

        let message = client
            .dequeue(&ctx.conn, 1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        client.inject_ack_error(ClientError::Transient {
            reason: "throttled".into(),
        });
        done.try_send(message).unwrap();
        done.close();

        run_dispatcher(ctx).await;

        assert_eq!(client.stats().acked, 1);
    }

    #[tokio::test]
    async fn stale_receipt_is_abandoned_without_retries() {
        let client = InMemoryQueue::new();
        client.push(&queue_name(), "payload");

        let done = MessageBuffer::new(2);
        let (ctx, semaphore) = context(&client, &done, 0).await;

        let mut message = client
            .dequeue(&ctx.conn, 1, Duration::from_millis(10))
            .await
            .unwrap()
            .remove(0);
        // Simulate a redelivery having superseded this receipt.
        message.receipt = crate::types::ReceiptHandle::new("r-stale");
        done.try_send(message).unwrap();
        done.close();

        run_dispatcher(ctx).await;

        // Nothing acked, but the permit was still restored and the
        // dispatcher exited cleanly.
        assert_eq!(client.stats().acked, 0);
        assert_eq!(semaphore.available_permits(), 1);
    }
}
