//! A concurrent message-consumer engine for queues with at-least-once
//! delivery semantics: long-poll dequeue, visibility timeout, explicit
//! acknowledgment, and dead-letter redirection.
//!
//! The engine decouples fetching, processing, and acknowledging so each can
//! run at its own natural rate. A pool of listeners long-polls the queue in
//! batches; a bounded buffer couples them to a worker pool and pushes
//! backpressure to the remote queue; workers invoke a user handler under a
//! two-level concurrency model (worker slots for CPU, a larger in-flight
//! limit for handlers suspended on I/O); an ack dispatcher routes handler
//! completions back to the queue as acks or nacks.
//!
//! Delivery is at-least-once and unordered: handlers must be idempotent and
//! must not assume messages arrive in enqueue order.
//!
//! # Example
//!
//! ```no_run
//! use conveyor::{CompletionSender, ConsumerOptions, InMemoryQueue, Message, QueueName};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), conveyor::StartError> {
//! let queue = InMemoryQueue::new();
//! queue.push(&QueueName::new("orders"), r#"{"order":1}"#);
//!
//! let consumer = conveyor::start(
//!     queue,
//!     QueueName::new("orders"),
//!     |message: Message, done: CompletionSender| async move {
//!         println!("processing {}", message.body);
//!         done.complete(message).await;
//!     },
//!     ConsumerOptions::default(),
//! )
//! .await?;
//!
//! // ... later:
//! conveyor::stop(&consumer).await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod consumer;
pub mod types;

pub use client::{ClientError, InMemoryQueue, QueueClient, QueueConnection, QueueStats};
pub use consumer::{
    CompletionSender, Consumer, ConsumerOptions, Handler, InvalidOptions, MessageBuffer,
    RetryConfig, StartError,
};
pub use types::{Message, MessageId, QueueName, ReceiptHandle};

/// Connects to `queue_name` and launches a consumer pipeline that feeds
/// `handler`.
///
/// Misconfiguration and connection failures are the only errors reported
/// here; everything that can go wrong later is retried internally or parked
/// on the returned [`Consumer`].
pub async fn start<C, H>(
    client: C,
    queue_name: QueueName,
    handler: H,
    options: ConsumerOptions,
) -> Result<Consumer, StartError>
where
    C: QueueClient,
    H: Handler,
{
    consumer::start(client, queue_name, handler, options).await
}

/// Stops a consumer, draining in-flight work before returning.
///
/// Equivalent to [`Consumer::stop`]; idempotent.
pub async fn stop(consumer: &Consumer) {
    consumer.stop().await;
}
