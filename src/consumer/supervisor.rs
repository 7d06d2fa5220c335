//! Pipeline supervision: wiring, the consumer handle, and orderly shutdown.
//!
//! # Startup
//!
//! `start` validates the configuration, opens the queue connection, creates
//! the two buffers, and spawns the listener pool, the worker pool, and the
//! ack dispatcher as tokio tasks wired together through the buffers. All
//! mutable pipeline state lives inside the returned [`Consumer`]; there is
//! no process-wide state.
//!
//! # Shutdown
//!
//! `stop` drains upstream-to-downstream:
//!
//! 1. raise the stop signal and close the message buffer: listeners stop
//!    fetching and exit; nothing new is admitted;
//! 2. wait for workers: buffered messages are drained where permits allow
//!    and every running handler completes on its own; user code is never
//!    cancelled;
//! 3. close the done channel and wait for the dispatcher to finish
//!    dispatching the completions already written.
//!
//! Once `stop` returns, both channels report closed and no further ack or
//! nack will occur. Completions from background I/O that land after the
//! done channel closes are dropped silently; their messages redeliver via
//! the queue's visibility timeout.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::client::{ClientError, QueueClient, QueueConnection};
use crate::types::QueueName;

use super::buffer::MessageBuffer;
use super::dispatcher::{DispatcherContext, run_dispatcher};
use super::listener::{FatalErrorSlot, ListenerContext, run_listener};
use super::options::{ConsumerOptions, InvalidOptions};
use super::worker::{CompletionSender, Handler, WorkerContext, run_worker};

/// Errors reported synchronously from `start`.
///
/// Nothing else crosses the start/stop boundary; runtime failures are
/// retried internally or parked on the consumer handle.
#[derive(Debug, Error)]
pub enum StartError {
    /// The configuration cannot run (zero sizes, batch larger than buffer).
    #[error(transparent)]
    InvalidOptions(#[from] InvalidOptions),

    /// The queue connection could not be established.
    #[error("queue connection failed: {0}")]
    Connect(#[from] ClientError),
}

/// Task handles for the running pipeline, taken exactly once by `stop`.
struct PipelineTasks {
    listeners: Vec<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    dispatcher: JoinHandle<()>,
}

/// A running consumer pipeline.
///
/// Created by [`start`](crate::start); shut down by
/// [`stop`](crate::stop) or [`Consumer::stop`]. The buffer handles are
/// exposed so callers (and tests) can observe closed state after shutdown.
pub struct Consumer {
    buffer: MessageBuffer,
    done: MessageBuffer,
    stop: CancellationToken,
    conn: Arc<QueueConnection>,
    fatal: FatalErrorSlot,
    tasks: Mutex<Option<PipelineTasks>>,
}

impl Consumer {
    /// The buffer between listeners and workers.
    pub fn message_buffer(&self) -> &MessageBuffer {
        &self.buffer
    }

    /// The channel handlers complete into.
    pub fn done_channel(&self) -> &MessageBuffer {
        &self.done
    }

    /// The connection this consumer fetches from and acknowledges against.
    pub fn connection(&self) -> &QueueConnection {
        &self.conn
    }

    /// A fatal client error reported by a listener mid-run, if any.
    ///
    /// When set, the affected listener has terminated; workers continue
    /// draining in-flight work until idle.
    pub fn fatal_error(&self) -> Option<ClientError> {
        self.fatal.get()
    }

    /// Stops the pipeline, draining in-flight work. Idempotent: calls after
    /// the first are no-ops.
    #[instrument(skip(self), fields(queue = %self.conn.queue()))]
    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            debug!("consumer already stopped");
            return;
        };

        info!("stopping consumer");
        self.stop.cancel();
        self.buffer.close();

        for task in tasks.listeners {
            if task.await.is_err() {
                warn!("listener task panicked during shutdown");
            }
        }
        for task in tasks.workers {
            if task.await.is_err() {
                warn!("worker task panicked during shutdown");
            }
        }

        // Workers are done; whatever is in the done channel now is the last
        // of the completions. Close it and let the dispatcher drain.
        self.done.close();
        if tasks.dispatcher.await.is_err() {
            warn!("dispatcher task panicked during shutdown");
        }

        info!("consumer stopped");
    }
}

/// Builds and launches the pipeline. See [`crate::start`].
#[instrument(skip(client, handler, options), fields(queue = %queue))]
pub(crate) async fn start<C, H>(
    client: C,
    queue: QueueName,
    handler: H,
    options: ConsumerOptions,
) -> Result<Consumer, StartError>
where
    C: QueueClient,
    H: Handler,
{
    options.validate()?;
    if options.buffer_starves_listeners() {
        warn!(
            message_channel_size = options.message_channel_size,
            dequeue_limit = options.dequeue_limit,
            num_listeners = options.num_listeners,
            "buffer smaller than dequeue_limit x num_listeners; some listeners may starve"
        );
    }

    let dead_letter = options.dead_letter_queue(&queue);
    let client = Arc::new(client);
    let conn = Arc::new(client.connect(&queue, &dead_letter).await?);

    let in_flight_limit = options.max_concurrent_work();
    info!(
        dead_letter = %dead_letter,
        listeners = options.num_listeners,
        workers = options.num_workers,
        in_flight = in_flight_limit,
        buffer = options.message_channel_size,
        "starting consumer"
    );

    let buffer = MessageBuffer::new(options.message_channel_size);
    let done = MessageBuffer::new(options.num_workers);
    let in_flight = Arc::new(Semaphore::new(in_flight_limit));
    let stop = CancellationToken::new();
    let fatal = FatalErrorSlot::new();
    let handler = Arc::new(handler);

    let listeners = (0..options.num_listeners)
        .map(|index| {
            let ctx = ListenerContext {
                client: Arc::clone(&client),
                conn: Arc::clone(&conn),
                buffer: buffer.clone(),
                dequeue_limit: options.dequeue_limit,
                poll_timeout: options.poll_timeout,
                retry: options.retry.clone(),
                stop: stop.clone(),
                fatal: fatal.clone(),
            };
            tokio::spawn(run_listener(index, ctx))
        })
        .collect();

    let workers = (0..options.num_workers)
        .map(|index| {
            let ctx = WorkerContext {
                handler: Arc::clone(&handler),
                buffer: buffer.clone(),
                done: CompletionSender::new(done.clone()),
                in_flight: Arc::clone(&in_flight),
                stop: stop.clone(),
            };
            tokio::spawn(run_worker(index, ctx))
        })
        .collect();

    let dispatcher = tokio::spawn(run_dispatcher(DispatcherContext {
        client,
        conn: Arc::clone(&conn),
        done: done.clone(),
        in_flight,
        retry: options.retry.clone(),
    }));

    Ok(Consumer {
        buffer,
        done,
        stop,
        conn,
        fatal,
        tasks: Mutex::new(Some(PipelineTasks {
            listeners,
            workers,
            dispatcher,
        })),
    })
}
