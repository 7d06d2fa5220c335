//! Worker pool: handler invocation under two-level concurrency control.
//!
//! Two limits govern processing. The worker count W sizes the CPU budget:
//! at most W handlers are actively running on worker tasks. The in-flight
//! limit M (M ≥ W) bounds handler invocations that have *started* but not
//! yet *completed*, including ones that returned from the worker's call
//! after parking their completion on background I/O.
//!
//! The mechanism: a worker acquires one permit from the in-flight semaphore
//! before taking a message, then deliberately forgets the permit. The permit
//! is restored by the ack dispatcher when the corresponding completion is
//! consumed from the done channel. A handler that clones its
//! [`CompletionSender`] into a spawned task therefore frees its worker slot
//! the moment it returns, but keeps its in-flight permit until the
//! background work completes — the permit, not task identity, tracks
//! outstanding work.
//!
//! A handler that never completes its message leaks one permit; the remote
//! queue's visibility timeout eventually redelivers the message. The pool
//! imposes no handler timeout of its own.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::types::Message;

use super::buffer::MessageBuffer;

/// Write-half of the done channel, handed to every handler invocation.
///
/// A handler must complete each message exactly once, either from within the
/// invocation or later from a task it spawned. Completions sent while the
/// pipeline is shutting down are dropped silently.
#[derive(Debug, Clone)]
pub struct CompletionSender {
    done: MessageBuffer,
}

impl CompletionSender {
    pub(crate) fn new(done: MessageBuffer) -> Self {
        CompletionSender { done }
    }

    /// Completes a message. The ack dispatcher routes it on its `nack` flag:
    /// unset means acknowledge, set means return for redelivery.
    pub async fn complete(&self, message: Message) {
        if self.done.send(message).await.is_err() {
            trace!("done channel closed, dropping completion");
        }
    }

    /// Completes a message marked for redelivery.
    pub async fn nack(&self, mut message: Message) {
        message.mark_nack();
        self.complete(message).await;
    }
}

/// A message processor supplied by the user of the engine.
///
/// Implemented for any `Fn(Message, CompletionSender) -> impl Future` async
/// closure, or manually for processors that carry state.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Processes one message. Must arrange for exactly one completion of
    /// the message via `done`, now or later.
    async fn handle(&self, message: Message, done: CompletionSender);
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Message, CompletionSender) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, message: Message, done: CompletionSender) {
        self(message, done).await;
    }
}

/// Everything one worker task needs.
pub(crate) struct WorkerContext<H> {
    pub handler: Arc<H>,
    pub buffer: MessageBuffer,
    pub done: CompletionSender,
    pub in_flight: Arc<Semaphore>,
    pub stop: CancellationToken,
}

/// Runs one worker slot until the message buffer is closed and drained.
///
/// When the stop signal is raised while the worker is parked waiting for an
/// in-flight permit, it switches to a non-blocking drain of whatever is
/// still buffered and exits.
#[instrument(skip(ctx), fields(worker = index))]
pub(crate) async fn run_worker<H: Handler>(index: usize, ctx: WorkerContext<H>) {
    debug!("worker started");

    loop {
        let permit = tokio::select! {
            _ = ctx.stop.cancelled() => break,
            acquired = Arc::clone(&ctx.in_flight).acquire_owned() => {
                match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                }
            }
        };

        match ctx.buffer.recv().await {
            Some(message) => {
                // Responsibility for this permit transfers to the ack
                // dispatcher, which restores it when the completion lands.
                permit.forget();
                invoke(&ctx, message).await;
            }
            None => {
                drop(permit);
                break;
            }
        }
    }

    // Stop raised: drain buffered messages for which permits are available,
    // without blocking on either resource.
    loop {
        let Ok(permit) = Arc::clone(&ctx.in_flight).try_acquire_owned() else {
            break;
        };
        match ctx.buffer.try_recv() {
            Some(message) => {
                permit.forget();
                invoke(&ctx, message).await;
            }
            None => {
                drop(permit);
                break;
            }
        }
    }

    debug!("worker stopped");
}

/// Invokes the handler on one message, converting a panic into a nack
/// completion so the in-flight permit is not leaked and the message is
/// redelivered promptly instead of waiting out its visibility timeout.
async fn invoke<H: Handler>(ctx: &WorkerContext<H>, message: Message) {
    let retained = message.clone();
    trace!(
        id = %message.id,
        receive_count = message.receive_count,
        "invoking handler"
    );

    let outcome = AssertUnwindSafe(ctx.handler.handle(message, ctx.done.clone()))
        .catch_unwind()
        .await;

    if let Err(panic) = outcome {
        warn!(
            id = %retained.id,
            panic = panic_message(panic.as_ref()),
            "handler panicked, completing as nack"
        );
        ctx.done.nack(retained).await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
}
