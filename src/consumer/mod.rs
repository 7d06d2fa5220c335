//! The concurrent consumer pipeline.
//!
//! Three stages run at their own rates, coupled by bounded buffers:
//!
//! ```text
//! queue ──► listener_1..N ──► message buffer ──► worker_1..W ──► handler
//!   ▲                         (capacity B)                          │
//!   │                                                               ▼
//!   └──────────── ack dispatcher ◄───── done channel ◄── completion │
//!                 (ack / nack)          (capacity W)
//! ```
//!
//! Listeners long-poll the queue and block when the buffer is full, which
//! is what turns a slow consumer into backpressure on the remote queue.
//! Workers invoke the user handler under an in-flight limit that outlives
//! the worker slot, so handlers may park completions on background I/O.
//! The dispatcher acknowledges completions and recycles in-flight permits.
//!
//! The supervisor wires the stages together at `start` and drains them
//! upstream-to-downstream at `stop`.

mod backoff;
mod buffer;
mod dispatcher;
mod listener;
mod options;
mod supervisor;
mod worker;


pub use backoff::RetryConfig;
pub use buffer::{BufferClosed, MessageBuffer};
pub use options::{ConsumerOptions, InvalidOptions};
pub use supervisor::{Consumer, StartError};
pub use worker::{CompletionSender, Handler};

pub(crate) use supervisor::start;
