//! Consumer configuration.
//!
//! Every knob has a default; `ConsumerOptions::default()` followed by
//! builder-style `with_*` overrides is the expected way to construct one.
//! Sizing defaults derive from the host CPU count: worker slots budget for
//! CPU-bound handler work, listeners are far fewer because a long-polling
//! fetch spends almost all of its time suspended, and the in-flight limit
//! leaves room for handlers that park work on outbound I/O.

use std::num::NonZeroUsize;
use std::time::Duration;

use thiserror::Error;

use crate::types::QueueName;

use super::backoff::RetryConfig;

/// Default capacity of the message buffer between listeners and workers.
const DEFAULT_MESSAGE_CHANNEL_SIZE: usize = 20;

/// Default maximum messages requested per dequeue call.
const DEFAULT_DEQUEUE_LIMIT: usize = 10;

/// Default long-poll duration for dequeue calls.
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 20;

/// In-flight limit multiplier over the worker count.
const IN_FLIGHT_MULTIPLIER: usize = 10;

/// How many workers each listener can keep fed.
const WORKERS_PER_LISTENER: usize = 10;

/// Rejected consumer configuration, reported synchronously from `start`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid consumer options: {reason}")]
pub struct InvalidOptions {
    /// What was wrong with the configuration.
    pub reason: String,
}

impl InvalidOptions {
    fn new(reason: impl Into<String>) -> Self {
        InvalidOptions {
            reason: reason.into(),
        }
    }
}

/// Configuration for a consumer pipeline.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    /// Capacity of the message buffer between listeners and workers.
    pub message_channel_size: usize,

    /// Number of concurrent worker slots.
    pub num_workers: usize,

    /// Number of long-polling listener tasks.
    pub num_listeners: usize,

    /// Maximum messages requested per dequeue call. Must not exceed
    /// `message_channel_size`, or a full batch could never be buffered.
    pub dequeue_limit: usize,

    /// Dead-letter queue to bind on connect. Defaults to
    /// `<queueName>-failed` when unset.
    pub dl_queue_name: Option<QueueName>,

    /// Long-poll duration for dequeue calls.
    pub poll_timeout: Duration,

    /// Pacing for transient-error retries.
    pub retry: RetryConfig,

    /// Explicit in-flight limit; resolved by [`Self::max_concurrent_work`].
    max_concurrent_work: Option<usize>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        let cpus = host_cpus();
        ConsumerOptions {
            message_channel_size: DEFAULT_MESSAGE_CHANNEL_SIZE,
            num_workers: default_num_workers(cpus),
            num_listeners: default_num_listeners(cpus),
            dequeue_limit: DEFAULT_DEQUEUE_LIMIT,
            dl_queue_name: None,
            poll_timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
            retry: RetryConfig::default(),
            max_concurrent_work: None,
        }
    }
}

impl ConsumerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_message_channel_size(mut self, size: usize) -> Self {
        self.message_channel_size = size;
        self
    }

    pub fn with_num_workers(mut self, workers: usize) -> Self {
        self.num_workers = workers;
        self
    }

    pub fn with_num_listeners(mut self, listeners: usize) -> Self {
        self.num_listeners = listeners;
        self
    }

    pub fn with_dequeue_limit(mut self, limit: usize) -> Self {
        self.dequeue_limit = limit;
        self
    }

    /// Sets the in-flight limit. Values below the worker count are raised
    /// to it; the pipeline cannot run with fewer permits than slots.
    pub fn with_max_concurrent_work(mut self, limit: usize) -> Self {
        self.max_concurrent_work = Some(limit);
        self
    }

    pub fn with_dl_queue_name(mut self, name: QueueName) -> Self {
        self.dl_queue_name = Some(name);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The in-flight limit M: how many handler invocations may be started
    /// but not yet completed, including ones suspended on background I/O.
    ///
    /// Defaults to ten invocations per worker slot and never resolves below
    /// the worker count.
    pub fn max_concurrent_work(&self) -> usize {
        self.max_concurrent_work
            .unwrap_or(self.num_workers * IN_FLIGHT_MULTIPLIER)
            .max(self.num_workers)
    }

    /// The dead-letter queue to bind for `queue`.
    pub fn dead_letter_queue(&self, queue: &QueueName) -> QueueName {
        self.dl_queue_name
            .clone()
            .unwrap_or_else(|| queue.dead_letter())
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), InvalidOptions> {
        if self.message_channel_size == 0 {
            return Err(InvalidOptions::new("message_channel_size must be at least 1"));
        }
        if self.num_workers == 0 {
            return Err(InvalidOptions::new("num_workers must be at least 1"));
        }
        if self.num_listeners == 0 {
            return Err(InvalidOptions::new("num_listeners must be at least 1"));
        }
        if self.dequeue_limit == 0 {
            return Err(InvalidOptions::new("dequeue_limit must be at least 1"));
        }
        if self.dequeue_limit > self.message_channel_size {
            return Err(InvalidOptions::new(format!(
                "dequeue_limit ({}) exceeds message_channel_size ({}); a full \
                 batch could never fit in the buffer",
                self.dequeue_limit, self.message_channel_size
            )));
        }
        Ok(())
    }

    /// Whether the buffer is too small for every listener to stage a full
    /// batch, which can starve some listeners behind the room gate.
    pub fn buffer_starves_listeners(&self) -> bool {
        self.message_channel_size < self.dequeue_limit * self.num_listeners
    }
}

/// Worker slots default to one per CPU, leaving one for the runtime.
fn default_num_workers(cpus: usize) -> usize {
    cpus.saturating_sub(1).max(1)
}

/// One listener feeds roughly ten workers; a long poll is idle time.
fn default_num_listeners(cpus: usize) -> usize {
    (cpus.saturating_sub(1) / WORKERS_PER_LISTENER).max(1)
}

fn host_cpus() -> usize {
    std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn defaults_match_host_sizing() {
        let cpus = host_cpus();
        let options = ConsumerOptions::default();

        assert_eq!(options.message_channel_size, 20);
        assert_eq!(options.dequeue_limit, 10);
        assert_eq!(options.num_workers, cpus.saturating_sub(1).max(1));
        assert_eq!(options.num_listeners, (cpus.saturating_sub(1) / 10).max(1));
        assert_eq!(options.max_concurrent_work(), options.num_workers * 10);
        assert_eq!(options.poll_timeout, Duration::from_secs(20));
    }

    #[test]
    fn dead_letter_queue_defaults_to_failed_suffix() {
        let options = ConsumerOptions::default();
        assert_eq!(
            options.dead_letter_queue(&QueueName::new("q")),
            QueueName::new("q-failed")
        );

        let options = options.with_dl_queue_name(QueueName::new("graveyard"));
        assert_eq!(
            options.dead_letter_queue(&QueueName::new("q")),
            QueueName::new("graveyard")
        );
    }

    #[test]
    fn in_flight_limit_never_resolves_below_worker_count() {
        let options = ConsumerOptions::default()
            .with_num_workers(4)
            .with_max_concurrent_work(2);
        assert_eq!(options.max_concurrent_work(), 4);

        let options = ConsumerOptions::default()
            .with_num_workers(4)
            .with_max_concurrent_work(7);
        assert_eq!(options.max_concurrent_work(), 7);
    }

    #[test]
    fn validate_rejects_zero_sizes() {
        for options in [
            ConsumerOptions::default().with_message_channel_size(0),
            ConsumerOptions::default().with_num_workers(0),
            ConsumerOptions::default().with_num_listeners(0),
            ConsumerOptions::default().with_dequeue_limit(0),
        ] {
            assert!(options.validate().is_err());
        }
    }

    #[test]
    fn validate_rejects_batch_larger_than_buffer() {
        let options = ConsumerOptions::default()
            .with_message_channel_size(5)
            .with_dequeue_limit(6);
        let err = options.validate().unwrap_err();
        assert!(err.reason.contains("dequeue_limit"));
    }

    #[test]
    fn starvation_predicate() {
        let options = ConsumerOptions::default()
            .with_message_channel_size(20)
            .with_dequeue_limit(10)
            .with_num_listeners(3);
        assert!(options.buffer_starves_listeners());

        let options = options.with_num_listeners(2);
        assert!(!options.buffer_starves_listeners());
    }

    proptest! {
        /// Sizing floors hold for any CPU count.
        #[test]
        fn prop_default_sizing_floors(cpus in 1usize..512) {
            prop_assert!(default_num_workers(cpus) >= 1);
            prop_assert!(default_num_listeners(cpus) >= 1);
            prop_assert!(default_num_listeners(cpus) <= default_num_workers(cpus).max(1));
        }

        /// The resolved in-flight limit always dominates the worker count.
        #[test]
        fn prop_in_flight_limit_dominates_workers(
            workers in 1usize..64,
            explicit in proptest::option::of(0usize..512),
        ) {
            let mut options = ConsumerOptions::default().with_num_workers(workers);
            if let Some(limit) = explicit {
                options = options.with_max_concurrent_work(limit);
            }
            prop_assert!(options.max_concurrent_work() >= workers);
        }
    }
}
