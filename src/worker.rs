//! Job worker: polls a [`Queue`], runs registered handlers concurrently and
//! keeps their messages hidden while they run.
//!
//! Delivery is at-least-once. A message is deleted only after its handler
//! returns `Ok`; on error or panic it stays in the table and is claimed again
//! once its visibility timeout lapses, until the queue's `max_receive` is
//! spent. Handlers must therefore be idempotent.

use crate::error::{Error, Result};
use crate::models::Message;
use crate::queue::Queue;
use crate::serializer::{self, Serializer};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, Transaction};
use std::any::Any;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinSet};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};

/// Default delay between polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default visibility extension applied by the heartbeat.
pub const DEFAULT_EXTEND: Duration = Duration::from_secs(5);

/// Default bound on deleting a finished job's message.
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(5);

const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum number of jobs running at once.
    pub job_count_limit: usize,
    /// Delay between polls when the queue is empty or the worker is full.
    pub poll_interval: Duration,
    /// Visibility pushed onto a running job's message by each heartbeat.
    pub extend: Duration,
    /// Upper bound on deleting a message after its job succeeded.
    pub delete_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_count_limit: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            poll_interval: DEFAULT_POLL_INTERVAL,
            extend: DEFAULT_EXTEND,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
        }
    }
}

impl WorkerConfig {
    pub fn with_job_count_limit(mut self, limit: usize) -> Self {
        self.job_count_limit = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_extend(mut self, extend: Duration) -> Self {
        self.extend = extend;
        self
    }

    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    /// Interval between heartbeats: a fifth of `extend` is kept as slack so
    /// the extension lands before the previous one lapses.
    pub fn heartbeat_period(&self) -> Duration {
        self.extend - self.extend / 5
    }

    fn validate(&self) -> Result<()> {
        if self.job_count_limit == 0 {
            return Err(Error::InvalidConfig("job count limit must be at least 1".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::InvalidConfig("poll interval must be positive".into()));
        }
        if self.extend < Duration::from_millis(1) {
            return Err(Error::InvalidConfig("extend must be at least 1ms".into()));
        }
        if self.delete_timeout.is_zero() {
            return Err(Error::InvalidConfig("delete timeout must be positive".into()));
        }
        Ok(())
    }
}

/// Body of every message the worker sends: the job name plus the serialized
/// payload. Only this wrapper is interpreted by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub name: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serializer::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serializer::decode(bytes)
    }
}

/// What a handler knows about the job it is running.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Id of the underlying message.
    pub id: String,
    /// Registered job name.
    pub name: String,
    /// How many times the message has been claimed, this run included.
    pub received: i64,
    cancel: CancellationToken,
}

impl JobContext {
    /// Fires when the worker is shutting down. Handlers are not interrupted;
    /// long-running ones should watch this and return early.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

/// Type-erased job handler.
pub type Handler<T> =
    Arc<dyn Fn(JobContext, T) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Polls a queue and runs registered handlers.
pub struct Worker<T> {
    queue: Queue,
    serializer: Arc<dyn Serializer<T>>,
    handlers: HashMap<String, Handler<T>>,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
    span: Span,
}

impl<T: Send + 'static> Worker<T> {
    /// Create a worker. All of its log events are emitted inside `span`.
    pub fn new(
        queue: Queue,
        serializer: Arc<dyn Serializer<T>>,
        config: WorkerConfig,
        span: Span,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            queue,
            serializer,
            handlers: HashMap::new(),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            span,
        })
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Register `handler` for jobs named `name`. Fails if the name is taken.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let span = self.span.clone();
        match self.handlers.entry(name.into()) {
            Entry::Occupied(e) => Err(Error::DuplicateJob(e.key().clone())),
            Entry::Vacant(e) => {
                debug!(parent: &span, job = %e.key(), "registered job handler");
                e.insert(Arc::new(move |ctx: JobContext, payload: T| {
                    handler(ctx, payload).boxed()
                }));
                Ok(())
            }
        }
    }

    /// Enqueue a job for immediate processing. Returns the message id.
    pub async fn enqueue(&self, name: &str, payload: &T) -> Result<String> {
        self.enqueue_delayed(name, payload, Duration::ZERO).await
    }

    /// Enqueue a job that becomes visible after `delay`.
    pub async fn enqueue_delayed(&self, name: &str, payload: &T, delay: Duration) -> Result<String> {
        let body = self.envelope(name, payload)?;
        self.queue.send(&body, delay).await
    }

    /// Enqueue a job inside the caller's transaction.
    pub async fn enqueue_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
        payload: &T,
    ) -> Result<String> {
        let body = self.envelope(name, payload)?;
        self.queue.send_tx(tx, &body, Duration::ZERO).await
    }

    fn envelope(&self, name: &str, payload: &T) -> Result<Vec<u8>> {
        Envelope {
            name: name.to_string(),
            payload: self.serializer.serialize(payload)?,
        }
        .encode()
    }

    /// Run the poll loop until `shutdown` is cancelled, then wait for every
    /// running job to finish.
    ///
    /// Returns [`Error::UnregisteredJob`] (after draining) if a message names a
    /// job this worker has no handler for.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.run(shutdown).instrument(self.span.clone()).await
    }

    async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let poll_interval = self.config.poll_interval;
        info!(
            limit = self.config.job_count_limit,
            poll_interval_ms = poll_interval.as_millis() as u64,
            extend_ms = self.config.extend.as_millis() as u64,
            "job worker started"
        );

        let mut jobs = JoinSet::new();
        let outcome = loop {
            while let Some(res) = jobs.try_join_next() {
                log_join_result(res);
            }

            if shutdown.is_cancelled() {
                break Ok(());
            }

            if self.in_flight() >= self.config.job_count_limit {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = sleep(poll_interval) => {}
                }
                continue;
            }

            let msg = match self.queue.receive_and_wait(&shutdown, poll_interval).await {
                Ok(msg) => msg,
                Err(Error::Cancelled) => continue,
                Err(e) => {
                    error!(error = %e, "failed to receive message");
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = sleep(STORE_ERROR_BACKOFF) => {}
                    }
                    continue;
                }
            };

            if let Err(e) = self.dispatch(msg, &shutdown, &mut jobs) {
                break Err(e);
            }
        };

        if !jobs.is_empty() {
            info!(jobs = jobs.len(), "waiting for running jobs to finish");
        }
        while let Some(res) = jobs.join_next().await {
            log_join_result(res);
        }
        info!("job worker stopped");
        outcome
    }

    /// Decode a claimed message and spawn its job.
    fn dispatch(
        &self,
        msg: Message,
        shutdown: &CancellationToken,
        jobs: &mut JoinSet<()>,
    ) -> Result<()> {
        let envelope = match Envelope::decode(&msg.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(id = %msg.id, error = %e, "failed to decode message envelope, skipping");
                return Ok(());
            }
        };

        let Some(handler) = self.handlers.get(&envelope.name).cloned() else {
            error!(id = %msg.id, job = %envelope.name, "no handler registered for job");
            return Err(Error::UnregisteredJob(envelope.name));
        };

        let payload = match self.serializer.deserialize(&envelope.payload) {
            Ok(payload) => payload,
            Err(e) => {
                error!(id = %msg.id, job = %envelope.name, error = %e, "failed to deserialize job payload, skipping");
                return Ok(());
            }
        };

        let span = info_span!(
            parent: &self.span,
            "job",
            id = %msg.id,
            name = %envelope.name,
            received = msg.received
        );
        let job = Job {
            queue: self.queue.clone(),
            handler,
            ctx: JobContext {
                id: msg.id,
                name: envelope.name,
                received: msg.received,
                cancel: shutdown.child_token(),
            },
            extend: self.config.extend,
            heartbeat_period: self.config.heartbeat_period(),
            delete_timeout: self.config.delete_timeout,
            max_receive: i64::from(self.queue.config().max_receive),
        };
        let guard = InFlight::acquire(&self.in_flight);
        jobs.spawn(
            async move {
                let _guard = guard;
                job.run(payload).await;
            }
            .instrument(span),
        );
        Ok(())
    }
}

/// One claimed message on its way through a handler.
struct Job<T> {
    queue: Queue,
    handler: Handler<T>,
    ctx: JobContext,
    extend: Duration,
    heartbeat_period: Duration,
    delete_timeout: Duration,
    max_receive: i64,
}

impl<T: Send + 'static> Job<T> {
    async fn run(self, payload: T) {
        let Job {
            queue,
            handler,
            ctx,
            extend,
            heartbeat_period,
            delete_timeout,
            max_receive,
        } = self;
        let id = ctx.id.clone();
        let received = ctx.received;
        let started = Instant::now();
        debug!("running job");

        // The heartbeat is stopped by the job finishing, not by shutdown, so a
        // job that is still draining keeps its message hidden.
        let stop = CancellationToken::new();
        let beat = tokio::spawn(
            heartbeat(queue.clone(), id.clone(), extend, heartbeat_period, stop.clone())
                .instrument(Span::current()),
        );

        let outcome = AssertUnwindSafe(async move { handler(ctx, payload).await })
            .catch_unwind()
            .await;

        stop.cancel();
        if let Err(e) = beat.await {
            warn!(error = %e, "heartbeat task failed");
        }

        let result = outcome.unwrap_or_else(|panic| {
            Err(anyhow::anyhow!("job panicked: {}", panic_message(panic.as_ref())))
        });
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => match tokio::time::timeout(delete_timeout, queue.delete(&id)).await {
                Ok(Ok(())) => info!(duration_ms, "job completed"),
                Ok(Err(e)) => {
                    error!(error = %e, "job completed but its message could not be deleted, it will run again")
                }
                Err(_) => error!(
                    timeout_ms = delete_timeout.as_millis() as u64,
                    "job completed but deleting its message timed out, it may run again"
                ),
            },
            Err(e) if received >= max_receive => {
                error!(
                    error = %format!("{e:#}"),
                    received,
                    max_receive,
                    duration_ms,
                    "job failed permanently, message left in queue"
                );
            }
            Err(e) => {
                warn!(
                    error = %format!("{e:#}"),
                    received,
                    max_receive,
                    duration_ms,
                    "job failed, will be retried"
                );
            }
        }
    }
}

/// Push the message's visibility out every `period` until `stop` fires.
async fn heartbeat(
    queue: Queue,
    id: String,
    extend: Duration,
    period: Duration,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(period) => {}
        }
        match queue.extend(&id, extend).await {
            Ok(()) => debug!(extend_ms = extend.as_millis() as u64, "extended job timeout"),
            Err(e) => warn!(error = %e, "failed to extend job timeout"),
        }
    }
}

/// Counts a running job for as long as it is alive, whichever way it exits.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn log_join_result(res: std::result::Result<(), JoinError>) {
    if let Err(e) = res {
        error!(error = ?e, "job task aborted");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueConfig;
    use crate::serializer::RawSerializer;
    use sqlx::SqlitePool;

    fn lazy_queue() -> Queue {
        let pool = SqlitePool::connect_lazy("sqlite::memory:").unwrap();
        Queue::new(pool, QueueConfig::new("unit")).unwrap()
    }

    fn worker() -> Worker<Vec<u8>> {
        Worker::new(
            lazy_queue(),
            Arc::new(RawSerializer),
            WorkerConfig::default(),
            Span::none(),
        )
        .unwrap()
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
        assert_eq!(config.extend, DEFAULT_EXTEND);
        assert!(config.job_count_limit >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_worker_config_rejects_zero_values() {
        let zero_limit = WorkerConfig::default().with_job_count_limit(0);
        assert!(matches!(zero_limit.validate(), Err(Error::InvalidConfig(_))));
        let zero_poll = WorkerConfig::default().with_poll_interval(Duration::ZERO);
        assert!(zero_poll.validate().is_err());
        let zero_extend = WorkerConfig::default().with_extend(Duration::ZERO);
        assert!(zero_extend.validate().is_err());
        let sub_ms_extend = WorkerConfig::default().with_extend(Duration::from_micros(900));
        assert!(matches!(sub_ms_extend.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_heartbeat_period_leaves_a_fifth_of_slack() {
        let config = WorkerConfig::default().with_extend(Duration::from_millis(125));
        assert_eq!(config.heartbeat_period(), Duration::from_millis(100));
    }

    #[test]
    fn test_envelope_decode_rejects_garbage() {
        let err = Envelope::decode(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let bytes = Envelope {
            name: "replicate".into(),
            payload: b"blob".to_vec(),
        }
        .encode()
        .unwrap();
        let env = Envelope::decode(&bytes).unwrap();
        assert_eq!(env.name, "replicate");
        assert_eq!(env.payload, b"blob");
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_names() {
        let mut w = worker();
        w.register("aggregate", |_ctx, _p| async { Ok(()) }).unwrap();
        let err = w
            .register("aggregate", |_ctx, _p| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateJob(name) if name == "aggregate"));
        w.register("replicate", |_ctx, _p| async { Ok(()) }).unwrap();
    }

    #[test]
    fn test_in_flight_guard_decrements_on_drop() {
        let counter = Arc::new(AtomicUsize::new(0));
        let a = InFlight::acquire(&counter);
        let b = InFlight::acquire(&counter);
        assert_eq!(counter.load(Ordering::Acquire), 2);
        drop(a);
        assert_eq!(counter.load(Ordering::Acquire), 1);
        drop(b);
        assert_eq!(counter.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_panic_message_handles_str_and_string() {
        let p: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(p.as_ref()), "boom");
        let p: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(p.as_ref()), "bang");
        let p: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(p.as_ref()), "unknown panic payload");
    }
}
