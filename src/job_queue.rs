//! The object collaborators use: register handlers, enqueue payloads, run.

use crate::config::JobQueueConfig;
use crate::db;
use crate::error::{Error, Result};
use crate::queue::{Queue, QueueConfig};
use crate::serializer::Serializer;
use crate::worker::{JobContext, Worker, WorkerConfig};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info_span;

/// A named job queue with its worker.
///
/// ```ignore
/// let pool = StoreConfig::new("node.db").open().await?;
/// let mut jobs = JobQueue::new(
///     pool,
///     "replication",
///     JsonSerializer::<Transfer>::new(),
///     JobQueueConfig::default().with_max_workers(4),
/// )
/// .await?;
/// jobs.register("transfer", |ctx, t: Transfer| async move { replicate(ctx, t).await })?;
///
/// let shutdown = CancellationToken::new();
/// jobs.enqueue("transfer", &transfer).await?;
/// jobs.start(shutdown.clone()).await?;
/// ```
pub struct JobQueue<T> {
    worker: Worker<T>,
}

impl<T: Send + 'static> JobQueue<T> {
    /// Create the schema if needed and build the queue and its worker.
    ///
    /// `max_retries` becomes the queue's `max_receive`; `max_timeout` is both
    /// the claim timeout and the heartbeat extension.
    pub async fn new<S>(
        pool: SqlitePool,
        name: impl Into<String>,
        serializer: S,
        config: JobQueueConfig,
    ) -> Result<Self>
    where
        S: Serializer<T> + 'static,
    {
        let name = name.into();
        if config.max_workers == 0 {
            return Err(Error::InvalidConfig("max workers must be at least 1".into()));
        }

        let queue = Queue::new(
            pool,
            QueueConfig::new(name.clone())
                .with_timeout(config.max_timeout)
                .with_max_receive(config.max_retries),
        )?;
        let worker_config = WorkerConfig::default()
            .with_job_count_limit(config.max_workers)
            .with_poll_interval(config.poll_interval)
            .with_extend(config.max_timeout)
            .with_delete_timeout(config.delete_timeout);
        let span = config
            .span
            .unwrap_or_else(|| info_span!("jobqueue", queue = %name));
        let worker = Worker::new(queue, Arc::new(serializer), worker_config, span)?;

        db::ensure_schema(worker.queue().pool()).await?;
        Ok(Self { worker })
    }

    /// Register `handler` for jobs named `name`.
    pub fn register<F, Fut>(&mut self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(JobContext, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.worker.register(name, handler)
    }

    /// Enqueue a job. Returns the message id.
    pub async fn enqueue(&self, name: &str, payload: &T) -> Result<String> {
        self.worker.enqueue(name, payload).await
    }

    /// Enqueue a job that becomes visible after `delay`.
    pub async fn enqueue_delayed(&self, name: &str, payload: &T, delay: Duration) -> Result<String> {
        self.worker.enqueue_delayed(name, payload, delay).await
    }

    /// Enqueue a job as part of the caller's transaction, so it is only
    /// visible if the surrounding domain write commits.
    pub async fn enqueue_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        name: &str,
        payload: &T,
    ) -> Result<String> {
        self.worker.enqueue_tx(tx, name, payload).await
    }

    /// Process jobs until `shutdown` is cancelled and running jobs drained.
    ///
    /// A claimed message naming a job with no registered handler stops the
    /// worker: it claims nothing further, drains running jobs and returns
    /// [`Error::UnregisteredJob`]. The message stays in the queue.
    pub async fn start(&self, shutdown: CancellationToken) -> Result<()> {
        self.worker.start(shutdown).await
    }

    /// The underlying queue, for inspection and operator actions.
    pub fn queue(&self) -> &Queue {
        self.worker.queue()
    }

    /// Number of jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.worker.in_flight()
    }
}
