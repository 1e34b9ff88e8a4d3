use crate::db;
use crate::error::Result;
use crate::queue::{DEFAULT_MAX_RECEIVE, DEFAULT_TIMEOUT};
use crate::worker::{DEFAULT_DELETE_TIMEOUT, DEFAULT_POLL_INTERVAL};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Span;

/// Where the message store lives.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self { db_path: cwd.join("jobqueue.db") }
    }
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into() }
    }

    /// Open the single-writer pool and make sure the schema exists.
    pub async fn open(&self) -> Result<SqlitePool> {
        let pool = db::connect(&self.db_path).await?;
        db::ensure_schema(&pool).await?;
        Ok(pool)
    }
}

/// Options for a [`JobQueue`](crate::JobQueue).
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Maximum number of jobs running concurrently.
    pub max_workers: usize,
    /// Claims allowed per message before it is left stuck.
    pub max_retries: u32,
    /// Visibility timeout of a claimed message, renewed while its job runs.
    pub max_timeout: Duration,
    /// Delay between polls of an empty queue.
    pub poll_interval: Duration,
    /// Upper bound on deleting a finished job's message.
    pub delete_timeout: Duration,
    /// Span that all worker log events are recorded in. Defaults to an
    /// `info_span!("jobqueue", queue = ..)`.
    pub span: Option<Span>,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_retries: DEFAULT_MAX_RECEIVE,
            max_timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            span: None,
        }
    }
}

impl JobQueueConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOBQUEUE_MAX_WORKERS` | available parallelism | Max concurrent jobs |
    /// | `JOBQUEUE_MAX_RETRIES` | `3` | Claims per message |
    /// | `JOBQUEUE_MAX_TIMEOUT_MS` | `5000` | Visibility timeout |
    /// | `JOBQUEUE_POLL_INTERVAL_MS` | `100` | Poll interval when idle |
    /// | `JOBQUEUE_DELETE_TIMEOUT_MS` | `5000` | Bound on deleting a finished job |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_workers = env_parse::<usize>("JOBQUEUE_MAX_WORKERS")
            .unwrap_or(defaults.max_workers)
            .max(1);

        let max_retries = env_parse::<u32>("JOBQUEUE_MAX_RETRIES")
            .unwrap_or(defaults.max_retries)
            .max(1);

        let max_timeout = env_parse::<u64>("JOBQUEUE_MAX_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_timeout);

        let poll_interval = env_parse::<u64>("JOBQUEUE_POLL_INTERVAL_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let delete_timeout = env_parse::<u64>("JOBQUEUE_DELETE_TIMEOUT_MS")
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.delete_timeout);

        Self {
            max_workers,
            max_retries,
            max_timeout,
            poll_interval,
            delete_timeout,
            span: None,
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_delete_timeout(mut self, timeout: Duration) -> Self {
        self.delete_timeout = timeout;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
