use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use jobqueue::queue::{DEFAULT_MAX_RECEIVE, DEFAULT_TIMEOUT};
use jobqueue::{
    CancellationToken, Envelope, JobQueue, JobQueueConfig, JsonSerializer, Message, Queue,
    QueueConfig, StoreConfig,
};
use serde_json::Value;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::Duration;

/// Jobqueue CLI interface
#[derive(Parser, Debug)]
#[command(name = "jobqueue", about = "Durable SQLite job queue")]
pub struct Cli {
    /// Path to the SQLite database (default: ./jobqueue.db)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a worker that logs JSON jobs until Ctrl+C
    Work {
        /// Queue name
        queue: String,
        /// Job names to handle (default: log)
        #[arg(long = "job", default_value = "log")]
        jobs: Vec<String>,
        /// Maximum concurrent jobs
        #[arg(long, default_value_t = 4)]
        max_workers: usize,
        /// Claims per message before it is left stuck
        #[arg(long, default_value_t = DEFAULT_MAX_RECEIVE)]
        max_retries: u32,
        /// Visibility timeout in ms, renewed while a job runs
        #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_millis() as u64)]
        max_timeout_ms: u64,
        /// Poll interval in ms when the queue is idle
        #[arg(long, default_value_t = 100)]
        poll_interval_ms: u64,
    },
    /// Enqueue a job with a JSON payload
    Send {
        /// Queue name
        queue: String,
        /// Job name
        job: String,
        /// Inline JSON payload (e.g. '{"k":"v"}')
        #[arg(long)]
        payload: String,
        /// Delay visibility in milliseconds (default: 0)
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Queue inspection and maintenance
    #[command(subcommand)]
    Queue(QueueCommands),
    /// Single message commands
    #[command(subcommand)]
    Message(MessageCommands),
}

#[derive(Args, Debug)]
pub struct QueueArgs {
    /// Queue name
    pub queue: String,
    /// Claims per message before it counts as stuck
    #[arg(long, default_value_t = DEFAULT_MAX_RECEIVE)]
    pub max_receive: u32,
}

/// Queue-related CLI subcommands
#[derive(Subcommand, Debug)]
pub enum QueueCommands {
    /// Show message counts
    Stats(QueueArgs),
    /// List messages in claim order without claiming them
    Peek {
        #[command(flatten)]
        args: QueueArgs,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// List messages that exhausted their retries
    Stuck {
        #[command(flatten)]
        args: QueueArgs,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Make stuck messages claimable again
    RequeueStuck(QueueArgs),
    /// Delete stuck messages
    PurgeStuck(QueueArgs),
}

/// Message-related CLI subcommands
#[derive(Subcommand, Debug)]
pub enum MessageCommands {
    /// Show a message by ID
    Show {
        /// Queue name
        queue: String,
        /// Message ID
        id: String,
    },
    /// Push a message's visibility timeout out by --delay-ms from now
    Extend {
        /// Queue name
        queue: String,
        /// Message ID
        id: String,
        #[arg(long, default_value_t = 30_000)]
        delay_ms: u64,
    },
    /// Delete a message by ID
    Delete {
        /// Queue name
        queue: String,
        /// Message ID
        id: String,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let store = self.db.map(StoreConfig::new).unwrap_or_default();
        let pool = store
            .open()
            .await
            .with_context(|| format!("Failed to open database at {}", store.db_path.display()))?;

        match self.command {
            Commands::Work {
                queue,
                jobs,
                max_workers,
                max_retries,
                max_timeout_ms,
                poll_interval_ms,
            } => {
                let config = JobQueueConfig::default()
                    .with_max_workers(max_workers)
                    .with_max_retries(max_retries)
                    .with_max_timeout(Duration::from_millis(max_timeout_ms))
                    .with_poll_interval(Duration::from_millis(poll_interval_ms));
                run_worker(pool, &queue, &jobs, config).await
            }
            Commands::Send {
                queue,
                job,
                payload,
                delay_ms,
            } => {
                let value: Value =
                    serde_json::from_str(&payload).context("Invalid JSON payload")?;
                let jq = JobQueue::new(pool, &queue, JsonSerializer::new(), JobQueueConfig::default())
                    .await
                    .context("Failed to open job queue")?;
                let id = jq
                    .enqueue_delayed(&job, &value, Duration::from_millis(delay_ms))
                    .await
                    .context("Failed to enqueue job")?;
                println!("Enqueued job '{}' into '{}' as {}", job, queue, id);
                Ok(())
            }
            Commands::Queue(cmd) => run_queue_command(pool, cmd).await,
            Commands::Message(cmd) => run_message_command(pool, cmd).await,
        }
    }
}

async fn run_worker(
    pool: SqlitePool,
    queue: &str,
    jobs: &[String],
    config: JobQueueConfig,
) -> Result<()> {
    let mut jq = JobQueue::<Value>::new(pool, queue, JsonSerializer::new(), config)
        .await
        .context("Failed to open job queue")?;
    for name in jobs {
        jq.register(name.clone(), |ctx, payload: Value| async move {
            tracing::info!(job = %ctx.name, id = %ctx.id, %payload, "handled job");
            Ok(())
        })?;
    }

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C, draining running jobs..."),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {e}"),
        }
        signal.cancel();
    });

    tracing::info!(queue, "Worker running - Use Ctrl+C to quit.");
    jq.start(shutdown).await.context("Worker stopped with an error")
}

fn open_queue(pool: SqlitePool, args: &QueueArgs) -> Result<Queue> {
    let config = QueueConfig::new(args.queue.clone()).with_max_receive(args.max_receive);
    Queue::new(pool, config).context("Invalid queue settings")
}

fn print_message(m: &Message) {
    let job = Envelope::decode(&m.body)
        .map(|e| e.name)
        .unwrap_or_else(|_| "<undecodable>".to_string());
    println!(
        "[id={}] job={} received={} timeout={} created={} bytes={}",
        m.id,
        job,
        m.received,
        m.timeout,
        m.created,
        m.body.len()
    );
}

/// Execute a queue command
async fn run_queue_command(pool: SqlitePool, cmd: QueueCommands) -> Result<()> {
    match cmd {
        QueueCommands::Stats(args) => {
            let q = open_queue(pool, &args)?;
            let s = q.stats().await.context("Error fetching stats")?;
            println!("Queue '{}'", q.name());
            println!(
                "Stats: pending={} delayed={} in_flight={} stuck={} total={}",
                s.pending, s.delayed, s.in_flight, s.stuck, s.total
            );
        }
        QueueCommands::Peek { args, limit } => {
            let q = open_queue(pool, &args)?;
            let msgs = q.peek(limit).await.context("Error peeking messages")?;
            if msgs.is_empty() {
                println!("No messages in '{}'", q.name());
            }
            msgs.iter().for_each(print_message);
        }
        QueueCommands::Stuck { args, limit } => {
            let q = open_queue(pool, &args)?;
            let msgs = q.stuck(limit).await.context("Error listing stuck messages")?;
            if msgs.is_empty() {
                println!("No stuck messages in '{}'", q.name());
            }
            msgs.iter().for_each(print_message);
        }
        QueueCommands::RequeueStuck(args) => {
            let q = open_queue(pool, &args)?;
            let n = q.requeue_stuck().await.context("Error requeueing stuck messages")?;
            println!("Requeued {} stuck message(s) in '{}'", n, q.name());
        }
        QueueCommands::PurgeStuck(args) => {
            let q = open_queue(pool, &args)?;
            let n = q.purge_stuck().await.context("Error purging stuck messages")?;
            println!("Purged {} stuck message(s) from '{}'", n, q.name());
        }
    }
    Ok(())
}

/// Execute a message command
async fn run_message_command(pool: SqlitePool, cmd: MessageCommands) -> Result<()> {
    match cmd {
        MessageCommands::Show { queue, id } => {
            let q = Queue::new(pool, QueueConfig::new(queue))?;
            match q.get(&id).await.context("Error fetching message")? {
                Some(m) => print_message(&m),
                None => anyhow::bail!("Message '{}' not found", id),
            }
        }
        MessageCommands::Extend {
            queue,
            id,
            delay_ms,
        } => {
            let q = Queue::new(pool, QueueConfig::new(queue))?;
            q.extend(&id, Duration::from_millis(delay_ms))
                .await
                .context("Error extending message")?;
            println!("Extended message {} by {}ms", id, delay_ms);
        }
        MessageCommands::Delete { queue, id } => {
            let q = Queue::new(pool, QueueConfig::new(queue))?;
            q.delete(&id).await.context("Error deleting message")?;
            println!("Deleted message {}", id);
        }
    }
    Ok(())
}
