//! # jobqueue
//!
//! Durable job queue and worker pool on a single-writer SQLite store.
//!
//! A storage-provider node runs its asynchronous pipelines (piece
//! aggregation, blob replication, claim publication retries) through this
//! crate. Collaborators register named handlers and enqueue typed payloads,
//! optionally in the same transaction as the domain write that produced the
//! work. The queue gives:
//!
//! - at-least-once delivery with a visibility timeout per claim,
//! - an atomic claim statement, so concurrent pollers never share a message,
//! - a concurrency cap per worker,
//! - heartbeat renewal of a running job's timeout,
//! - cooperative shutdown that drains running jobs.
//!
//! Messages that exhaust their retries stay in the table, unclaimable, until
//! an operator requeues or purges them.

pub mod config;
pub mod db;
pub mod error;
pub mod job_queue;
pub mod models;
pub mod queue;
pub mod serializer;
pub mod worker;

pub use config::{JobQueueConfig, StoreConfig};
pub use error::{Error, Result};
pub use job_queue::JobQueue;
pub use models::{Message, QueueStats};
pub use queue::{Queue, QueueConfig};
pub use serializer::{BincodeSerializer, JsonSerializer, RawSerializer, Serializer};
pub use worker::{Envelope, JobContext, Worker, WorkerConfig};

pub use tokio_util::sync::CancellationToken;
