use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use jobqueue::{
    CancellationToken, JobQueue, JobQueueConfig, JsonSerializer, Queue, QueueConfig, StoreConfig,
};
use serde_json::json;
use tokio::sync::Mutex;

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_pollers_no_loss_no_duplicates() -> anyhow::Result<()> {
    let pollers = env_usize("JOBQUEUE_STRESS_CONCURRENCY", 16);
    let total = env_usize("JOBQUEUE_STRESS_TOTAL", 1000);

    let dir = tempfile::tempdir()?;
    let pool = StoreConfig::new(dir.path().join("stress.db")).open().await?;
    let q = Queue::new(
        pool,
        QueueConfig::new("stress").with_timeout(Duration::from_secs(60)),
    )?;

    let mut sent = HashSet::with_capacity(total);
    for i in 0..total {
        sent.insert(q.send(format!("m{i}").as_bytes(), Duration::ZERO).await?);
    }

    let seen = Arc::new(Mutex::new(HashSet::with_capacity(total)));
    let duplicates = Arc::new(AtomicUsize::new(0));
    let mut tasks = Vec::with_capacity(pollers);
    for _ in 0..pollers {
        let q = q.clone();
        let seen = seen.clone();
        let duplicates = duplicates.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(m) = q.receive().await? {
                if !seen.lock().await.insert(m.id.clone()) {
                    duplicates.fetch_add(1, Ordering::SeqCst);
                }
                q.delete(&m.id).await?;
            }
            anyhow::Ok(())
        }));
    }
    for t in tasks {
        t.await??;
    }

    assert_eq!(duplicates.load(Ordering::SeqCst), 0, "a message was claimed twice");
    assert_eq!(*seen.lock().await, sent, "claimed ids differ from sent ids");
    assert_eq!(q.stats().await?.total, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_processes_every_job_once() -> anyhow::Result<()> {
    let total = env_usize("JOBQUEUE_STRESS_JOBS", 300);

    let dir = tempfile::tempdir()?;
    let pool = StoreConfig::new(dir.path().join("stress.db")).open().await?;
    let config = JobQueueConfig::default()
        .with_max_workers(8)
        .with_poll_interval(Duration::from_millis(5));
    let mut jq = JobQueue::new(pool, "pdp", JsonSerializer::new(), config).await?;

    let shutdown = CancellationToken::new();
    let seen = Arc::new(Mutex::new(Vec::with_capacity(total)));
    {
        let seen = seen.clone();
        let shutdown = shutdown.clone();
        jq.register("aggregate", move |_ctx, payload: serde_json::Value| {
            let seen = seen.clone();
            let shutdown = shutdown.clone();
            async move {
                let n = payload["n"].as_u64().unwrap_or(u64::MAX);
                let mut seen = seen.lock().await;
                seen.push(n);
                if seen.len() == total {
                    shutdown.cancel();
                }
                Ok(())
            }
        })?;
    }

    for n in 0..total {
        jq.enqueue("aggregate", &json!({ "n": n })).await?;
    }
    tokio::time::timeout(Duration::from_secs(60), jq.start(shutdown)).await??;

    let mut seen = seen.lock().await.clone();
    seen.sort_unstable();
    let expected: Vec<u64> = (0..total as u64).collect();
    assert_eq!(seen, expected);
    assert_eq!(jq.queue().stats().await?.total, 0);
    Ok(())
}
