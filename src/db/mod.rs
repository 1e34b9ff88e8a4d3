use crate::models::{Message, QueueStats};
use sqlx::{
    Executor, Sqlite, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{path::Path, time::Duration};

/// Idempotent DDL for the message table shared by all logical queues.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobqueue (
    id TEXT PRIMARY KEY NOT NULL,
    queue TEXT NOT NULL,
    body BLOB NOT NULL,
    timeout INTEGER NOT NULL,
    received INTEGER NOT NULL DEFAULT 0,
    created INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER) * 1000)
);
CREATE INDEX IF NOT EXISTS jobqueue_queue_created_idx ON jobqueue (queue, created);
"#;

const COLUMNS: &str = "id, queue, body, timeout, received, created";

/// Open (creating if missing) the SQLite database at `path`.
///
/// The pool holds a single connection: SQLite serializes writers anyway, and
/// keeping one connection makes every claim transaction strictly ordered.
pub async fn connect(path: &Path) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Create the table and index if they do not exist yet.
pub async fn ensure_schema(pool: &SqlitePool) -> sqlx::Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

pub async fn insert_message<'e, E>(
    executor: E,
    id: &str,
    queue: &str,
    body: &[u8],
    timeout_ms: i64,
    created_ms: i64,
) -> sqlx::Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO jobqueue (id, queue, body, timeout, received, created) VALUES (?, ?, ?, ?, 0, ?)",
    )
    .bind(id)
    .bind(queue)
    .bind(body)
    .bind(timeout_ms)
    .bind(created_ms)
    .execute(executor)
    .await?;
    Ok(())
}

/// Claim the oldest eligible message of `queue` in a single statement.
///
/// Eligible means `timeout <= now_ms` and `received < max_receive`. The claimed
/// row gets `received + 1` and `timeout = new_timeout_ms`.
pub async fn claim_message<'e, E>(
    executor: E,
    queue: &str,
    now_ms: i64,
    new_timeout_ms: i64,
    max_receive: i64,
) -> sqlx::Result<Option<Message>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, Message>(&format!(
        "UPDATE jobqueue
         SET timeout = ?, received = received + 1
         WHERE id = (
             SELECT id FROM jobqueue
             WHERE queue = ?
               AND timeout <= ?
               AND received < ?
             ORDER BY created, rowid
             LIMIT 1
         )
         RETURNING {COLUMNS}"
    ))
    .bind(new_timeout_ms)
    .bind(queue)
    .bind(now_ms)
    .bind(max_receive)
    .fetch_optional(executor)
    .await
}

/// Set a message's visibility timeout, whatever its current value.
///
/// Every single-message statement is scoped to `queue`, so an id from another
/// logical queue matches nothing.
pub async fn extend_message<'e, E>(
    executor: E,
    queue: &str,
    id: &str,
    timeout_ms: i64,
) -> sqlx::Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query("UPDATE jobqueue SET timeout = ? WHERE id = ? AND queue = ?")
        .bind(timeout_ms)
        .bind(id)
        .bind(queue)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

pub async fn delete_message<'e, E>(executor: E, queue: &str, id: &str) -> sqlx::Result<u64>
where
    E: Executor<'e, Database = Sqlite>,
{
    let res = sqlx::query("DELETE FROM jobqueue WHERE id = ? AND queue = ?")
        .bind(id)
        .bind(queue)
        .execute(executor)
        .await?;
    Ok(res.rows_affected())
}

pub async fn get_message(
    pool: &SqlitePool,
    queue: &str,
    id: &str,
) -> sqlx::Result<Option<Message>> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {COLUMNS} FROM jobqueue WHERE id = ? AND queue = ?"
    ))
    .bind(id)
    .bind(queue)
    .fetch_optional(pool)
    .await
}

/// List messages of a queue in claim order, without claiming them.
pub async fn peek_messages(
    pool: &SqlitePool,
    queue: &str,
    limit: i64,
) -> sqlx::Result<Vec<Message>> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {COLUMNS} FROM jobqueue
         WHERE queue = ?
         ORDER BY created, rowid
         LIMIT ?"
    ))
    .bind(queue)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// List messages that exhausted their receive budget.
pub async fn stuck_messages(
    pool: &SqlitePool,
    queue: &str,
    max_receive: i64,
    limit: i64,
) -> sqlx::Result<Vec<Message>> {
    sqlx::query_as::<_, Message>(&format!(
        "SELECT {COLUMNS} FROM jobqueue
         WHERE queue = ? AND received >= ?
         ORDER BY created, rowid
         LIMIT ?"
    ))
    .bind(queue)
    .bind(max_receive)
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn queue_stats(
    pool: &SqlitePool,
    queue: &str,
    now_ms: i64,
    max_receive: i64,
) -> sqlx::Result<QueueStats> {
    let (pending, delayed, in_flight, stuck, total): (i64, i64, i64, i64, i64) = sqlx::query_as(
        "SELECT
             COALESCE(SUM(CASE WHEN received < ?2 AND timeout <= ?1 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN received = 0 AND timeout > ?1 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN received > 0 AND received < ?2 AND timeout > ?1 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN received >= ?2 THEN 1 ELSE 0 END), 0),
             COUNT(*)
         FROM jobqueue
         WHERE queue = ?3",
    )
    .bind(now_ms)
    .bind(max_receive)
    .bind(queue)
    .fetch_one(pool)
    .await?;
    Ok(QueueStats { pending, delayed, in_flight, stuck, total })
}

/// Make stuck messages claimable again by resetting their receive count.
pub async fn requeue_stuck(
    pool: &SqlitePool,
    queue: &str,
    max_receive: i64,
    now_ms: i64,
) -> sqlx::Result<u64> {
    let res = sqlx::query(
        "UPDATE jobqueue SET received = 0, timeout = ? WHERE queue = ? AND received >= ?",
    )
    .bind(now_ms)
    .bind(queue)
    .bind(max_receive)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

pub async fn purge_stuck(pool: &SqlitePool, queue: &str, max_receive: i64) -> sqlx::Result<u64> {
    let res = sqlx::query("DELETE FROM jobqueue WHERE queue = ? AND received >= ?")
        .bind(queue)
        .bind(max_receive)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}
