//! Typed API over the message store: send, claim, extend, delete.

use crate::db;
use crate::error::{Error, Result};
use crate::models::{Message, QueueStats};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Default visibility timeout applied when a message is claimed.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of claims before a message is considered stuck.
pub const DEFAULT_MAX_RECEIVE: u32 = 3;

/// Settings for one logical queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Logical queue name; isolates messages sharing the table.
    pub name: String,
    /// Visibility timeout pushed onto a message each time it is claimed.
    pub timeout: Duration,
    /// Claims allowed before a message becomes permanently ineligible.
    pub max_receive: u32,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: DEFAULT_TIMEOUT,
            max_receive: DEFAULT_MAX_RECEIVE,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_receive(mut self, max_receive: u32) -> Self {
        self.max_receive = max_receive;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("queue name must not be empty".into()));
        }
        if self.timeout < Duration::from_millis(1) {
            return Err(Error::InvalidConfig("queue timeout must be at least 1ms".into()));
        }
        if self.max_receive == 0 {
            return Err(Error::InvalidConfig("max receive must be at least 1".into()));
        }
        to_millis(self.timeout)?;
        Ok(())
    }
}

/// A logical queue backed by the shared `jobqueue` table.
///
/// Cloning is cheap; clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct Queue {
    pool: SqlitePool,
    config: QueueConfig,
}

impl Queue {
    /// Build a queue over `pool`. The schema must already exist, see
    /// [`db::ensure_schema`].
    pub fn new(pool: SqlitePool, config: QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { pool, config })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Store `body`, invisible to receivers until `delay` has elapsed.
    pub async fn send(&self, body: &[u8], delay: Duration) -> Result<String> {
        let (id, now, timeout) = self.new_message(delay)?;
        db::insert_message(&self.pool, &id, &self.config.name, body, timeout, now).await?;
        debug!(queue = %self.config.name, %id, "sent message");
        Ok(id)
    }

    /// Like [`Queue::send`], inside the caller's transaction. The message only
    /// becomes visible if the transaction commits.
    pub async fn send_tx(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        body: &[u8],
        delay: Duration,
    ) -> Result<String> {
        let (id, now, timeout) = self.new_message(delay)?;
        db::insert_message(&mut **tx, &id, &self.config.name, body, timeout, now).await?;
        debug!(queue = %self.config.name, %id, "sent message in transaction");
        Ok(id)
    }

    /// Claim the oldest eligible message, or `None` if nothing is eligible.
    pub async fn receive(&self) -> Result<Option<Message>> {
        let now = now_millis()?;
        let timeout = checked_deadline(now, self.config.timeout)?;
        let mut tx = self.pool.begin().await?;
        let msg = db::claim_message(
            &mut *tx,
            &self.config.name,
            now,
            timeout,
            i64::from(self.config.max_receive),
        )
        .await?;
        tx.commit().await?;
        if let Some(m) = &msg {
            trace!(queue = %self.config.name, id = %m.id, received = m.received, "claimed message");
        }
        Ok(msg)
    }

    /// Poll [`Queue::receive`] every `poll_interval` until a message is claimed
    /// or `cancel` fires, in which case [`Error::Cancelled`] is returned.
    pub async fn receive_and_wait(
        &self,
        cancel: &CancellationToken,
        poll_interval: Duration,
    ) -> Result<Message> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidDuration("poll interval must be positive".into()));
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            if let Some(msg) = self.receive().await? {
                return Ok(msg);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = ticker.tick() => {}
            }
        }
    }

    /// Push the visibility timeout of `id` to `now + delay`. Ids belonging to
    /// another queue are left untouched.
    pub async fn extend(&self, id: &str, delay: Duration) -> Result<()> {
        let timeout = checked_deadline(now_millis()?, delay)?;
        let mut tx = self.pool.begin().await?;
        db::extend_message(&mut *tx, &self.config.name, id, timeout).await?;
        tx.commit().await?;
        trace!(queue = %self.config.name, %id, "extended message");
        Ok(())
    }

    /// Remove `id` from this queue. Deleting an unknown id is not an error.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        db::delete_message(&mut *tx, &self.config.name, id).await?;
        tx.commit().await?;
        debug!(queue = %self.config.name, %id, "deleted message");
        Ok(())
    }

    /// Fetch a message of this queue by id without claiming it.
    pub async fn get(&self, id: &str) -> Result<Option<Message>> {
        Ok(db::get_message(&self.pool, &self.config.name, id).await?)
    }

    /// List up to `limit` messages in claim order without claiming them.
    pub async fn peek(&self, limit: i64) -> Result<Vec<Message>> {
        Ok(db::peek_messages(&self.pool, &self.config.name, limit).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let now = now_millis()?;
        Ok(db::queue_stats(&self.pool, &self.config.name, now, self.max_receive()).await?)
    }

    /// List up to `limit` messages that exhausted `max_receive`.
    pub async fn stuck(&self, limit: i64) -> Result<Vec<Message>> {
        Ok(db::stuck_messages(&self.pool, &self.config.name, self.max_receive(), limit).await?)
    }

    /// Reset stuck messages so they are claimable again. Returns how many.
    pub async fn requeue_stuck(&self) -> Result<u64> {
        let now = now_millis()?;
        let n = db::requeue_stuck(&self.pool, &self.config.name, self.max_receive(), now).await?;
        debug!(queue = %self.config.name, requeued = n, "requeued stuck messages");
        Ok(n)
    }

    /// Delete stuck messages. Returns how many.
    pub async fn purge_stuck(&self) -> Result<u64> {
        let n = db::purge_stuck(&self.pool, &self.config.name, self.max_receive()).await?;
        debug!(queue = %self.config.name, purged = n, "purged stuck messages");
        Ok(n)
    }

    fn max_receive(&self) -> i64 {
        i64::from(self.config.max_receive)
    }

    fn new_message(&self, delay: Duration) -> Result<(String, i64, i64)> {
        let now = now_millis()?;
        let timeout = checked_deadline(now, delay)?;
        Ok((new_message_id(), now, timeout))
    }
}

fn new_message_id() -> String {
    format!("m_{}", uuid::Uuid::new_v4().simple())
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> Result<i64> {
    let ms = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis();
    i64::try_from(ms).map_err(|_| Error::InvalidDuration("system clock out of range".into()))
}

/// Whole milliseconds in `d`, rounded up so a non-zero duration never
/// collapses to an instant.
fn to_millis(d: Duration) -> Result<i64> {
    i64::try_from(d.as_nanos().div_ceil(1_000_000))
        .map_err(|_| Error::InvalidDuration(format!("{d:?} does not fit in milliseconds")))
}

fn checked_deadline(now: i64, delay: Duration) -> Result<i64> {
    now.checked_add(to_millis(delay)?)
        .ok_or_else(|| Error::InvalidDuration(format!("{delay:?} overflows the clock")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let cfg = QueueConfig::new("jobs");
        assert_eq!(cfg.timeout, DEFAULT_TIMEOUT);
        assert_eq!(cfg.max_receive, DEFAULT_MAX_RECEIVE);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_rejects_empty_name() {
        let err = QueueConfig::new("  ").validate().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn config_rejects_zero_timeout_and_receive() {
        assert!(QueueConfig::new("q").with_timeout(Duration::ZERO).validate().is_err());
        let err = QueueConfig::new("q")
            .with_timeout(Duration::from_micros(900))
            .validate()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(QueueConfig::new("q").with_max_receive(0).validate().is_err());
    }

    #[test]
    fn deadline_overflow_is_an_error() {
        let err = checked_deadline(i64::MAX - 10, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, Error::InvalidDuration(_)));
        assert!(to_millis(Duration::MAX).is_err());
        assert_eq!(checked_deadline(1_000, Duration::from_millis(250)).unwrap(), 1_250);
    }

    #[test]
    fn sub_millisecond_durations_round_up() {
        assert_eq!(to_millis(Duration::ZERO).unwrap(), 0);
        assert_eq!(to_millis(Duration::from_micros(900)).unwrap(), 1);
        assert_eq!(to_millis(Duration::from_micros(1_001)).unwrap(), 2);
        assert_eq!(checked_deadline(1_000, Duration::from_nanos(1)).unwrap(), 1_001);
    }

    #[test]
    fn message_ids_are_prefixed_hex() {
        let id = new_message_id();
        assert!(id.starts_with("m_"));
        assert_eq!(id.len(), 34);
        assert_ne!(id, new_message_id());
    }
}
