use serde::{Deserialize, Serialize};

/// A stored unit of work, as claimed or peeked from the `jobqueue` table.
///
/// Timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: String,
    pub queue: String,
    pub body: Vec<u8>,
    pub timeout: i64,
    pub received: i64,
    pub created: i64,
}

/// Per-queue message counts at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Claimable right now.
    pub pending: i64,
    /// Sent with a delay that has not elapsed yet, never claimed.
    pub delayed: i64,
    /// Claimed and still inside their visibility timeout.
    pub in_flight: i64,
    /// Exhausted `max_receive`; never claimed again.
    pub stuck: i64,
    pub total: i64,
}
