//! Durable topic queue between webhook ingress and orchestration, plus the
//! outbound delivery outbox and historical sync jobs.
//!
//! Items are claimed with a visibility timeout: a worker that dies mid-item
//! leaves it to reappear once `locked_until` passes. Delivery is therefore
//! at-least-once and every handler must be idempotent.

mod memory;
mod postgres;
pub mod sync;
pub mod worker;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::QueueError, types::Platform};

pub const OUTBOUND_TOPIC: &str = "outbound";

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Running,
    Done,
    Dead,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Running => "running",
            ItemStatus::Done => "done",
            ItemStatus::Dead => "dead",
        }
    }
}

impl std::str::FromStr for ItemStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(ItemStatus::Pending),
            "running" => Ok(ItemStatus::Running),
            "done" => Ok(ItemStatus::Done),
            "dead" => Ok(ItemStatus::Dead),
            other => Err(format!("invalid queue status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: i64,
    pub topic: String,
    /// Owning shop. Items whose channel could not be resolved at enqueue
    /// time have none and are hidden from the dead-letter API.
    pub shop_id: Option<i64>,
    pub payload: Value,
    pub status: ItemStatus,
    /// Claims so far, including the one that produced this item.
    pub attempts: i32,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDepth {
    pub topic: String,
    pub pending: i64,
    pub running: i64,
    pub dead: i64,
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    async fn enqueue(&self, topic: &str, shop_id: Option<i64>, payload: Value) -> QueueResult<i64>;

    /// Leases up to `limit` due items of `topic` to `worker_id`.
    async fn claim(
        &self,
        topic: &str,
        worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> QueueResult<Vec<QueueItem>>;

    async fn ack(&self, id: i64) -> QueueResult<()>;

    /// Returns the item to the queue, not to be claimed before `retry_at`.
    async fn nack(&self, id: i64, retry_at: DateTime<Utc>, error: &str) -> QueueResult<()>;

    async fn dead_letter(&self, id: i64, error: &str) -> QueueResult<()>;

    /// Dead items owned by `shop_id`, newest first.
    async fn dead_letters(
        &self,
        shop_id: i64,
        topic: Option<&str>,
        limit: i64,
    ) -> QueueResult<Vec<QueueItem>>;

    /// Moves a dead item of `shop_id` back to pending with a fresh attempt
    /// budget. Another shop's item is `NotFound`.
    async fn requeue(&self, id: i64, shop_id: i64) -> QueueResult<QueueItem>;

    async fn depth(&self) -> QueueResult<Vec<TopicDepth>>;
}

/// Topics consumed by this deployment: one per enabled platform plus the outbox.
pub fn topics_for(platforms: &[Platform]) -> Vec<String> {
    let mut topics = platforms
        .iter()
        .map(Platform::inbound_topic)
        .collect::<Vec<_>>();
    topics.push(OUTBOUND_TOPIC.to_string());
    topics
}

/// Exponential backoff: `base * 2^attempts`, capped at `max`.
pub fn compute_retry_at(now: DateTime<Utc>, attempts: i32, base: Duration, max: Duration) -> DateTime<Utc> {
    let base = base.max(Duration::from_millis(1));
    let exponent = attempts.clamp(1, 20) as u32;
    let delay = base
        .checked_mul(2_u32.pow(exponent))
        .unwrap_or(max)
        .min(max.max(base));
    now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60))
}
