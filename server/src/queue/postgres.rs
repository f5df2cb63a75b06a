use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{postgres::PgRow, PgPool, Row};

use super::{
    sync::{JobStatus, JobStore, SyncJob},
    EventQueue, ItemStatus, QueueItem, QueueResult, TopicDepth,
};
use crate::error::QueueError;

const ITEM_COLUMNS: &str =
    "id, topic, shop_id, payload, status, attempts, available_at, last_error, created_at, updated_at";
const JOB_COLUMNS: &str = "id, channel_id, job_type, status, processed, cursor, last_error, \
     worker_id, created_at, started_at, finished_at, updated_at";

#[derive(Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn decode_status<T: FromStr<Err = String>>(row: &PgRow) -> QueueResult<T> {
    let raw: String = row.try_get("status")?;
    raw.parse::<T>().map_err(QueueError::Decode)
}

fn parse_item_row(row: &PgRow) -> QueueResult<QueueItem> {
    Ok(QueueItem {
        id: row.try_get("id")?,
        topic: row.try_get("topic")?,
        shop_id: row.try_get("shop_id")?,
        payload: row.try_get::<Value, _>("payload")?,
        status: decode_status::<ItemStatus>(row)?,
        attempts: row.try_get("attempts")?,
        available_at: row.try_get("available_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_job_row(row: &PgRow) -> QueueResult<SyncJob> {
    Ok(SyncJob {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        job_type: row.try_get("job_type")?,
        status: decode_status::<JobStatus>(row)?,
        processed: row.try_get("processed")?,
        cursor: row.try_get("cursor")?,
        last_error: row.try_get("last_error")?,
        worker_id: row.try_get("worker_id")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl EventQueue for PgQueue {
    async fn enqueue(&self, topic: &str, shop_id: Option<i64>, payload: Value) -> QueueResult<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO queue_items (topic, shop_id, payload) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(topic)
        .bind(shop_id)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim(
        &self,
        topic: &str,
        worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> QueueResult<Vec<QueueItem>> {
        // Running items whose lease expired belong to a dead worker.
        let rows = sqlx::query(&format!(
            "UPDATE queue_items SET status = 'running', attempts = attempts + 1, \
               locked_by = $2, locked_until = now() + ($4::DOUBLE PRECISION * INTERVAL '1 millisecond'), \
               updated_at = now() \
             WHERE id IN ( \
               SELECT id FROM queue_items \
               WHERE topic = $1 AND ( \
                 (status = 'pending' AND available_at <= now()) \
                 OR (status = 'running' AND locked_until < now()) \
               ) \
               ORDER BY available_at, id \
               LIMIT $3 \
               FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {ITEM_COLUMNS}"
        ))
        .bind(topic)
        .bind(worker_id)
        .bind(limit)
        .bind(visibility.as_millis() as i64)
        .fetch_all(&self.pool)
        .await?;
        let mut items = rows.iter().map(parse_item_row).collect::<QueueResult<Vec<_>>>()?;
        items.sort_by_key(|item| (item.available_at, item.id));
        Ok(items)
    }

    async fn ack(&self, id: i64) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE queue_items SET status = 'done', locked_by = NULL, locked_until = NULL, \
               updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn nack(&self, id: i64, retry_at: DateTime<Utc>, error: &str) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE queue_items SET status = 'pending', available_at = $2, last_error = $3, \
               locked_by = NULL, locked_until = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(retry_at)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: i64, error: &str) -> QueueResult<()> {
        let result = sqlx::query(
            "UPDATE queue_items SET status = 'dead', last_error = $2, locked_by = NULL, \
               locked_until = NULL, updated_at = now() WHERE id = $1",
        )
        .bind(id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn dead_letters(
        &self,
        shop_id: i64,
        topic: Option<&str>,
        limit: i64,
    ) -> QueueResult<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM queue_items \
             WHERE status = 'dead' AND shop_id = $1 AND ($2::TEXT IS NULL OR topic = $2) \
             ORDER BY updated_at DESC, id DESC LIMIT $3"
        ))
        .bind(shop_id)
        .bind(topic)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_item_row).collect()
    }

    async fn requeue(&self, id: i64, shop_id: i64) -> QueueResult<QueueItem> {
        let row = sqlx::query(&format!(
            "UPDATE queue_items SET status = 'pending', attempts = 0, available_at = now(), \
               updated_at = now() \
             WHERE id = $1 AND shop_id = $2 AND status = 'dead' RETURNING {ITEM_COLUMNS}"
        ))
        .bind(id)
        .bind(shop_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(QueueError::NotFound(id))?;
        parse_item_row(&row)
    }

    async fn depth(&self) -> QueueResult<Vec<TopicDepth>> {
        let rows = sqlx::query(
            "SELECT topic, \
               COUNT(*) FILTER (WHERE status = 'pending') AS pending, \
               COUNT(*) FILTER (WHERE status = 'running') AS running, \
               COUNT(*) FILTER (WHERE status = 'dead') AS dead \
             FROM queue_items WHERE status <> 'done' GROUP BY topic ORDER BY topic",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(TopicDepth {
                    topic: row.try_get("topic")?,
                    pending: row.try_get("pending")?,
                    running: row.try_get("running")?,
                    dead: row.try_get("dead")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl JobStore for PgQueue {
    async fn create_job(&self, channel_id: i64, job_type: &str) -> QueueResult<SyncJob> {
        let row = sqlx::query(&format!(
            "INSERT INTO sync_jobs (channel_id, job_type) VALUES ($1, $2) RETURNING {JOB_COLUMNS}"
        ))
        .bind(channel_id)
        .bind(job_type)
        .fetch_one(&self.pool)
        .await?;
        parse_job_row(&row)
    }

    async fn job(&self, id: i64) -> QueueResult<Option<SyncJob>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    async fn claim_job(&self, worker_id: &str) -> QueueResult<Option<SyncJob>> {
        let row = sqlx::query(&format!(
            "UPDATE sync_jobs SET status = 'running', worker_id = $1, started_at = now(), \
               updated_at = now() \
             WHERE id = ( \
               SELECT id FROM sync_jobs WHERE status = 'queued' \
               ORDER BY created_at, id LIMIT 1 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_job_row).transpose()
    }

    async fn record_progress(
        &self,
        id: i64,
        processed: i32,
        cursor: Option<&str>,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET processed = processed + $2, cursor = $3, updated_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(processed)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> QueueResult<bool> {
        let result = sqlx::query(
            "UPDATE sync_jobs SET status = $2, last_error = $3, finished_at = now(), \
               updated_at = now() \
             WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn running_jobs(&self) -> QueueResult<Vec<SyncJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs WHERE status = 'running' ORDER BY started_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_job_row).collect()
    }
}
