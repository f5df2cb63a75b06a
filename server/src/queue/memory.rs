use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::{
    sync::{JobStatus, JobStore, SyncJob},
    EventQueue, ItemStatus, QueueItem, QueueResult, TopicDepth,
};
use crate::error::QueueError;

struct Lease {
    item: QueueItem,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct QueueTables {
    next_item_id: i64,
    next_job_id: i64,
    items: BTreeMap<i64, Lease>,
    jobs: BTreeMap<i64, SyncJob>,
}

/// In-process queue with the same lease semantics as [`super::PgQueue`].
#[derive(Default)]
pub struct MemoryQueue {
    tables: Mutex<QueueTables>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(&self, id: i64) -> Option<QueueItem> {
        self.tables.lock().items.get(&id).map(|lease| lease.item.clone())
    }

    pub fn items(&self, topic: &str) -> Vec<QueueItem> {
        self.tables
            .lock()
            .items
            .values()
            .filter(|lease| lease.item.topic == topic)
            .map(|lease| lease.item.clone())
            .collect()
    }

    /// Makes every pending item due now, skipping retry delays in tests.
    pub fn expedite(&self) {
        let now = Utc::now();
        for lease in self.tables.lock().items.values_mut() {
            if lease.item.status == ItemStatus::Pending {
                lease.item.available_at = now;
            }
        }
    }

    /// Backdates a running job's start, as if it had been running for `age`.
    pub fn age_job(&self, id: i64, age: Duration) {
        if let Some(job) = self.tables.lock().jobs.get_mut(&id) {
            let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
            job.started_at = job.started_at.map(|started| started - age);
        }
    }

    fn update<F>(&self, id: i64, apply: F) -> QueueResult<()>
    where
        F: FnOnce(&mut Lease),
    {
        let mut tables = self.tables.lock();
        let lease = tables.items.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        apply(lease);
        lease.item.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn enqueue(&self, topic: &str, shop_id: Option<i64>, payload: Value) -> QueueResult<i64> {
        let mut tables = self.tables.lock();
        tables.next_item_id += 1;
        let id = tables.next_item_id;
        let now = Utc::now();
        tables.items.insert(
            id,
            Lease {
                item: QueueItem {
                    id,
                    topic: topic.to_string(),
                    shop_id,
                    payload,
                    status: ItemStatus::Pending,
                    attempts: 0,
                    available_at: now,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                },
                locked_until: None,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        topic: &str,
        _worker_id: &str,
        limit: i64,
        visibility: Duration,
    ) -> QueueResult<Vec<QueueItem>> {
        let now = Utc::now();
        let lease_until =
            now + chrono::Duration::from_std(visibility).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let mut tables = self.tables.lock();
        let mut due = tables
            .items
            .values()
            .filter(|lease| lease.item.topic == topic)
            .filter(|lease| match lease.item.status {
                ItemStatus::Pending => lease.item.available_at <= now,
                ItemStatus::Running => lease.locked_until.is_some_and(|until| until < now),
                _ => false,
            })
            .map(|lease| (lease.item.available_at, lease.item.id))
            .collect::<Vec<_>>();
        due.sort();
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(lease) = tables.items.get_mut(&id) {
                lease.item.status = ItemStatus::Running;
                lease.item.attempts += 1;
                lease.item.updated_at = now;
                lease.locked_until = Some(lease_until);
                claimed.push(lease.item.clone());
            }
        }
        Ok(claimed)
    }

    async fn ack(&self, id: i64) -> QueueResult<()> {
        self.update(id, |lease| {
            lease.item.status = ItemStatus::Done;
            lease.locked_until = None;
        })
    }

    async fn nack(&self, id: i64, retry_at: DateTime<Utc>, error: &str) -> QueueResult<()> {
        self.update(id, |lease| {
            lease.item.status = ItemStatus::Pending;
            lease.item.available_at = retry_at;
            lease.item.last_error = Some(error.to_string());
            lease.locked_until = None;
        })
    }

    async fn dead_letter(&self, id: i64, error: &str) -> QueueResult<()> {
        self.update(id, |lease| {
            lease.item.status = ItemStatus::Dead;
            lease.item.last_error = Some(error.to_string());
            lease.locked_until = None;
        })
    }

    async fn dead_letters(
        &self,
        shop_id: i64,
        topic: Option<&str>,
        limit: i64,
    ) -> QueueResult<Vec<QueueItem>> {
        let tables = self.tables.lock();
        Ok(tables
            .items
            .values()
            .rev()
            .filter(|lease| lease.item.status == ItemStatus::Dead)
            .filter(|lease| lease.item.shop_id == Some(shop_id))
            .filter(|lease| topic.map_or(true, |topic| lease.item.topic == topic))
            .take(limit.max(0) as usize)
            .map(|lease| lease.item.clone())
            .collect())
    }

    async fn requeue(&self, id: i64, shop_id: i64) -> QueueResult<QueueItem> {
        let mut tables = self.tables.lock();
        let lease = tables
            .items
            .get_mut(&id)
            .filter(|lease| lease.item.status == ItemStatus::Dead)
            .filter(|lease| lease.item.shop_id == Some(shop_id))
            .ok_or(QueueError::NotFound(id))?;
        let now = Utc::now();
        lease.item.status = ItemStatus::Pending;
        lease.item.attempts = 0;
        lease.item.available_at = now;
        lease.item.updated_at = now;
        Ok(lease.item.clone())
    }

    async fn depth(&self) -> QueueResult<Vec<TopicDepth>> {
        let tables = self.tables.lock();
        let mut depth = BTreeMap::<String, TopicDepth>::new();
        for lease in tables.items.values() {
            if lease.item.status == ItemStatus::Done {
                continue;
            }
            let entry = depth
                .entry(lease.item.topic.clone())
                .or_insert_with(|| TopicDepth {
                    topic: lease.item.topic.clone(),
                    pending: 0,
                    running: 0,
                    dead: 0,
                });
            match lease.item.status {
                ItemStatus::Pending => entry.pending += 1,
                ItemStatus::Running => entry.running += 1,
                ItemStatus::Dead => entry.dead += 1,
                ItemStatus::Done => {}
            }
        }
        Ok(depth.into_values().collect())
    }
}

#[async_trait]
impl JobStore for MemoryQueue {
    async fn create_job(&self, channel_id: i64, job_type: &str) -> QueueResult<SyncJob> {
        let mut tables = self.tables.lock();
        tables.next_job_id += 1;
        let now = Utc::now();
        let job = SyncJob {
            id: tables.next_job_id,
            channel_id,
            job_type: job_type.to_string(),
            status: JobStatus::Queued,
            processed: 0,
            cursor: None,
            last_error: None,
            worker_id: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn job(&self, id: i64) -> QueueResult<Option<SyncJob>> {
        Ok(self.tables.lock().jobs.get(&id).cloned())
    }

    async fn claim_job(&self, worker_id: &str) -> QueueResult<Option<SyncJob>> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let next = tables
            .jobs
            .values_mut()
            .find(|job| job.status == JobStatus::Queued);
        Ok(next.map(|job| {
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_id.to_string());
            job.started_at = Some(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn record_progress(
        &self,
        id: i64,
        processed: i32,
        cursor: Option<&str>,
    ) -> QueueResult<bool> {
        let mut tables = self.tables.lock();
        let Some(job) = tables
            .jobs
            .get_mut(&id)
            .filter(|job| job.status == JobStatus::Running)
        else {
            return Ok(false);
        };
        job.processed += processed;
        job.cursor = cursor.map(str::to_string);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn finish_job(
        &self,
        id: i64,
        status: JobStatus,
        error: Option<&str>,
    ) -> QueueResult<bool> {
        let mut tables = self.tables.lock();
        let Some(job) = tables
            .jobs
            .get_mut(&id)
            .filter(|job| job.status == JobStatus::Running)
        else {
            return Ok(false);
        };
        let now = Utc::now();
        job.status = status;
        job.last_error = error.map(str::to_string);
        job.finished_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn running_jobs(&self) -> QueueResult<Vec<SyncJob>> {
        Ok(self
            .tables
            .lock()
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Running)
            .cloned()
            .collect())
    }
}
