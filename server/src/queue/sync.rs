//! Historical backfill jobs. A job pages through a channel's history and
//! feeds every message through the regular inbound path, so re-running a job
//! only re-reads what is already stored.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::QueueResult;
use crate::{
    channels::HistoryRequest,
    config::SyncConfig,
    error::{OrchestratorError, StoreError},
    orchestrator::Orchestrator,
    store::ChatStore,
};

pub const DEFAULT_JOB_TYPE: &str = "messages";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJob {
    pub id: i64,
    pub channel_id: i64,
    pub job_type: String,
    pub status: JobStatus,
    pub processed: i32,
    pub cursor: Option<String>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, channel_id: i64, job_type: &str) -> QueueResult<SyncJob>;

    async fn job(&self, id: i64) -> QueueResult<Option<SyncJob>>;

    async fn claim_job(&self, worker_id: &str) -> QueueResult<Option<SyncJob>>;

    /// Adds `processed` to the job's count. Returns false once the job has
    /// left `running`, which tells the worker to stop.
    async fn record_progress(&self, id: i64, processed: i32, cursor: Option<&str>)
        -> QueueResult<bool>;

    /// Only a running job can finish; returns false otherwise.
    async fn finish_job(&self, id: i64, status: JobStatus, error: Option<&str>)
        -> QueueResult<bool>;

    async fn running_jobs(&self) -> QueueResult<Vec<SyncJob>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEnd {
    Completed { processed: i32 },
    /// The job was finished elsewhere, usually by the reaper.
    Abandoned,
}

pub struct SyncRunner {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ChatStore>,
    orchestrator: Arc<Orchestrator>,
    page_limit: usize,
}

impl SyncRunner {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        store: Arc<dyn ChatStore>,
        orchestrator: Arc<Orchestrator>,
        page_limit: usize,
    ) -> Self {
        Self {
            jobs,
            store,
            orchestrator,
            page_limit: page_limit.max(1),
        }
    }

    pub async fn run_job(&self, job: &SyncJob) -> Result<SyncEnd, OrchestratorError> {
        let channel = self
            .store
            .channel_by_id(job.channel_id)
            .await?
            .ok_or_else(|| StoreError::not_found("channel", job.channel_id))?;
        let adapter = self.orchestrator.adapters().get(channel.platform)?;
        let mut cursor = job.cursor.clone();
        let mut processed = 0;

        loop {
            let page = adapter
                .fetch_history(
                    &channel,
                    &HistoryRequest {
                        job_type: job.job_type.clone(),
                        cursor: cursor.clone(),
                        limit: self.page_limit,
                    },
                )
                .await?;
            let mut handled = 0;
            for event in &page.events {
                match self.orchestrator.handle_inbound(event).await {
                    Ok(_) => handled += 1,
                    Err(err) if err.is_retryable() => return Err(err),
                    Err(err) => warn!(
                        job_id = job.id,
                        error = %err,
                        external_id = %event.external_message_id,
                        "skipping history message"
                    ),
                }
            }
            if !self
                .jobs
                .record_progress(job.id, handled, page.next_cursor.as_deref())
                .await?
            {
                info!(job_id = job.id, "sync job no longer running, stopping");
                return Ok(SyncEnd::Abandoned);
            }
            processed += handled;

            match page.next_cursor {
                Some(next) if !page.events.is_empty() => cursor = Some(next),
                _ => return Ok(SyncEnd::Completed { processed }),
            }
        }
    }

    /// Claims and runs one queued job. Returns the job id, if any was claimed.
    pub async fn process_next(&self, worker_id: &str) -> QueueResult<Option<i64>> {
        let Some(job) = self.jobs.claim_job(worker_id).await? else {
            return Ok(None);
        };
        info!(
            job_id = job.id,
            channel_id = job.channel_id,
            job_type = %job.job_type,
            "sync job started"
        );
        let finished = match self.run_job(&job).await {
            Ok(SyncEnd::Completed { processed }) => {
                info!(job_id = job.id, processed, "sync job completed");
                self.jobs
                    .finish_job(job.id, JobStatus::Completed, None)
                    .await?
            }
            Ok(SyncEnd::Abandoned) => true,
            Err(err) => {
                error!(job_id = job.id, error = %err, "sync job failed");
                self.jobs
                    .finish_job(job.id, JobStatus::Failed, Some(&err.to_string()))
                    .await?
            }
        };
        if !finished {
            info!(job_id = job.id, "sync job was reaped before it finished");
        }
        Ok(Some(job.id))
    }
}

pub async fn run_sync_worker(
    runner: Arc<SyncRunner>,
    worker_id: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let idle = match runner.process_next(&worker_id).await {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(err) => {
                error!(worker_id = %worker_id, error = %err, "claim sync job failed");
                true
            }
        };
        if idle {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

/// Fails every running job older than its type's budget. Reaped jobs are
/// never retried.
pub async fn reap_stuck_jobs(
    jobs: &dyn JobStore,
    config: &SyncConfig,
    now: DateTime<Utc>,
) -> QueueResult<Vec<i64>> {
    let mut reaped = Vec::new();
    for job in jobs.running_jobs().await? {
        let budget = config.budget_for(&job.job_type);
        let Some(started_at) = job.started_at else {
            continue;
        };
        let deadline = started_at
            + chrono::Duration::from_std(budget).unwrap_or_else(|_| chrono::Duration::hours(1));
        if deadline > now {
            continue;
        }
        let reason = format!("exceeded {}s budget for {} jobs", budget.as_secs(), job.job_type);
        if jobs.finish_job(job.id, JobStatus::Failed, Some(&reason)).await? {
            warn!(job_id = job.id, job_type = %job.job_type, "reaped stuck sync job");
            reaped.push(job.id);
        }
    }
    Ok(reaped)
}

pub async fn run_reaper(jobs: Arc<dyn JobStore>, config: SyncConfig, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(config.reaper_interval.max(Duration::from_secs(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if let Err(err) = reap_stuck_jobs(jobs.as_ref(), &config, Utc::now()).await {
            error!(error = %err, "sync reaper pass failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channels::HistoryPage,
        orchestrator::tests::{event, Fixture},
    };

    fn runner(fixture: &Fixture) -> SyncRunner {
        SyncRunner::new(
            fixture.queue.clone(),
            fixture.store.clone(),
            fixture.orchestrator.clone(),
            50,
        )
    }

    #[tokio::test]
    async fn backfill_pages_until_cursor_runs_out() {
        let fixture = Fixture::new("77", &[10]);
        {
            let mut history = fixture.adapter.history.lock();
            history.insert(
                None,
                HistoryPage {
                    events: vec![event("77", "u1", "h-1"), event("77", "u2", "h-2")],
                    next_cursor: Some("2".to_string()),
                },
            );
            history.insert(
                Some("2".to_string()),
                HistoryPage {
                    events: vec![event("77", "u1", "h-3")],
                    next_cursor: None,
                },
            );
        }
        let job = fixture
            .queue
            .create_job(fixture.channel.id, DEFAULT_JOB_TYPE)
            .await
            .unwrap();

        let claimed = runner(&fixture).process_next("sync-1").await.unwrap();
        assert_eq!(claimed, Some(job.id));
        let stored = fixture.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.processed, 3);
        assert_eq!(fixture.store.conversation_count(), 2);
        assert_eq!(runner(&fixture).process_next("sync-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn reaper_fails_jobs_past_their_budget() {
        let fixture = Fixture::new("77", &[]);
        let config = SyncConfig::default();
        let old = fixture.queue.create_job(fixture.channel.id, "messages").await.unwrap();
        fixture.queue.claim_job("sync-1").await.unwrap();
        let young = fixture.queue.create_job(fixture.channel.id, "conversations").await.unwrap();
        fixture.queue.claim_job("sync-2").await.unwrap();
        fixture.queue.age_job(old.id, Duration::from_secs(11 * 60));
        fixture.queue.age_job(young.id, Duration::from_secs(11 * 60));

        let reaped = reap_stuck_jobs(fixture.queue.as_ref(), &config, Utc::now())
            .await
            .unwrap();
        assert_eq!(reaped, vec![old.id]);
        let failed = fixture.queue.job(old.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.last_error.unwrap().contains("budget"));
        let running = fixture.queue.job(young.id).await.unwrap().unwrap();
        assert_eq!(running.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn reaped_job_stops_its_worker() {
        let fixture = Fixture::new("77", &[]);
        fixture.adapter.history.lock().insert(
            None,
            HistoryPage {
                events: vec![event("77", "u1", "h-1")],
                next_cursor: Some("2".to_string()),
            },
        );
        fixture.queue.create_job(fixture.channel.id, "messages").await.unwrap();
        let job = fixture.queue.claim_job("sync-1").await.unwrap().unwrap();
        fixture
            .queue
            .finish_job(job.id, JobStatus::Failed, Some("reaped"))
            .await
            .unwrap();

        let end = runner(&fixture).run_job(&job).await.unwrap();
        assert_eq!(end, SyncEnd::Abandoned);
        let stored = fixture.queue.job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.processed, 0);
    }
}
