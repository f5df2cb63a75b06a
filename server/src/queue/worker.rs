//! Topic consumers. Each topic gets its own pool of polling workers; a failed
//! item is acked, retried later, or dead-lettered depending on the error.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{compute_retry_at, EventQueue, QueueItem, QueueResult};
use crate::{
    channels::InboundEvent,
    config::QueueConfig,
    error::OrchestratorError,
    orchestrator::{Orchestrator, OutboundJob},
};

#[async_trait]
pub trait TopicHandler: Send + Sync {
    async fn handle(&self, item: &QueueItem) -> Result<(), OrchestratorError>;

    /// Called once an item has used up its attempts.
    async fn on_dead_letter(&self, _item: &QueueItem, _error: &OrchestratorError) {}
}

/// Consumes `inbound.<platform>` topics.
pub struct InboundHandler {
    orchestrator: Arc<Orchestrator>,
}

impl InboundHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl TopicHandler for InboundHandler {
    async fn handle(&self, item: &QueueItem) -> Result<(), OrchestratorError> {
        let event = serde_json::from_value::<InboundEvent>(item.payload.clone())
            .map_err(|err| OrchestratorError::Invalid(format!("malformed inbound event: {err}")))?;
        self.orchestrator.handle_inbound(&event).await?;
        Ok(())
    }
}

/// Consumes the outbound delivery topic.
pub struct OutboundHandler {
    orchestrator: Arc<Orchestrator>,
}

impl OutboundHandler {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

fn outbound_job(item: &QueueItem) -> Result<OutboundJob, OrchestratorError> {
    serde_json::from_value::<OutboundJob>(item.payload.clone())
        .map_err(|err| OrchestratorError::Invalid(format!("malformed outbound job: {err}")))
}

#[async_trait]
impl TopicHandler for OutboundHandler {
    async fn handle(&self, item: &QueueItem) -> Result<(), OrchestratorError> {
        let job = outbound_job(item)?;
        self.orchestrator.deliver_outbound(&job).await?;
        Ok(())
    }

    async fn on_dead_letter(&self, item: &QueueItem, error: &OrchestratorError) {
        if let Ok(job) = outbound_job(item) {
            self.orchestrator
                .report_delivery_failure(&job, &format!("delivery failed: {error}"))
                .await;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Permanent failure, logged and acked.
    Dropped,
    Retrying,
    DeadLettered,
}

/// Runs one claimed item and settles it in the queue.
pub async fn process_item(
    queue: &dyn EventQueue,
    handler: &dyn TopicHandler,
    config: &QueueConfig,
    item: &QueueItem,
) -> QueueResult<Outcome> {
    let err = match handler.handle(item).await {
        Ok(()) => {
            queue.ack(item.id).await?;
            debug!(topic = %item.topic, item_id = item.id, "queue item done");
            return Ok(Outcome::Done);
        }
        Err(err) => err,
    };

    if !err.is_retryable() {
        warn!(
            topic = %item.topic,
            item_id = item.id,
            error = %err,
            "dropping queue item"
        );
        queue.ack(item.id).await?;
        return Ok(Outcome::Dropped);
    }

    if item.attempts < config.max_attempts {
        let retry_at = compute_retry_at(Utc::now(), item.attempts, config.retry_base, config.retry_max);
        warn!(
            topic = %item.topic,
            item_id = item.id,
            attempt = item.attempts,
            retry_at = %retry_at,
            error = %err,
            "queue item failed, will retry"
        );
        queue.nack(item.id, retry_at, &err.to_string()).await?;
        return Ok(Outcome::Retrying);
    }

    error!(
        topic = %item.topic,
        item_id = item.id,
        attempt = item.attempts,
        error = %err,
        "queue item dead-lettered"
    );
    queue.dead_letter(item.id, &err.to_string()).await?;
    handler.on_dead_letter(item, &err).await;
    Ok(Outcome::DeadLettered)
}

/// Polls `topic` until cancelled.
pub async fn run_consumer(
    queue: Arc<dyn EventQueue>,
    handler: Arc<dyn TopicHandler>,
    topic: String,
    worker_id: String,
    config: QueueConfig,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        let items = match queue
            .claim(&topic, &worker_id, config.batch_size, config.visibility_timeout)
            .await
        {
            Ok(items) => items,
            Err(err) => {
                error!(topic = %topic, worker_id = %worker_id, error = %err, "claim failed");
                Vec::new()
            }
        };
        if items.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(config.poll_interval) => continue,
            }
        }
        for item in items {
            if let Err(err) = process_item(queue.as_ref(), handler.as_ref(), &config, &item).await {
                error!(topic = %topic, item_id = item.id, error = %err, "settling queue item failed");
            }
        }
    }
}

/// Starts `config.workers_per_topic` consumers for every topic.
pub fn spawn_consumers(
    queue: Arc<dyn EventQueue>,
    handlers: Vec<(String, Arc<dyn TopicHandler>)>,
    config: &QueueConfig,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    for (topic, handler) in handlers {
        for index in 0..config.workers_per_topic.max(1) {
            tasks.push(tokio::spawn(run_consumer(
                queue.clone(),
                handler.clone(),
                topic.clone(),
                format!("{topic}-{index}"),
                config.clone(),
                shutdown.clone(),
            )));
        }
    }
    tasks
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        error::{ChannelError, QueueError},
        orchestrator::tests::{event, Fixture},
        queue::{ItemStatus, MemoryQueue, OUTBOUND_TOPIC},
        types::Platform,
    };

    /// Fails with a timeout a fixed number of times, then succeeds.
    struct Flaky {
        failures: Mutex<i32>,
        dead: Mutex<Vec<i64>>,
    }

    impl Flaky {
        fn new(failures: i32) -> Self {
            Self {
                failures: Mutex::new(failures),
                dead: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl TopicHandler for Flaky {
        async fn handle(&self, _item: &QueueItem) -> Result<(), OrchestratorError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ChannelError::Timeout {
                    platform: Platform::Facebook,
                    duration: Duration::from_secs(10),
                }
                .into());
            }
            Ok(())
        }

        async fn on_dead_letter(&self, item: &QueueItem, _error: &OrchestratorError) {
            self.dead.lock().push(item.id);
        }
    }

    fn config(max_attempts: i32) -> QueueConfig {
        QueueConfig {
            max_attempts,
            ..QueueConfig::default()
        }
    }

    async fn claim_one(queue: &MemoryQueue, topic: &str) -> QueueItem {
        queue.expedite();
        queue
            .claim(topic, "test", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let queue = MemoryQueue::new();
        let handler = Flaky::new(2);
        let id = queue.enqueue("inbound.facebook", Some(1), json!({})).await.unwrap();

        for expected in [Outcome::Retrying, Outcome::Retrying, Outcome::Done] {
            let item = claim_one(&queue, "inbound.facebook").await;
            let outcome = process_item(&queue, &handler, &config(5), &item).await.unwrap();
            assert_eq!(outcome, expected);
        }
        let item = queue.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Done);
        assert_eq!(item.attempts, 3);
    }

    #[tokio::test]
    async fn nack_schedules_backoff() {
        let queue = MemoryQueue::new();
        let handler = Flaky::new(1);
        let id = queue.enqueue("outbound", Some(1), json!({})).await.unwrap();
        let item = claim_one(&queue, "outbound").await;
        let before = Utc::now();
        process_item(&queue, &handler, &config(5), &item).await.unwrap();

        let item = queue.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.available_at >= before + chrono::Duration::seconds(3));
        assert!(queue
            .claim("outbound", "test", 1, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn exhausted_items_are_dead_lettered_and_logged() {
        let queue = MemoryQueue::new();
        let handler = Flaky::new(10);
        let id = queue.enqueue("outbound", Some(1), json!({})).await.unwrap();

        let mut outcome = Outcome::Retrying;
        while outcome == Outcome::Retrying {
            let item = claim_one(&queue, "outbound").await;
            outcome = process_item(&queue, &handler, &config(3), &item).await.unwrap();
        }
        assert_eq!(outcome, Outcome::DeadLettered);
        let item = queue.item(id).unwrap();
        assert_eq!(item.status, ItemStatus::Dead);
        assert_eq!(item.attempts, 3);
        assert!(item.last_error.unwrap().contains("timed out"));
        assert_eq!(*handler.dead.lock(), vec![id]);
        assert!(logs_contain("queue item dead-lettered"));
    }

    #[tokio::test]
    async fn malformed_inbound_payload_is_dropped_not_retried() {
        let fixture = Fixture::new("77", &[]);
        let handler = InboundHandler::new(fixture.orchestrator.clone());
        let id = fixture
            .queue
            .enqueue("inbound.zalo", Some(1), json!({ "unexpected": true }))
            .await
            .unwrap();
        let item = claim_one(&fixture.queue, "inbound.zalo").await;
        let outcome = process_item(fixture.queue.as_ref(), &handler, &config(5), &item)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(fixture.queue.item(id).unwrap().status, ItemStatus::Done);
    }

    #[tokio::test]
    async fn inbound_replays_are_acknowledged_twice() {
        let fixture = Fixture::new("42", &[]);
        let handler = InboundHandler::new(fixture.orchestrator.clone());
        let payload = serde_json::to_value(event("42", "u1", "abc123")).unwrap();
        for _ in 0..2 {
            fixture.queue.enqueue("inbound.zalo", Some(1), payload.clone()).await.unwrap();
        }
        let mut outcomes = Vec::new();
        for _ in 0..2 {
            let item = claim_one(&fixture.queue, "inbound.zalo").await;
            outcomes.push(
                process_item(fixture.queue.as_ref(), &handler, &config(5), &item)
                    .await
                    .unwrap(),
            );
        }
        assert_eq!(outcomes, vec![Outcome::Done, Outcome::Done]);
        assert_eq!(fixture.store.conversation_count(), 1);
    }

    #[tokio::test]
    async fn dead_outbound_delivery_notifies_the_room() {
        let fixture = Fixture::new("77", &[10]);
        let inbound = fixture
            .orchestrator
            .handle_inbound(&event("77", "u1", "m-1"))
            .await
            .unwrap();
        let handler = OutboundHandler::new(fixture.orchestrator.clone());
        let job = OutboundJob {
            message_id: inbound.message.id,
            conversation_id: inbound.conversation.id,
            channel_id: fixture.channel.id,
        };
        let item = QueueItem {
            id: 0,
            topic: OUTBOUND_TOPIC.to_string(),
            shop_id: None,
            payload: serde_json::to_value(&job).unwrap(),
            status: ItemStatus::Running,
            attempts: 5,
            available_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        handler
            .on_dead_letter(&item, &OrchestratorError::Queue(QueueError::NotFound(0)))
            .await;
        let deliveries = fixture.broadcaster.deliveries.lock().clone();
        let last = deliveries.last().unwrap();
        assert_eq!(last.event, "error");
        assert_eq!(last.data["messageId"], inbound.message.id);
    }

    #[tokio::test]
    async fn consumers_stop_on_shutdown() {
        let queue: Arc<dyn EventQueue> = Arc::new(MemoryQueue::new());
        let shutdown = CancellationToken::new();
        let handler: Arc<dyn TopicHandler> = Arc::new(Flaky::new(0));
        let tasks = spawn_consumers(
            queue.clone(),
            vec![("outbound".to_string(), handler)],
            &QueueConfig {
                poll_interval: Duration::from_millis(5),
                ..QueueConfig::default()
            },
            shutdown.clone(),
        );
        queue.enqueue("outbound", Some(1), json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .unwrap()
                .unwrap();
        }
        assert_eq!(queue.depth().await.unwrap().len(), 0);
    }
}
