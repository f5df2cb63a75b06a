//! Conversation orchestration: turns normalized platform events into stored
//! conversations and messages, and carries agent replies back out.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::{
    channels::{ChannelRegistry, EventDirection, InboundEvent, OutboundContent, OutboundTarget},
    error::{ChannelError, OrchestratorError, QueueError},
    identity::CustomerResolver,
    membership::{member_user_ids, MembershipTracker},
    queue::{EventQueue, OUTBOUND_TOPIC},
    realtime::{Broadcaster, Delivery},
    store::{ChatStore, StoreResult},
    types::{
        Attachment, Channel, ContentType, Conversation, ConversationType, Customer, DeliveryStatus,
        ExternalIdPatch, Message, NewConversation, NewMessage, Participant, Platform, Principal, SendMessageBody,
        SendToConversationData, SenderType, SentMessage, ThreadKey, Upserted,
    },
};

type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[async_trait]
pub trait ChannelLookup: Send + Sync {
    async fn channel_for_app(&self, platform: Platform, app_id: &str)
        -> StoreResult<Option<Channel>>;

    async fn channel(&self, channel_id: i64) -> StoreResult<Option<Channel>>;

    async fn admin_users(&self, channel_id: i64) -> StoreResult<Vec<i64>>;
}

/// Channel lookups served straight from the chat store.
pub struct StoreChannels {
    store: Arc<dyn ChatStore>,
}

impl StoreChannels {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ChannelLookup for StoreChannels {
    async fn channel_for_app(
        &self,
        platform: Platform,
        app_id: &str,
    ) -> StoreResult<Option<Channel>> {
        self.store.channel_by_app(platform, app_id).await
    }

    async fn channel(&self, channel_id: i64) -> StoreResult<Option<Channel>> {
        self.store.channel_by_id(channel_id).await
    }

    async fn admin_users(&self, channel_id: i64) -> StoreResult<Vec<i64>> {
        self.store.channel_admin_users(channel_id).await
    }
}

#[derive(Debug, Clone)]
pub struct InboundOutcome {
    pub conversation: Conversation,
    pub customer: Customer,
    pub message: Message,
    pub conversation_created: bool,
    pub message_created: bool,
}

/// A reply written by an internal user.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub conversation_id: i64,
    pub content_type: ContentType,
    pub text: String,
    pub attachments: Vec<Attachment>,
    /// Client supplied idempotency key; resubmitting it never sends twice.
    pub client_key: Option<String>,
}

impl From<SendMessageBody> for OutboundRequest {
    fn from(body: SendMessageBody) -> Self {
        Self {
            conversation_id: body.conversation_id,
            content_type: body.message_type,
            text: body.content,
            attachments: body.attachments,
            client_key: body.key,
        }
    }
}

impl From<SendToConversationData> for OutboundRequest {
    fn from(data: SendToConversationData) -> Self {
        Self {
            conversation_id: data.conversation_id,
            content_type: data.message_type,
            text: data.message,
            attachments: Vec::new(),
            client_key: data.key,
        }
    }
}

/// Payload of the `outbound` topic: a stored message still waiting for its
/// platform id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundJob {
    pub message_id: i64,
    pub conversation_id: i64,
    pub channel_id: i64,
}

pub struct Orchestrator {
    store: Arc<dyn ChatStore>,
    channels: Arc<dyn ChannelLookup>,
    adapters: ChannelRegistry,
    customers: CustomerResolver,
    members: MembershipTracker,
    broadcaster: Arc<dyn Broadcaster>,
    queue: Arc<dyn EventQueue>,
    upstream_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ChatStore>,
        adapters: ChannelRegistry,
        broadcaster: Arc<dyn Broadcaster>,
        queue: Arc<dyn EventQueue>,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            channels: Arc::new(StoreChannels::new(store.clone())),
            customers: CustomerResolver::new(
                store.clone(),
                Arc::new(adapters.clone()),
                upstream_timeout,
            ),
            members: MembershipTracker::new(store.clone(), broadcaster.clone()),
            store,
            adapters,
            broadcaster,
            queue,
            upstream_timeout,
        }
    }

    pub fn members(&self) -> &MembershipTracker {
        &self.members
    }

    pub fn adapters(&self) -> &ChannelRegistry {
        &self.adapters
    }

    /// Idempotent: replaying an event returns the stored message and
    /// re-broadcasts it under the same delivery key.
    pub async fn handle_inbound(&self, event: &InboundEvent) -> OrchestratorResult<InboundOutcome> {
        event.validate()?;
        let channel = self
            .channels
            .channel_for_app(event.platform, &event.channel_app_id)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownChannel {
                platform: event.platform,
                app_id: event.channel_app_id.clone(),
            })?;
        if !channel.active {
            return Err(OrchestratorError::InactiveChannel(channel.id));
        }

        let customer = self
            .customers
            .resolve_or_create(&channel, &event.external_sender_id)
            .await?;
        let conversation = self
            .find_or_create_conversation(&channel, &customer, event)
            .await?;
        let conversation_created = conversation.created;
        let conversation = conversation.value;
        self.seed_members(&channel, &customer, &conversation, conversation_created)
            .await?;

        let (sender_type, sender_id) = match event.direction {
            EventDirection::Inbound => (SenderType::Customer, Some(customer.id)),
            EventDirection::Echo => (SenderType::Channel, None),
        };
        let message = self
            .store
            .upsert_message(NewMessage {
                conversation_id: conversation.id,
                channel_id: channel.id,
                sender_type,
                sender_id,
                content_type: event.content_type,
                content: event.text.clone(),
                attachments: event.attachments.clone(),
                external_id: Some(event.external_message_id.clone()),
                client_key: None,
                created_at: event.timestamp,
            })
            .await?;
        if message.created {
            if let Err(err) = self
                .store
                .touch_conversation(conversation.id, event.timestamp)
                .await
            {
                warn!(error = %err, conversation_id = conversation.id, "conversation touch failed");
            }
            debug!(
                channel_id = channel.id,
                conversation_id = conversation.id,
                message_id = message.value.id,
                "stored inbound message"
            );
        } else {
            debug!(
                channel_id = channel.id,
                external_id = %event.external_message_id,
                "inbound message already stored"
            );
        }

        self.broadcast_message(&message.value).await;
        Ok(InboundOutcome {
            conversation,
            customer,
            message: message.value,
            conversation_created,
            message_created: message.created,
        })
    }

    async fn find_or_create_conversation(
        &self,
        channel: &Channel,
        customer: &Customer,
        event: &InboundEvent,
    ) -> OrchestratorResult<Upserted<Conversation>> {
        let key = ThreadKey::for_event(event.external_thread_id.as_deref(), customer.id);
        if let Some(existing) = self.store.conversation_by_key(channel.id, &key).await? {
            return Ok(Upserted::existing(existing));
        }
        let is_bot = channel.has_active_agent
            && !self
                .store
                .customer_has_human_reply(channel.id, customer.id)
                .await?;
        let conversation = self
            .store
            .upsert_conversation(NewConversation {
                channel_id: channel.id,
                shop_id: channel.shop_id,
                key,
                conversation_type: ConversationType::Direct,
                is_bot,
                updated_at: event.timestamp,
            })
            .await?;
        if conversation.created {
            info!(
                channel_id = channel.id,
                conversation_id = conversation.value.id,
                is_bot,
                "created conversation"
            );
        }
        Ok(conversation)
    }

    /// New conversations get the customer and every channel admin in one
    /// batch. An existing conversation missing its customer gets the customer
    /// back, plus the admins only when it has no active members at all, as
    /// after a first attempt that failed between the two writes. Admins
    /// removed by an operator stay removed.
    async fn seed_members(
        &self,
        channel: &Channel,
        customer: &Customer,
        conversation: &Conversation,
        created: bool,
    ) -> OrchestratorResult<()> {
        let customer_participant = Participant::Customer(customer.id);
        if !created {
            if self
                .store
                .active_member(conversation.id, customer_participant)
                .await?
                .is_some()
            {
                return Ok(());
            }
            if !self.store.active_members(conversation.id).await?.is_empty() {
                self.members
                    .add_participants(conversation, &[customer_participant])
                    .await?;
                return Ok(());
            }
        }
        let mut participants = vec![customer_participant];
        participants.extend(
            self.channels
                .admin_users(channel.id)
                .await?
                .into_iter()
                .map(Participant::User),
        );
        self.members
            .add_participants(conversation, &participants)
            .await?;
        Ok(())
    }

    /// Stores an agent reply and tries the platform once within the upstream
    /// timeout. Transient failures leave a delivery job on the outbound topic.
    pub async fn handle_outbound(
        &self,
        principal: Principal,
        request: OutboundRequest,
    ) -> OrchestratorResult<SentMessage> {
        let text = request.text.trim();
        if text.is_empty() && request.attachments.is_empty() {
            return Err(OrchestratorError::Invalid("message has no content".to_string()));
        }
        let conversation = self
            .conversation_for(principal, request.conversation_id)
            .await?;
        self.members
            .require_member(conversation.id, principal.participant())
            .await?;
        let channel = self.active_channel(conversation.channel_id).await?;
        if conversation.is_bot {
            self.hand_off_to_human(&conversation).await?;
        }

        let stored = self
            .store
            .upsert_message(NewMessage {
                conversation_id: conversation.id,
                channel_id: channel.id,
                sender_type: SenderType::User,
                sender_id: Some(principal.user_id),
                content_type: request.content_type,
                content: text.to_string(),
                attachments: request.attachments,
                external_id: None,
                client_key: request
                    .client_key
                    .map(|key| key.trim().to_string())
                    .filter(|key| !key.is_empty()),
                created_at: Utc::now(),
            })
            .await?;
        if !stored.created {
            let delivery_status = if stored.value.external_id.is_some() {
                DeliveryStatus::Delivered
            } else {
                DeliveryStatus::Pending
            };
            return Ok(SentMessage {
                message: stored.value,
                delivery_status,
                delivery_error: None,
            });
        }

        let message = stored.value;
        if let Err(err) = self
            .store
            .touch_conversation(conversation.id, message.created_at)
            .await
        {
            warn!(error = %err, conversation_id = conversation.id, "conversation touch failed");
        }

        let mut replaced = Vec::new();
        let sent = match self.send_to_platform(&channel, &conversation, &message).await {
            Ok(external_id) => {
                let patch = self.attach_external_id(message, &external_id).await;
                replaced = patch.replaced;
                SentMessage {
                    message: patch.message,
                    delivery_status: DeliveryStatus::Delivered,
                    delivery_error: None,
                }
            }
            Err(err) if err.is_retryable() => {
                warn!(
                    error = %err,
                    conversation_id = conversation.id,
                    message_id = message.id,
                    "send failed, queueing delivery"
                );
                let job = OutboundJob {
                    message_id: message.id,
                    conversation_id: conversation.id,
                    channel_id: channel.id,
                };
                match self.enqueue_delivery(&job, channel.shop_id).await {
                    Ok(_) => SentMessage {
                        message,
                        delivery_status: DeliveryStatus::Pending,
                        delivery_error: Some(err.to_string()),
                    },
                    Err(queue_err) => {
                        error!(
                            error = %queue_err,
                            message_id = message.id,
                            "delivery job could not be queued"
                        );
                        self.report_delivery_failure(&job, &err.to_string()).await;
                        SentMessage {
                            message,
                            delivery_status: DeliveryStatus::Failed,
                            delivery_error: Some(err.to_string()),
                        }
                    }
                }
            }
            Err(err) => {
                warn!(
                    error = %err,
                    conversation_id = conversation.id,
                    message_id = message.id,
                    "send rejected"
                );
                self.broadcaster
                    .publish(Delivery::conversation_error(
                        conversation.id,
                        Some(message.id),
                        &err.to_string(),
                    ))
                    .await;
                SentMessage {
                    message,
                    delivery_status: DeliveryStatus::Failed,
                    delivery_error: Some(err.to_string()),
                }
            }
        };

        self.broadcast_patched(&sent.message, &replaced).await;
        Ok(sent)
    }

    /// Retries a queued outbound message. Already delivered messages are a no-op.
    pub async fn deliver_outbound(&self, job: &OutboundJob) -> OrchestratorResult<Message> {
        let message = self
            .store
            .message_by_id(job.message_id)
            .await?
            .ok_or(OrchestratorError::MessageNotFound(job.message_id))?;
        if message.external_id.is_some() {
            return Ok(message);
        }
        let conversation = self
            .store
            .conversation_by_id(message.conversation_id)
            .await?
            .ok_or(OrchestratorError::ConversationNotFound(message.conversation_id))?;
        let channel = self.active_channel(conversation.channel_id).await?;
        let external_id = self
            .send_to_platform(&channel, &conversation, &message)
            .await?;
        let patch = self
            .store
            .set_message_external_id(message.id, &external_id)
            .await?;
        info!(
            conversation_id = conversation.id,
            message_id = patch.message.id,
            "queued message delivered"
        );
        self.broadcast_patched(&patch.message, &patch.replaced).await;
        Ok(patch.message)
    }

    pub async fn report_delivery_failure(&self, job: &OutboundJob, reason: &str) {
        self.broadcaster
            .publish(Delivery::conversation_error(
                job.conversation_id,
                Some(job.message_id),
                reason,
            ))
            .await;
    }

    /// Operator toggle for the automated agent.
    pub async fn set_bot(
        &self,
        principal: Principal,
        conversation_id: i64,
        enabled: bool,
    ) -> OrchestratorResult<Conversation> {
        let conversation = self.conversation_for(principal, conversation_id).await?;
        self.members
            .require_member(conversation.id, principal.participant())
            .await?;
        if conversation.is_bot == enabled {
            return Ok(conversation);
        }
        let updated = self
            .store
            .set_conversation_bot(conversation.id, enabled)
            .await?;
        info!(
            conversation_id = updated.id,
            user_id = principal.user_id,
            is_bot = enabled,
            "bot state changed"
        );
        self.publish_bot_state(&updated).await;
        Ok(updated)
    }

    /// A conversation visible to `principal`, or `ConversationNotFound`.
    pub async fn conversation_for(
        &self,
        principal: Principal,
        conversation_id: i64,
    ) -> OrchestratorResult<Conversation> {
        self.store
            .conversation_by_id(conversation_id)
            .await?
            .filter(|conversation| conversation.shop_id == principal.shop_id)
            .ok_or(OrchestratorError::ConversationNotFound(conversation_id))
    }

    async fn hand_off_to_human(&self, conversation: &Conversation) -> OrchestratorResult<()> {
        let updated = self
            .store
            .set_conversation_bot(conversation.id, false)
            .await?;
        info!(conversation_id = conversation.id, "human reply, bot disabled");
        self.publish_bot_state(&updated).await;
        Ok(())
    }

    async fn publish_bot_state(&self, conversation: &Conversation) {
        let users = self.member_users(conversation.id).await;
        self.broadcaster
            .publish(Delivery::bot_state_changed(conversation, users))
            .await;
    }

    async fn active_channel(&self, channel_id: i64) -> OrchestratorResult<Channel> {
        let channel = self
            .channels
            .channel(channel_id)
            .await?
            .ok_or_else(|| crate::error::StoreError::not_found("channel", channel_id))?;
        if !channel.active {
            return Err(OrchestratorError::InactiveChannel(channel.id));
        }
        Ok(channel)
    }

    async fn send_to_platform(
        &self,
        channel: &Channel,
        conversation: &Conversation,
        message: &Message,
    ) -> OrchestratorResult<String> {
        let adapter = self.adapters.get(channel.platform)?;
        let target = self.outbound_target(conversation).await?;
        let content = OutboundContent {
            content_type: message.content_type,
            text: message.content.clone(),
            attachments: message.attachments.clone(),
        };
        match tokio::time::timeout(
            self.upstream_timeout,
            adapter.send_message(channel, &target, &content),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(ChannelError::Timeout {
                platform: channel.platform,
                duration: self.upstream_timeout,
            }
            .into()),
        }
    }

    async fn outbound_target(&self, conversation: &Conversation) -> OrchestratorResult<OutboundTarget> {
        let customer_id = self
            .store
            .active_members(conversation.id)
            .await?
            .iter()
            .find_map(|member| member.participant.customer_id())
            .ok_or_else(|| {
                OrchestratorError::Invalid(format!(
                    "conversation {} has no customer to reply to",
                    conversation.id
                ))
            })?;
        let customer = self
            .store
            .customer_by_id(customer_id)
            .await?
            .ok_or_else(|| crate::error::StoreError::not_found("customer", customer_id))?;
        Ok(OutboundTarget {
            recipient_id: customer.external_id,
            thread_id: conversation.external_id.clone(),
        })
    }

    /// The platform already has the message, so a failed patch must not
    /// trigger another send.
    async fn attach_external_id(&self, mut message: Message, external_id: &str) -> ExternalIdPatch {
        match self
            .store
            .set_message_external_id(message.id, external_id)
            .await
        {
            Ok(patch) => patch,
            Err(err) => {
                error!(
                    error = %err,
                    message_id = message.id,
                    external_id,
                    "storing platform message id failed"
                );
                message.external_id = Some(external_id.to_string());
                ExternalIdPatch {
                    message,
                    replaced: Vec::new(),
                }
            }
        }
    }

    async fn enqueue_delivery(&self, job: &OutboundJob, shop_id: i64) -> OrchestratorResult<i64> {
        let payload = serde_json::to_value(job).map_err(QueueError::from)?;
        Ok(self
            .queue
            .enqueue(OUTBOUND_TOPIC, Some(shop_id), payload)
            .await?)
    }

    async fn member_users(&self, conversation_id: i64) -> Vec<i64> {
        match self.members.active_members(conversation_id).await {
            Ok(members) => member_user_ids(&members),
            Err(err) => {
                warn!(error = %err, conversation_id, "member lookup failed, broadcasting to room only");
                Vec::new()
            }
        }
    }

    async fn broadcast_message(&self, message: &Message) {
        let users = self.member_users(message.conversation_id).await;
        self.broadcaster
            .publish(Delivery::receive_message(message, users))
            .await;
    }

    async fn broadcast_patched(&self, message: &Message, replaced: &[i64]) {
        if replaced.is_empty() {
            return self.broadcast_message(message).await;
        }
        let users = self.member_users(message.conversation_id).await;
        self.broadcaster
            .publish(Delivery::receive_message_replacing(message, users, replaced))
            .await;
    }
}
