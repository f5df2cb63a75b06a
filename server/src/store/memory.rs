use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use super::{ChatStore, StoreResult};
use crate::{
    error::StoreError,
    types::{
        Channel, Conversation, ConversationMember, ConversationStatus, ConversationSummary,
        Customer, CustomerProfile, ExternalIdPatch, Message, NewConversation, NewCustomer, NewMessage, Participant,
        Platform, Principal, SenderType, ThreadKey, Upserted,
    },
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    tokens: HashMap<String, Principal>,
    channels: BTreeMap<i64, Channel>,
    channel_admins: HashMap<i64, Vec<i64>>,
    customers: BTreeMap<i64, Customer>,
    conversations: BTreeMap<i64, Conversation>,
    members: BTreeMap<i64, ConversationMember>,
    messages: BTreeMap<i64, Message>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn active_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> Option<&ConversationMember> {
        self.members.values().find(|member| {
            member.active
                && member.conversation_id == conversation_id
                && member.participant == participant
        })
    }

    fn latest_message_id(&self, conversation_id: i64) -> Option<i64> {
        self.messages
            .values()
            .filter(|message| message.conversation_id == conversation_id)
            .map(|message| message.id)
            .max()
    }

    fn unread(&self, member: &ConversationMember) -> i64 {
        let pointer = member.last_message_id.unwrap_or(0);
        self.messages
            .values()
            .filter(|message| {
                message.conversation_id == member.conversation_id
                    && message.id > pointer
                    && !member.participant.authored(message)
            })
            .count() as i64
    }
}

/// Process-local store backing tests and `STORE_BACKEND=memory`. A single
/// lock around all tables makes every insert-or-read atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    channel_listing_down: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `list_channels` fail like an exhausted pool, for health checks.
    pub fn break_channel_listing(&self) {
        self.channel_listing_down.store(true, Ordering::Relaxed);
    }

    pub fn insert_channel(
        &self,
        shop_id: i64,
        platform: Platform,
        external_app_id: &str,
        access_token: &str,
        config: Value,
    ) -> Channel {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        let channel = Channel {
            id: tables.next_id(),
            shop_id,
            platform,
            external_app_id: external_app_id.to_string(),
            name: format!("{platform} {external_app_id}"),
            access_token: access_token.to_string(),
            refresh_token: String::new(),
            config,
            active: true,
            has_active_agent: false,
            created_at: now,
            updated_at: now,
        };
        tables.channels.insert(channel.id, channel.clone());
        channel
    }

    pub fn update_channel(&self, channel_id: i64, apply: impl FnOnce(&mut Channel)) {
        if let Some(channel) = self.tables.lock().channels.get_mut(&channel_id) {
            apply(channel);
        }
    }

    pub fn add_channel_admin(&self, channel_id: i64, user_id: i64) {
        let mut tables = self.tables.lock();
        let admins = tables.channel_admins.entry(channel_id).or_default();
        if !admins.contains(&user_id) {
            admins.push(user_id);
        }
    }

    pub fn insert_token(&self, token: &str, principal: Principal) {
        self.tables
            .lock()
            .tokens
            .insert(token.to_string(), principal);
    }

    pub fn message_count(&self, conversation_id: i64) -> usize {
        self.tables
            .lock()
            .messages
            .values()
            .filter(|message| message.conversation_id == conversation_id)
            .count()
    }

    pub fn conversation_count(&self) -> usize {
        self.tables.lock().conversations.len()
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn principal_for_token(&self, token: &str) -> StoreResult<Option<Principal>> {
        Ok(self.tables.lock().tokens.get(token).copied())
    }

    async fn channel_by_id(&self, channel_id: i64) -> StoreResult<Option<Channel>> {
        Ok(self.tables.lock().channels.get(&channel_id).cloned())
    }

    async fn channel_by_app(
        &self,
        platform: Platform,
        external_app_id: &str,
    ) -> StoreResult<Option<Channel>> {
        Ok(self
            .tables
            .lock()
            .channels
            .values()
            .find(|channel| {
                channel.platform == platform && channel.external_app_id == external_app_id
            })
            .cloned())
    }

    async fn list_channels(&self) -> StoreResult<Vec<Channel>> {
        if self.channel_listing_down.load(Ordering::Relaxed) {
            return Err(StoreError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(self.tables.lock().channels.values().cloned().collect())
    }

    async fn channel_admin_users(&self, channel_id: i64) -> StoreResult<Vec<i64>> {
        let mut admins = self
            .tables
            .lock()
            .channel_admins
            .get(&channel_id)
            .cloned()
            .unwrap_or_default();
        admins.sort_unstable();
        Ok(admins)
    }

    async fn find_customer(
        &self,
        shop_id: i64,
        platform: Platform,
        external_id: &str,
    ) -> StoreResult<Option<Customer>> {
        Ok(self
            .tables
            .lock()
            .customers
            .values()
            .find(|customer| {
                customer.shop_id == shop_id
                    && customer.platform == platform
                    && customer.external_id == external_id
            })
            .cloned())
    }

    async fn customer_by_id(&self, customer_id: i64) -> StoreResult<Option<Customer>> {
        Ok(self.tables.lock().customers.get(&customer_id).cloned())
    }

    async fn upsert_customer(&self, customer: NewCustomer) -> StoreResult<Upserted<Customer>> {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.customers.values().find(|row| {
            row.shop_id == customer.shop_id
                && row.platform == customer.platform
                && row.external_id == customer.external_id
        }) {
            return Ok(Upserted::existing(existing.clone()));
        }
        let now = Utc::now();
        let row = Customer {
            id: tables.next_id(),
            shop_id: customer.shop_id,
            platform: customer.platform,
            external_id: customer.external_id,
            display_name: customer.profile.display_name.trim().to_string(),
            avatar_url: customer.profile.avatar_url.trim().to_string(),
            created_at: now,
            updated_at: now,
        };
        tables.customers.insert(row.id, row.clone());
        Ok(Upserted::created(row))
    }

    async fn update_customer_profile(
        &self,
        customer_id: i64,
        profile: &CustomerProfile,
    ) -> StoreResult<Customer> {
        let mut tables = self.tables.lock();
        let customer = tables
            .customers
            .get_mut(&customer_id)
            .ok_or_else(|| StoreError::not_found("customer", customer_id))?;
        if !profile.display_name.trim().is_empty() {
            customer.display_name = profile.display_name.trim().to_string();
        }
        if !profile.avatar_url.trim().is_empty() {
            customer.avatar_url = profile.avatar_url.trim().to_string();
        }
        customer.updated_at = Utc::now();
        Ok(customer.clone())
    }

    async fn conversation_by_id(&self, conversation_id: i64) -> StoreResult<Option<Conversation>> {
        Ok(self.tables.lock().conversations.get(&conversation_id).cloned())
    }

    async fn conversation_by_key(
        &self,
        channel_id: i64,
        key: &ThreadKey,
    ) -> StoreResult<Option<Conversation>> {
        let thread_key = key.to_string();
        Ok(self
            .tables
            .lock()
            .conversations
            .values()
            .find(|row| row.channel_id == channel_id && row.thread_key == thread_key)
            .cloned())
    }

    async fn upsert_conversation(
        &self,
        conversation: NewConversation,
    ) -> StoreResult<Upserted<Conversation>> {
        let thread_key = conversation.key.to_string();
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.conversations.values_mut().find(|row| {
            row.channel_id == conversation.channel_id && row.thread_key == thread_key
        }) {
            existing.updated_at = existing.updated_at.max(conversation.updated_at);
            return Ok(Upserted::existing(existing.clone()));
        }
        let row = Conversation {
            id: tables.next_id(),
            channel_id: conversation.channel_id,
            shop_id: conversation.shop_id,
            external_id: conversation.key.external_id().map(str::to_string),
            thread_key,
            conversation_type: conversation.conversation_type,
            is_bot: conversation.is_bot,
            status: ConversationStatus::Open,
            created_at: Utc::now(),
            updated_at: conversation.updated_at,
        };
        tables.conversations.insert(row.id, row.clone());
        Ok(Upserted::created(row))
    }

    async fn set_conversation_bot(
        &self,
        conversation_id: i64,
        is_bot: bool,
    ) -> StoreResult<Conversation> {
        let mut tables = self.tables.lock();
        let row = tables
            .conversations
            .get_mut(&conversation_id)
            .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
        row.is_bot = is_bot;
        row.updated_at = row.updated_at.max(Utc::now());
        Ok(row.clone())
    }

    async fn touch_conversation(&self, conversation_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        if let Some(row) = self.tables.lock().conversations.get_mut(&conversation_id) {
            row.updated_at = row.updated_at.max(at);
        }
        Ok(())
    }

    async fn customer_has_human_reply(
        &self,
        channel_id: i64,
        customer_id: i64,
    ) -> StoreResult<bool> {
        let tables = self.tables.lock();
        let conversations = tables
            .members
            .values()
            .filter(|member| member.participant == Participant::Customer(customer_id))
            .map(|member| member.conversation_id)
            .collect::<HashSet<_>>();
        Ok(tables.messages.values().any(|message| {
            message.channel_id == channel_id
                && message.sender_type == SenderType::User
                && conversations.contains(&message.conversation_id)
        }))
    }

    async fn upsert_message(&self, message: NewMessage) -> StoreResult<Upserted<Message>> {
        let mut tables = self.tables.lock();
        let existing = tables.messages.values().find(|row| {
            let same_external = match (&message.external_id, &row.external_id) {
                (Some(incoming), Some(stored)) => {
                    row.channel_id == message.channel_id && incoming == stored
                }
                _ => false,
            };
            let same_client_key = match (&message.client_key, &row.client_key) {
                (Some(incoming), Some(stored)) => {
                    row.conversation_id == message.conversation_id && incoming == stored
                }
                _ => false,
            };
            same_external || same_client_key
        });
        if let Some(existing) = existing {
            return Ok(Upserted::existing(existing.clone()));
        }
        let row = Message {
            id: tables.next_id(),
            conversation_id: message.conversation_id,
            channel_id: message.channel_id,
            sender_type: message.sender_type,
            sender_id: message.sender_id,
            content_type: message.content_type,
            content: message.content,
            attachments: message.attachments,
            external_id: message.external_id,
            client_key: message.client_key,
            created_at: message.created_at,
        };
        tables.messages.insert(row.id, row.clone());
        Ok(Upserted::created(row))
    }

    async fn message_by_id(&self, message_id: i64) -> StoreResult<Option<Message>> {
        Ok(self.tables.lock().messages.get(&message_id).cloned())
    }

    async fn message_by_external_id(
        &self,
        channel_id: i64,
        external_id: &str,
    ) -> StoreResult<Option<Message>> {
        Ok(self
            .tables
            .lock()
            .messages
            .values()
            .find(|row| {
                row.channel_id == channel_id && row.external_id.as_deref() == Some(external_id)
            })
            .cloned())
    }

    async fn set_message_external_id(
        &self,
        message_id: i64,
        external_id: &str,
    ) -> StoreResult<ExternalIdPatch> {
        let mut tables = self.tables.lock();
        let channel_id = tables
            .messages
            .get(&message_id)
            .map(|row| row.channel_id)
            .ok_or_else(|| StoreError::not_found("message", message_id))?;
        let holders = tables
            .messages
            .values()
            .filter(|row| {
                row.id != message_id
                    && row.channel_id == channel_id
                    && row.external_id.as_deref() == Some(external_id)
            })
            .map(|row| (row.id, row.sender_type))
            .collect::<Vec<_>>();
        if holders
            .iter()
            .any(|(_, sender_type)| *sender_type != SenderType::Channel)
        {
            return Err(StoreError::Constraint(format!(
                "external id {external_id} already belongs to another message"
            )));
        }
        let replaced = holders.into_iter().map(|(id, _)| id).collect::<Vec<_>>();
        for id in &replaced {
            tables.messages.remove(id);
        }
        let row = tables
            .messages
            .get_mut(&message_id)
            .ok_or_else(|| StoreError::not_found("message", message_id))?;
        row.external_id = Some(external_id.to_string());
        Ok(ExternalIdPatch {
            message: row.clone(),
            replaced,
        })
    }

    async fn latest_message(&self, conversation_id: i64) -> StoreResult<Option<Message>> {
        Ok(self
            .tables
            .lock()
            .messages
            .values()
            .rev()
            .find(|row| row.conversation_id == conversation_id)
            .cloned())
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let tables = self.tables.lock();
        let mut page = tables
            .messages
            .values()
            .rev()
            .filter(|row| row.conversation_id == conversation_id)
            .filter(|row| before.map_or(true, |before| row.id < before))
            .take(limit.max(0) as usize)
            .cloned()
            .collect::<Vec<_>>();
        page.reverse();
        Ok(page)
    }

    async fn add_members(
        &self,
        conversation_id: i64,
        participants: &[Participant],
    ) -> StoreResult<Vec<Upserted<ConversationMember>>> {
        let mut tables = self.tables.lock();
        let mut result = Vec::with_capacity(participants.len());
        for participant in participants {
            if let Some(existing) = tables.active_member(conversation_id, *participant) {
                result.push(Upserted::existing(existing.clone()));
                continue;
            }
            let member = ConversationMember {
                id: tables.next_id(),
                conversation_id,
                participant: *participant,
                joined_at: Utc::now(),
                left_at: None,
                last_message_id: None,
                active: true,
            };
            tables.members.insert(member.id, member.clone());
            result.push(Upserted::created(member));
        }
        Ok(result)
    }

    async fn remove_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>> {
        let mut tables = self.tables.lock();
        let Some(member_id) = tables
            .active_member(conversation_id, participant)
            .map(|member| member.id)
        else {
            return Ok(None);
        };
        let member = tables.members.get_mut(&member_id).map(|member| {
            member.active = false;
            member.left_at = Some(Utc::now());
            member.clone()
        });
        Ok(member)
    }

    async fn active_members(&self, conversation_id: i64) -> StoreResult<Vec<ConversationMember>> {
        Ok(self
            .tables
            .lock()
            .members
            .values()
            .filter(|member| member.active && member.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn active_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>> {
        Ok(self
            .tables
            .lock()
            .active_member(conversation_id, participant)
            .cloned())
    }

    async fn advance_read_pointer(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>> {
        let mut tables = self.tables.lock();
        let latest = tables.latest_message_id(conversation_id);
        let Some(member_id) = tables
            .active_member(conversation_id, participant)
            .map(|member| member.id)
        else {
            return Ok(None);
        };
        Ok(tables.members.get_mut(&member_id).map(|member| {
            member.last_message_id = member.last_message_id.max(latest);
            member.clone()
        }))
    }

    async fn unread_count(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<i64> {
        let tables = self.tables.lock();
        Ok(tables
            .active_member(conversation_id, participant)
            .map(|member| tables.unread(member))
            .unwrap_or(0))
    }

    async fn conversations_for(
        &self,
        shop_id: i64,
        participant: Participant,
        limit: i64,
    ) -> StoreResult<Vec<ConversationSummary>> {
        let tables = self.tables.lock();
        let mut summaries = tables
            .members
            .values()
            .filter(|member| member.active && member.participant == participant)
            .filter_map(|member| {
                let conversation = tables
                    .conversations
                    .get(&member.conversation_id)
                    .filter(|conversation| conversation.shop_id == shop_id)?
                    .clone();
                let last_message = tables
                    .messages
                    .values()
                    .rev()
                    .find(|row| row.conversation_id == conversation.id)
                    .cloned();
                Some(ConversationSummary {
                    conversation,
                    unread_count: tables.unread(member),
                    last_message,
                })
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| {
            b.conversation
                .updated_at
                .cmp(&a.conversation.updated_at)
                .then(b.conversation.id.cmp(&a.conversation.id))
        });
        summaries.truncate(limit.max(0) as usize);
        Ok(summaries)
    }
}
