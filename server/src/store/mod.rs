//! Persistence boundary for channels, customers, conversations, members and
//! messages.
//!
//! Every create path is an insert-or-read keyed on a unique constraint, so
//! concurrent workers handling duplicate deliveries converge on one row
//! instead of racing a find-then-insert.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::StoreError,
    types::{
        Channel, Conversation, ConversationMember, ConversationSummary, Customer,
        CustomerProfile, ExternalIdPatch, Message, NewConversation, NewCustomer, NewMessage, Participant, Platform,
        Principal, ThreadKey, Upserted,
    },
};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ChatStore: Send + Sync {
    async fn ping(&self) -> StoreResult<()>;

    async fn principal_for_token(&self, token: &str) -> StoreResult<Option<Principal>>;

    async fn channel_by_id(&self, channel_id: i64) -> StoreResult<Option<Channel>>;

    async fn channel_by_app(
        &self,
        platform: Platform,
        external_app_id: &str,
    ) -> StoreResult<Option<Channel>>;

    async fn list_channels(&self) -> StoreResult<Vec<Channel>>;

    /// Internal users with standing access to every conversation of a channel.
    async fn channel_admin_users(&self, channel_id: i64) -> StoreResult<Vec<i64>>;

    async fn find_customer(
        &self,
        shop_id: i64,
        platform: Platform,
        external_id: &str,
    ) -> StoreResult<Option<Customer>>;

    async fn customer_by_id(&self, customer_id: i64) -> StoreResult<Option<Customer>>;

    async fn upsert_customer(&self, customer: NewCustomer) -> StoreResult<Upserted<Customer>>;

    async fn update_customer_profile(
        &self,
        customer_id: i64,
        profile: &CustomerProfile,
    ) -> StoreResult<Customer>;

    async fn conversation_by_id(&self, conversation_id: i64) -> StoreResult<Option<Conversation>>;

    async fn conversation_by_key(
        &self,
        channel_id: i64,
        key: &ThreadKey,
    ) -> StoreResult<Option<Conversation>>;

    /// Find-or-create by `(channel_id, key)`. An existing row only has its
    /// `updated_at` moved forward, never backward.
    async fn upsert_conversation(
        &self,
        conversation: NewConversation,
    ) -> StoreResult<Upserted<Conversation>>;

    async fn set_conversation_bot(
        &self,
        conversation_id: i64,
        is_bot: bool,
    ) -> StoreResult<Conversation>;

    async fn touch_conversation(&self, conversation_id: i64, at: DateTime<Utc>) -> StoreResult<()>;

    /// Whether an internal user has ever replied to this customer on the channel.
    async fn customer_has_human_reply(&self, channel_id: i64, customer_id: i64)
        -> StoreResult<bool>;

    /// Insert unless a row with the same `(channel_id, external_id)` or
    /// `(conversation_id, client_key)` already exists.
    async fn upsert_message(&self, message: NewMessage) -> StoreResult<Upserted<Message>>;

    async fn message_by_id(&self, message_id: i64) -> StoreResult<Option<Message>>;

    async fn message_by_external_id(
        &self,
        channel_id: i64,
        external_id: &str,
    ) -> StoreResult<Option<Message>>;

    /// Attach the platform id to an outbound message. A channel echo that was
    /// stored under the same id before the send call returned is folded away.
    async fn set_message_external_id(
        &self,
        message_id: i64,
        external_id: &str,
    ) -> StoreResult<ExternalIdPatch>;

    async fn latest_message(&self, conversation_id: i64) -> StoreResult<Option<Message>>;

    async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<Message>>;

    /// Adds every participant without an active membership in one transaction.
    async fn add_members(
        &self,
        conversation_id: i64,
        participants: &[Participant],
    ) -> StoreResult<Vec<Upserted<ConversationMember>>>;

    async fn remove_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>>;

    async fn active_members(&self, conversation_id: i64) -> StoreResult<Vec<ConversationMember>>;

    async fn active_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>>;

    /// Moves the read pointer to the newest stored message, never backwards.
    async fn advance_read_pointer(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>>;

    async fn unread_count(&self, conversation_id: i64, participant: Participant)
        -> StoreResult<i64>;

    async fn conversations_for(
        &self,
        shop_id: i64,
        participant: Participant,
        limit: i64,
    ) -> StoreResult<Vec<ConversationSummary>>;
}
