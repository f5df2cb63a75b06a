use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::{
    error::{OrchestratorError, StoreError},
    realtime::{Broadcaster, Delivery, SocketRef},
    store::ChatStore,
    types::{Conversation, ConversationMember, Message, Participant, Upserted},
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub member: ConversationMember,
    pub last_message: Option<Message>,
    pub unread_count: i64,
}

/// User ids among `members`, used to address their sockets directly.
pub fn member_user_ids(members: &[ConversationMember]) -> Vec<i64> {
    members
        .iter()
        .filter_map(|member| member.participant.user_id())
        .collect()
}

pub struct MembershipTracker {
    store: Arc<dyn ChatStore>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl MembershipTracker {
    pub fn new(store: Arc<dyn ChatStore>, broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Adds the participants in one batch. Internal users who were not
    /// already members get a `newConversation` notification.
    pub async fn add_participants(
        &self,
        conversation: &Conversation,
        participants: &[Participant],
    ) -> Result<Vec<Upserted<ConversationMember>>, StoreError> {
        if participants.is_empty() {
            return Ok(Vec::new());
        }
        let members = self.store.add_members(conversation.id, participants).await?;
        let added_users = members
            .iter()
            .filter(|member| member.created)
            .filter_map(|member| member.value.participant.user_id())
            .collect::<Vec<_>>();
        if !added_users.is_empty() {
            debug!(
                conversation_id = conversation.id,
                users = ?added_users,
                "notifying new members"
            );
            self.broadcaster
                .publish(Delivery::new_conversation(conversation, added_users))
                .await;
        }
        Ok(members)
    }

    pub async fn remove_participant(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> Result<Option<ConversationMember>, StoreError> {
        self.store.remove_member(conversation_id, participant).await
    }

    pub async fn active_members(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ConversationMember>, StoreError> {
        self.store.active_members(conversation_id).await
    }

    pub async fn require_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> Result<ConversationMember, OrchestratorError> {
        self.store
            .active_member(conversation_id, participant)
            .await?
            .ok_or(OrchestratorError::NotMember(conversation_id))
    }

    /// Moves the read pointer to the conversation's newest message. Client
    /// supplied message ids are never consulted, so the pointer only moves
    /// forward. The receipt goes to everyone in the room except `origin`.
    pub async fn mark_read(
        &self,
        conversation_id: i64,
        participant: Participant,
        origin: Option<SocketRef>,
    ) -> Result<ReadReceipt, OrchestratorError> {
        let member = self
            .store
            .advance_read_pointer(conversation_id, participant)
            .await?
            .ok_or(OrchestratorError::NotMember(conversation_id))?;
        let last_message = match member.last_message_id {
            Some(message_id) => self.store.message_by_id(message_id).await?,
            None => None,
        };
        let unread_count = self
            .store
            .unread_count(conversation_id, participant)
            .await?;
        self.broadcaster
            .publish(Delivery::message_read(&member, origin))
            .await;
        Ok(ReadReceipt {
            member,
            last_message,
            unread_count,
        })
    }

    pub async fn unread_count(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> Result<i64, StoreError> {
        self.store.unread_count(conversation_id, participant).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        types::{ContentType, ConversationType, NewConversation, NewMessage, SenderType, ThreadKey},
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use proptest::prelude::*;

    #[derive(Default)]
    pub(crate) struct RecordingBroadcaster {
        pub deliveries: Mutex<Vec<Delivery>>,
    }

    impl RecordingBroadcaster {
        pub fn events(&self) -> Vec<String> {
            self.deliveries
                .lock()
                .iter()
                .map(|delivery| delivery.event.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Broadcaster for RecordingBroadcaster {
        async fn publish(&self, delivery: Delivery) {
            self.deliveries.lock().push(delivery);
        }
    }

    async fn conversation(store: &MemoryStore) -> Conversation {
        store
            .upsert_conversation(NewConversation {
                channel_id: 1,
                shop_id: 1,
                key: ThreadKey::Customer(1),
                conversation_type: ConversationType::Direct,
                is_bot: false,
                updated_at: Utc::now(),
            })
            .await
            .unwrap()
            .value
    }

    async fn post(store: &MemoryStore, conversation_id: i64, sender: Participant) -> Message {
        let sender_type = match sender {
            Participant::Customer(_) => SenderType::Customer,
            Participant::User(_) => SenderType::User,
        };
        store
            .upsert_message(NewMessage {
                conversation_id,
                channel_id: 1,
                sender_type,
                sender_id: Some(sender.id()),
                content_type: ContentType::Text,
                content: "m".to_string(),
                attachments: vec![],
                external_id: None,
                client_key: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap()
            .value
    }

    fn tracker() -> (Arc<MemoryStore>, Arc<RecordingBroadcaster>, MembershipTracker) {
        let store = Arc::new(MemoryStore::new());
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let tracker = MembershipTracker::new(store.clone(), broadcaster.clone());
        (store, broadcaster, tracker)
    }

    #[tokio::test]
    async fn only_newly_added_users_are_notified() {
        let (store, broadcaster, tracker) = tracker();
        let conversation = conversation(&store).await;
        tracker
            .add_participants(&conversation, &[Participant::Customer(1), Participant::User(2)])
            .await
            .unwrap();
        tracker
            .add_participants(&conversation, &[Participant::User(2), Participant::User(3)])
            .await
            .unwrap();
        let deliveries = broadcaster.deliveries.lock().clone();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(
            deliveries[1].target,
            crate::realtime::Target::Users { user_ids: vec![3] }
        );
    }

    #[tokio::test]
    async fn stale_client_read_does_not_rewind() {
        // MarkRead after message 10, message 11 arrives, MarkRead again.
        let (store, _broadcaster, tracker) = tracker();
        let conversation = conversation(&store).await;
        let agent = Participant::User(5);
        let customer = Participant::Customer(1);
        tracker
            .add_participants(&conversation, &[agent, customer])
            .await
            .unwrap();
        post(&store, conversation.id, customer).await;
        let first = tracker.mark_read(conversation.id, agent, None).await.unwrap();
        let newest = post(&store, conversation.id, customer).await;
        assert_eq!(tracker.unread_count(conversation.id, agent).await.unwrap(), 1);

        let second = tracker.mark_read(conversation.id, agent, None).await.unwrap();
        assert!(second.member.last_message_id > first.member.last_message_id);
        assert_eq!(second.member.last_message_id, Some(newest.id));
        assert_eq!(second.unread_count, 0);
        assert_eq!(second.last_message.map(|message| message.id), Some(newest.id));
    }

    #[tokio::test]
    async fn non_member_cannot_mark_read() {
        let (store, broadcaster, tracker) = tracker();
        let conversation = conversation(&store).await;
        let err = tracker
            .mark_read(conversation.id, Participant::User(9), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotMember(_)));
        assert!(broadcaster.events().is_empty());
    }

    proptest! {
        #[test]
        fn unread_counts_only_others_after_pointer(
            senders in proptest::collection::vec(0u8..3, 1..30),
            read_at in 0usize..30,
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async {
                let (store, _broadcaster, tracker) = tracker();
                let conversation = conversation(&store).await;
                let reader = Participant::User(1);
                let others = [Participant::User(2), Participant::Customer(1)];
                tracker.add_participants(&conversation, &[reader]).await.unwrap();

                let read_at = read_at.min(senders.len());
                let mut previous_pointer = None;
                for (index, sender) in senders.iter().enumerate() {
                    if index == read_at {
                        let receipt = tracker.mark_read(conversation.id, reader, None).await.unwrap();
                        prop_assert!(receipt.member.last_message_id >= previous_pointer);
                        previous_pointer = receipt.member.last_message_id;
                    }
                    let author = match sender {
                        0 => reader,
                        n => others[usize::from(*n) - 1],
                    };
                    post(&store, conversation.id, author).await;
                }
                if read_at == senders.len() {
                    tracker.mark_read(conversation.id, reader, None).await.unwrap();
                }

                let expected = senders
                    .iter()
                    .skip(read_at)
                    .filter(|sender| **sender != 0)
                    .count() as i64;
                let unread = tracker.unread_count(conversation.id, reader).await.unwrap();
                prop_assert_eq!(unread, expected);
                Ok(())
            })?;
        }
    }
}
