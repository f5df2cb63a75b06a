//! Real-time broadcast hub: which sockets belong to which users, which sockets
//! watch which conversation rooms, and delivery of `{event, data}` frames.

pub mod bus;
pub mod dedup;
pub mod socket;

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};
use uuid::Uuid;

use self::dedup::RecentKeys;
use crate::{
    error::HubError,
    types::{Conversation, ConversationMember, Message},
};

pub type ClientId = usize;

/// A socket anywhere in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketRef {
    pub instance: Uuid,
    pub client_id: ClientId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Target {
    /// Sockets joined to the room, plus every socket of `user_ids`.
    #[serde(rename_all = "camelCase")]
    Room {
        conversation_id: i64,
        #[serde(default)]
        user_ids: Vec<i64>,
        #[serde(default)]
        exclude: Option<SocketRef>,
    },
    #[serde(rename_all = "camelCase")]
    Users { user_ids: Vec<i64> },
}

/// One event on its way to client sockets. Deliveries with a key are dropped
/// when the same key was delivered recently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    #[serde(default)]
    pub key: Option<String>,
    pub target: Target,
    pub event: String,
    pub data: Value,
}

impl Delivery {
    pub fn receive_message(message: &Message, user_ids: Vec<i64>) -> Self {
        let key = match message.external_id.as_deref() {
            Some(external_id) => format!("{}:{external_id}", message.conversation_id),
            None => format!("{}:msg-{}", message.conversation_id, message.id),
        };
        Self {
            key: Some(key),
            target: Target::Room {
                conversation_id: message.conversation_id,
                user_ids,
                exclude: None,
            },
            event: "receiveMessage".to_string(),
            data: serde_json::to_value(message).unwrap_or(Value::Null),
        }
    }

    /// An outbound message that took over the platform id of channel echoes
    /// already shown to clients. The key is the stable row id, since the
    /// platform-id key was spent on the echo. `replaces` names the echo rows
    /// clients should drop.
    pub fn receive_message_replacing(message: &Message, user_ids: Vec<i64>, replaced: &[i64]) -> Self {
        let mut data = serde_json::to_value(message).unwrap_or(Value::Null);
        if let Value::Object(fields) = &mut data {
            fields.insert("replaces".to_string(), json!(replaced));
        }
        Self {
            key: Some(format!("{}:msg-{}", message.conversation_id, message.id)),
            target: Target::Room {
                conversation_id: message.conversation_id,
                user_ids,
                exclude: None,
            },
            event: "receiveMessage".to_string(),
            data,
        }
    }

    pub fn message_read(member: &ConversationMember, exclude: Option<SocketRef>) -> Self {
        Self {
            key: None,
            target: Target::Room {
                conversation_id: member.conversation_id,
                user_ids: Vec::new(),
                exclude,
            },
            event: "messageRead".to_string(),
            data: json!({
                "conversationId": member.conversation_id,
                "participantType": member.participant.kind(),
                "participantId": member.participant.id(),
                "lastMessageId": member.last_message_id,
            }),
        }
    }

    pub fn new_conversation(conversation: &Conversation, user_ids: Vec<i64>) -> Self {
        Self {
            key: None,
            target: Target::Users { user_ids },
            event: "newConversation".to_string(),
            data: serde_json::to_value(conversation).unwrap_or(Value::Null),
        }
    }

    pub fn bot_state_changed(conversation: &Conversation, user_ids: Vec<i64>) -> Self {
        Self {
            key: None,
            target: Target::Room {
                conversation_id: conversation.id,
                user_ids,
                exclude: None,
            },
            event: "botStateChanged".to_string(),
            data: json!({ "conversationId": conversation.id, "isBot": conversation.is_bot }),
        }
    }

    pub fn conversation_error(conversation_id: i64, message_id: Option<i64>, reason: &str) -> Self {
        Self {
            key: None,
            target: Target::Room {
                conversation_id,
                user_ids: Vec::new(),
                exclude: None,
            },
            event: "error".to_string(),
            data: json!({
                "conversationId": conversation_id,
                "messageId": message_id,
                "message": reason,
            }),
        }
    }
}

#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Best effort; delivery problems are logged, never returned.
    async fn publish(&self, delivery: Delivery);
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

struct ClientEntry {
    user_id: i64,
    tx: UnboundedSender<String>,
}

#[derive(Default)]
struct Room {
    sockets: HashSet<ClientId>,
    users: HashSet<i64>,
}

#[derive(Default)]
struct RealtimeRegistry {
    clients: HashMap<ClientId, ClientEntry>,
    user_sockets: HashMap<i64, HashSet<ClientId>>,
    rooms: HashMap<i64, Room>,
    joined: HashMap<ClientId, HashSet<i64>>,
}

impl RealtimeRegistry {
    fn leave(&mut self, client_id: ClientId, conversation_id: i64) {
        let user_id = self.clients.get(&client_id).map(|client| client.user_id);
        let Some(room) = self.rooms.get_mut(&conversation_id) else {
            return;
        };
        room.sockets.remove(&client_id);
        if let Some(user_id) = user_id {
            let still_present = room.sockets.iter().any(|socket| {
                self.clients
                    .get(socket)
                    .is_some_and(|client| client.user_id == user_id)
            });
            if !still_present {
                room.users.remove(&user_id);
            }
        }
        if room.sockets.is_empty() {
            self.rooms.remove(&conversation_id);
        }
    }
}

pub enum Fanout {
    Local,
    Postgres(PgPool),
}

pub struct Hub {
    instance: Uuid,
    registry: Mutex<RealtimeRegistry>,
    recent: Mutex<RecentKeys>,
    next_client_id: AtomicUsize,
    single_socket_per_user: bool,
    fanout: Fanout,
}

impl Hub {
    pub fn new(dedup_capacity: usize, single_socket_per_user: bool, fanout: Fanout) -> Self {
        Self {
            instance: Uuid::new_v4(),
            registry: Mutex::new(RealtimeRegistry::default()),
            recent: Mutex::new(RecentKeys::new(dedup_capacity)),
            next_client_id: AtomicUsize::new(0),
            single_socket_per_user,
            fanout,
        }
    }

    pub fn socket_ref(&self, client_id: ClientId) -> SocketRef {
        SocketRef {
            instance: self.instance,
            client_id,
        }
    }

    /// Binds a new socket to an authenticated user.
    pub fn connect(&self, user_id: i64, tx: UnboundedSender<String>) -> Result<ClientId, HubError> {
        let mut registry = self.registry.lock();
        let has_socket = registry
            .user_sockets
            .get(&user_id)
            .is_some_and(|sockets| !sockets.is_empty());
        if self.single_socket_per_user && has_socket {
            return Err(HubError::AlreadyConnected(user_id));
        }
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        registry
            .clients
            .insert(client_id, ClientEntry { user_id, tx });
        registry
            .user_sockets
            .entry(user_id)
            .or_default()
            .insert(client_id);
        Ok(client_id)
    }

    pub fn disconnect(&self, client_id: ClientId) {
        let mut registry = self.registry.lock();
        let rooms = registry.joined.remove(&client_id).unwrap_or_default();
        for conversation_id in rooms {
            registry.leave(client_id, conversation_id);
        }
        if let Some(client) = registry.clients.remove(&client_id) {
            if let Some(sockets) = registry.user_sockets.get_mut(&client.user_id) {
                sockets.remove(&client_id);
                if sockets.is_empty() {
                    registry.user_sockets.remove(&client.user_id);
                }
            }
        }
    }

    pub fn join_room(&self, client_id: ClientId, conversation_id: i64) -> Result<(), HubError> {
        let mut registry = self.registry.lock();
        let user_id = registry
            .clients
            .get(&client_id)
            .map(|client| client.user_id)
            .ok_or(HubError::UnknownSocket(client_id))?;
        let room = registry.rooms.entry(conversation_id).or_default();
        room.sockets.insert(client_id);
        room.users.insert(user_id);
        registry
            .joined
            .entry(client_id)
            .or_default()
            .insert(conversation_id);
        Ok(())
    }

    pub fn leave_room(&self, client_id: ClientId, conversation_id: i64) {
        let mut registry = self.registry.lock();
        if let Some(joined) = registry.joined.get_mut(&client_id) {
            joined.remove(&conversation_id);
        }
        registry.leave(client_id, conversation_id);
    }

    pub fn room_users(&self, conversation_id: i64) -> Vec<i64> {
        let registry = self.registry.lock();
        let mut users = registry
            .rooms
            .get(&conversation_id)
            .map(|room| room.users.iter().copied().collect::<Vec<_>>())
            .unwrap_or_default();
        users.sort_unstable();
        users
    }

    pub fn room_count(&self) -> usize {
        self.registry.lock().rooms.len()
    }

    pub fn user_socket_count(&self, user_id: i64) -> usize {
        self.registry
            .lock()
            .user_sockets
            .get(&user_id)
            .map(HashSet::len)
            .unwrap_or(0)
    }

    pub fn emit_to_client<T: Serialize>(&self, client_id: ClientId, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let tx = self
            .registry
            .lock()
            .clients
            .get(&client_id)
            .map(|client| client.tx.clone());
        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }

    /// Sends to the sockets this process owns. Returns how many were targeted.
    pub fn deliver_local(&self, delivery: &Delivery) -> usize {
        if let Some(key) = delivery.key.as_deref() {
            if !self.recent.lock().insert(key) {
                debug!(key, event = %delivery.event, "dropping repeated delivery");
                return 0;
            }
        }
        let Some(payload) = event_payload(&delivery.event, &delivery.data) else {
            return 0;
        };

        let senders = {
            let registry = self.registry.lock();
            let mut targets = HashSet::new();
            let user_ids = match &delivery.target {
                Target::Room {
                    conversation_id,
                    user_ids,
                    exclude,
                } => {
                    if let Some(room) = registry.rooms.get(conversation_id) {
                        targets.extend(room.sockets.iter().copied());
                    }
                    for user_id in user_ids {
                        if let Some(sockets) = registry.user_sockets.get(user_id) {
                            targets.extend(sockets.iter().copied());
                        }
                    }
                    if let Some(exclude) = exclude.filter(|socket| socket.instance == self.instance) {
                        targets.remove(&exclude.client_id);
                    }
                    Vec::new()
                }
                Target::Users { user_ids } => user_ids.clone(),
            };
            for user_id in &user_ids {
                if let Some(sockets) = registry.user_sockets.get(user_id) {
                    targets.extend(sockets.iter().copied());
                }
            }
            targets
                .into_iter()
                .filter_map(|client_id| registry.clients.get(&client_id).map(|client| client.tx.clone()))
                .collect::<Vec<_>>()
        };

        let count = senders.len();
        for sender in senders {
            let _ = sender.send(payload.clone());
        }
        count
    }
}

#[async_trait]
impl Broadcaster for Hub {
    async fn publish(&self, delivery: Delivery) {
        match &self.fanout {
            Fanout::Local => {
                self.deliver_local(&delivery);
            }
            Fanout::Postgres(pool) => {
                if let Err(err) = bus::notify(pool, &delivery).await {
                    warn!(error = %err, event = %delivery.event, "fan-out notify failed, delivering locally");
                    self.deliver_local(&delivery);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, Participant, SenderType};
    use chrono::Utc;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn hub() -> Hub {
        Hub::new(16, false, Fanout::Local)
    }

    fn message(conversation_id: i64, id: i64, external_id: Option<&str>) -> Message {
        Message {
            id,
            conversation_id,
            channel_id: 1,
            sender_type: SenderType::Customer,
            sender_id: Some(1),
            content_type: ContentType::Text,
            content: "hi".to_string(),
            attachments: vec![],
            external_id: external_id.map(str::to_string),
            client_key: None,
            created_at: Utc::now(),
        }
    }

    fn drain(rx: &mut UnboundedReceiver<String>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(serde_json::from_str(&frame).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn room_delivery_reaches_members_and_participant_users() {
        let hub = hub();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let (tx_c, mut rx_c) = unbounded_channel();
        let a = hub.connect(1, tx_a).unwrap();
        hub.connect(2, tx_b).unwrap();
        hub.connect(3, tx_c).unwrap();
        hub.join_room(a, 10).unwrap();

        hub.publish(Delivery::receive_message(&message(10, 1, Some("abc123")), vec![2]))
            .await;

        assert_eq!(drain(&mut rx_a)[0]["event"], "receiveMessage");
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert!(drain(&mut rx_c).is_empty());
    }

    #[tokio::test]
    async fn repeated_keys_are_dropped() {
        let hub = hub();
        let (tx, mut rx) = unbounded_channel();
        let client = hub.connect(1, tx).unwrap();
        hub.join_room(client, 42).unwrap();
        let delivery = Delivery::receive_message(&message(42, 7, Some("abc123")), vec![]);
        assert_eq!(hub.deliver_local(&delivery), 1);
        assert_eq!(hub.deliver_local(&delivery), 0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn read_receipt_skips_acking_socket() {
        let hub = hub();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        let a = hub.connect(1, tx_a).unwrap();
        let b = hub.connect(2, tx_b).unwrap();
        hub.join_room(a, 5).unwrap();
        hub.join_room(b, 5).unwrap();
        let member = ConversationMember {
            id: 1,
            conversation_id: 5,
            participant: Participant::User(1),
            joined_at: Utc::now(),
            left_at: None,
            last_message_id: Some(11),
            active: true,
        };
        hub.publish(Delivery::message_read(&member, Some(hub.socket_ref(a))))
            .await;
        assert!(drain(&mut rx_a).is_empty());
        let frames = drain(&mut rx_b);
        assert_eq!(frames[0]["data"]["lastMessageId"], 11);
    }

    #[test]
    fn rooms_are_torn_down_with_last_socket() {
        let hub = hub();
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        let a = hub.connect(1, tx_a).unwrap();
        let b = hub.connect(1, tx_b).unwrap();
        hub.join_room(a, 3).unwrap();
        hub.join_room(b, 3).unwrap();
        assert_eq!(hub.user_socket_count(1), 2);

        hub.disconnect(a);
        assert_eq!(hub.room_users(3), vec![1]);
        hub.leave_room(b, 3);
        assert_eq!(hub.room_count(), 0);
        hub.disconnect(b);
        assert_eq!(hub.user_socket_count(1), 0);
    }

    #[test]
    fn single_socket_mode_rejects_second_connection() {
        let hub = Hub::new(16, true, Fanout::Local);
        let (tx_a, _rx_a) = unbounded_channel();
        let (tx_b, _rx_b) = unbounded_channel();
        hub.connect(1, tx_a).unwrap();
        assert!(matches!(
            hub.connect(1, tx_b),
            Err(HubError::AlreadyConnected(1))
        ));
    }

    #[test]
    fn new_conversation_goes_only_to_named_users() {
        let hub = hub();
        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        hub.connect(1, tx_a).unwrap();
        hub.connect(2, tx_b).unwrap();
        let conversation = Conversation {
            id: 9,
            channel_id: 1,
            shop_id: 1,
            external_id: None,
            thread_key: "customer:1".to_string(),
            conversation_type: crate::types::ConversationType::Direct,
            is_bot: false,
            status: crate::types::ConversationStatus::Open,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        hub.deliver_local(&Delivery::new_conversation(&conversation, vec![2]));
        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b)[0]["event"], "newConversation");
    }
}
