use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Zalo,
    Facebook,
    Lazada,
}

impl Platform {
    pub const ALL: [Platform; 3] = [Platform::Zalo, Platform::Facebook, Platform::Lazada];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Zalo => "zalo",
            Platform::Facebook => "facebook",
            Platform::Lazada => "lazada",
        }
    }

    /// Durable queue topic that carries this platform's inbound webhook events.
    pub fn inbound_topic(&self) -> String {
        format!("inbound.{}", self.as_str())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "zalo" | "zalo_oa" => Ok(Platform::Zalo),
            "facebook" | "messenger" | "fb" => Ok(Platform::Facebook),
            "lazada" => Ok(Platform::Lazada),
            other => Err(format!("unknown platform '{other}'")),
        }
    }
}

macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim() {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!(concat!("invalid ", stringify!($name), " '{}'"), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Direct,
    Group,
}

text_enum!(ConversationType { Direct => "direct", Group => "group" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationStatus {
    Open,
    Archived,
}

text_enum!(ConversationStatus { Open => "open", Archived => "archived" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    Customer,
    User,
}

text_enum!(ParticipantType { Customer => "customer", User => "user" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderType {
    Customer,
    User,
    Assistant,
    Channel,
}

text_enum!(SenderType {
    Customer => "customer",
    User => "user",
    Assistant => "assistant",
    Channel => "channel",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Text,
    Image,
    File,
    Audio,
    Video,
    Sticker,
}

text_enum!(ContentType {
    Text => "text",
    Image => "image",
    File => "file",
    Audio => "audio",
    Video => "video",
    Sticker => "sticker",
});

impl ContentType {
    pub fn from_attachment_kind(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "image" | "photo" | "gif" => ContentType::Image,
            "audio" | "voice" => ContentType::Audio,
            "video" => ContentType::Video,
            "sticker" => ContentType::Sticker,
            _ => ContentType::File,
        }
    }
}

/// A conversation participant. Customers and internal users live in separate
/// id spaces, so the kind is always carried next to the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "participantType", content = "participantId", rename_all = "lowercase")]
pub enum Participant {
    Customer(i64),
    User(i64),
}

impl Participant {
    pub fn kind(&self) -> ParticipantType {
        match self {
            Participant::Customer(_) => ParticipantType::Customer,
            Participant::User(_) => ParticipantType::User,
        }
    }

    pub fn id(&self) -> i64 {
        match self {
            Participant::Customer(id) | Participant::User(id) => *id,
        }
    }

    pub fn user_id(&self) -> Option<i64> {
        match self {
            Participant::User(id) => Some(*id),
            Participant::Customer(_) => None,
        }
    }

    pub fn customer_id(&self) -> Option<i64> {
        match self {
            Participant::Customer(id) => Some(*id),
            Participant::User(_) => None,
        }
    }

    /// True when `message` was authored by this participant.
    pub fn authored(&self, message: &Message) -> bool {
        match (self, message.sender_type) {
            (Participant::Customer(id), SenderType::Customer) => message.sender_id == Some(*id),
            (Participant::User(id), SenderType::User) => message.sender_id == Some(*id),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: i64,
    pub shop_id: i64,
    pub platform: Platform,
    pub external_app_id: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub access_token: String,
    #[serde(skip_serializing)]
    pub refresh_token: String,
    #[serde(default)]
    pub config: Value,
    pub active: bool,
    pub has_active_agent: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Channel {
    pub fn config_text(&self, key: &str) -> String {
        self.config
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string()
    }

    pub fn has_credentials(&self) -> bool {
        !self.access_token.trim().is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: i64,
    pub shop_id: i64,
    pub platform: Platform,
    pub external_id: String,
    pub display_name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Customer {
    pub fn has_profile(&self) -> bool {
        !self.display_name.trim().is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerProfile {
    pub display_name: String,
    pub avatar_url: String,
}

impl CustomerProfile {
    pub fn is_empty(&self) -> bool {
        self.display_name.trim().is_empty() && self.avatar_url.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct NewCustomer {
    pub shop_id: i64,
    pub platform: Platform,
    pub external_id: String,
    pub profile: CustomerProfile,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: i64,
    pub channel_id: i64,
    pub shop_id: i64,
    pub external_id: Option<String>,
    pub thread_key: String,
    pub conversation_type: ConversationType,
    pub is_bot: bool,
    pub status: ConversationStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The unique key a conversation is found-or-created by within its channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ThreadKey {
    External(String),
    Customer(i64),
}

impl ThreadKey {
    pub fn for_event(external_thread_id: Option<&str>, customer_id: i64) -> Self {
        match external_thread_id.map(str::trim).filter(|id| !id.is_empty()) {
            Some(thread_id) => ThreadKey::External(thread_id.to_string()),
            None => ThreadKey::Customer(customer_id),
        }
    }

    pub fn external_id(&self) -> Option<&str> {
        match self {
            ThreadKey::External(id) => Some(id),
            ThreadKey::Customer(_) => None,
        }
    }
}

impl fmt::Display for ThreadKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadKey::External(id) => write!(f, "thread:{id}"),
            ThreadKey::Customer(id) => write!(f, "customer:{id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewConversation {
    pub channel_id: i64,
    pub shop_id: i64,
    pub key: ThreadKey,
    pub conversation_type: ConversationType,
    pub is_bot: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMember {
    pub id: i64,
    pub conversation_id: i64,
    #[serde(flatten)]
    pub participant: Participant,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub last_message_id: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub unread_count: i64,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub kind: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: i64,
    pub channel_id: i64,
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub content_type: ContentType,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: i64,
    pub channel_id: i64,
    pub sender_type: SenderType,
    pub sender_id: Option<i64>,
    pub content_type: ContentType,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub external_id: Option<String>,
    pub client_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An outbound message after its platform id was attached. `replaced` holds
/// the ids of channel echoes that had been stored under the same id.
#[derive(Debug, Clone)]
pub struct ExternalIdPatch {
    pub message: Message,
    pub replaced: Vec<i64>,
}

/// Result of an insert-or-read keyed on a unique constraint.
#[derive(Debug, Clone)]
pub struct Upserted<T> {
    pub value: T,
    pub created: bool,
}

impl<T> Upserted<T> {
    pub fn created(value: T) -> Self {
        Self {
            value,
            created: true,
        }
    }

    pub fn existing(value: T) -> Self {
        Self {
            value,
            created: false,
        }
    }
}

/// Verified caller identity attached to API and socket requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: i64,
    pub shop_id: i64,
}

impl Principal {
    pub fn participant(&self) -> Participant {
        Participant::User(self.user_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Pending,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SentMessage {
    #[serde(flatten)]
    pub message: Message,
    pub delivery_status: DeliveryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery_error: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub conversation_id: i64,
    pub content: String,
    #[serde(default)]
    pub message_type: ContentType,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesQuery {
    pub before: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddMembersBody {
    #[serde(default)]
    pub user_ids: Vec<i64>,
    #[serde(default)]
    pub customer_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotToggleBody {
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestBody {
    #[serde(default)]
    pub job_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventEnvelopeIn {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinConversationData {
    pub conversation_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendToConversationData {
    pub conversation_id: i64,
    pub message: String,
    #[serde(default)]
    pub message_type: ContentType,
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAsReadData {
    pub conversation_id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
}
