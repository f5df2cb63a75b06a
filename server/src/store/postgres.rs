use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, types::Json, PgPool, Row};

use super::{ChatStore, StoreResult};
use crate::{
    error::StoreError,
    types::{
        Attachment, Channel, Conversation, ConversationMember, ConversationSummary, Customer,
        CustomerProfile, ExternalIdPatch, Message, NewConversation, NewCustomer, NewMessage,
        Participant, ParticipantType, Platform, Principal, ThreadKey, Upserted,
    },
};

const CHANNEL_COLUMNS: &str = "id, shop_id, platform, external_app_id, name, access_token, \
     refresh_token, config, active, has_active_agent, created_at, updated_at";
const CUSTOMER_COLUMNS: &str =
    "id, shop_id, platform, external_id, display_name, avatar_url, created_at, updated_at";
const CONVERSATION_COLUMNS: &str = "id, channel_id, shop_id, external_id, thread_key, \
     conversation_type, is_bot, status, created_at, updated_at";
const MEMBER_COLUMNS: &str = "id, conversation_id, participant_type, customer_id, user_id, \
     joined_at, left_at, last_message_id, active";
const MESSAGE_COLUMNS: &str = "id, conversation_id, channel_id, sender_type, sender_id, \
     content_type, content, attachments, external_id, client_key, created_at";

/// Matches the member row belonging to `($2 participant_type, $3 participant id)`.
const PARTICIPANT_CLAUSE: &str =
    "participant_type = $2 AND COALESCE(customer_id, user_id) = $3";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_text<T>(row: &PgRow, column: &'static str) -> StoreResult<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>()
        .map_err(|message| StoreError::Decode { column, message })
}

fn parse_channel_row(row: &PgRow) -> StoreResult<Channel> {
    Ok(Channel {
        id: row.try_get("id")?,
        shop_id: row.try_get("shop_id")?,
        platform: parse_text::<Platform>(row, "platform")?,
        external_app_id: row.try_get("external_app_id")?,
        name: row.try_get("name")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        config: row.try_get("config")?,
        active: row.try_get("active")?,
        has_active_agent: row.try_get("has_active_agent")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_customer_row(row: &PgRow) -> StoreResult<Customer> {
    Ok(Customer {
        id: row.try_get("id")?,
        shop_id: row.try_get("shop_id")?,
        platform: parse_text(row, "platform")?,
        external_id: row.try_get("external_id")?,
        display_name: row.try_get("display_name")?,
        avatar_url: row.try_get("avatar_url")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_conversation_row(row: &PgRow) -> StoreResult<Conversation> {
    Ok(Conversation {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        shop_id: row.try_get("shop_id")?,
        external_id: row.try_get("external_id")?,
        thread_key: row.try_get("thread_key")?,
        conversation_type: parse_text(row, "conversation_type")?,
        is_bot: row.try_get("is_bot")?,
        status: parse_text(row, "status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn parse_member_row(row: &PgRow) -> StoreResult<ConversationMember> {
    let kind = parse_text::<ParticipantType>(row, "participant_type")?;
    let participant = match kind {
        ParticipantType::Customer => {
            Participant::Customer(row.try_get::<Option<i64>, _>("customer_id")?.ok_or(
                StoreError::Decode {
                    column: "customer_id",
                    message: "customer member without customer_id".to_string(),
                },
            )?)
        }
        ParticipantType::User => Participant::User(row.try_get::<Option<i64>, _>("user_id")?.ok_or(
            StoreError::Decode {
                column: "user_id",
                message: "user member without user_id".to_string(),
            },
        )?),
    };
    Ok(ConversationMember {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        participant,
        joined_at: row.try_get("joined_at")?,
        left_at: row.try_get("left_at")?,
        last_message_id: row.try_get("last_message_id")?,
        active: row.try_get("active")?,
    })
}

fn parse_message_row(row: &PgRow) -> StoreResult<Message> {
    let Json(attachments) = row.try_get::<Json<Vec<Attachment>>, _>("attachments")?;
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        channel_id: row.try_get("channel_id")?,
        sender_type: parse_text(row, "sender_type")?,
        sender_id: row.try_get("sender_id")?,
        content_type: parse_text(row, "content_type")?,
        content: row.try_get("content")?,
        attachments,
        external_id: row.try_get("external_id")?,
        client_key: row.try_get("client_key")?,
        created_at: row.try_get("created_at")?,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[async_trait]
impl ChatStore for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn principal_for_token(&self, token: &str) -> StoreResult<Option<Principal>> {
        let row = sqlx::query(
            "SELECT user_id, shop_id FROM auth_tokens \
             WHERE token = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| {
            Ok(Principal {
                user_id: row.try_get("user_id")?,
                shop_id: row.try_get("shop_id")?,
            })
        })
        .transpose()
    }

    async fn channel_by_id(&self, channel_id: i64) -> StoreResult<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = $1"
        ))
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_channel_row).transpose()
    }

    async fn channel_by_app(
        &self,
        platform: Platform,
        external_app_id: &str,
    ) -> StoreResult<Option<Channel>> {
        let row = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels WHERE platform = $1 AND external_app_id = $2"
        ))
        .bind(platform.as_str())
        .bind(external_app_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_channel_row).transpose()
    }

    async fn list_channels(&self) -> StoreResult<Vec<Channel>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_channel_row).collect()
    }

    async fn channel_admin_users(&self, channel_id: i64) -> StoreResult<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM channel_admins WHERE channel_id = $1 ORDER BY user_id",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn find_customer(
        &self,
        shop_id: i64,
        platform: Platform,
        external_id: &str,
    ) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers \
             WHERE shop_id = $1 AND platform = $2 AND external_id = $3"
        ))
        .bind(shop_id)
        .bind(platform.as_str())
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_customer_row).transpose()
    }

    async fn customer_by_id(&self, customer_id: i64) -> StoreResult<Option<Customer>> {
        let row = sqlx::query(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_customer_row).transpose()
    }

    async fn upsert_customer(&self, customer: NewCustomer) -> StoreResult<Upserted<Customer>> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO customers (shop_id, platform, external_id, display_name, avatar_url) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (shop_id, platform, external_id) DO NOTHING \
             RETURNING {CUSTOMER_COLUMNS}"
        ))
        .bind(customer.shop_id)
        .bind(customer.platform.as_str())
        .bind(&customer.external_id)
        .bind(customer.profile.display_name.trim())
        .bind(customer.profile.avatar_url.trim())
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(parse_customer_row(&row)?));
        }
        let existing = self
            .find_customer(customer.shop_id, customer.platform, &customer.external_id)
            .await?
            .ok_or_else(|| StoreError::not_found("customer", &customer.external_id))?;
        Ok(Upserted::existing(existing))
    }

    async fn update_customer_profile(
        &self,
        customer_id: i64,
        profile: &CustomerProfile,
    ) -> StoreResult<Customer> {
        let row = sqlx::query(&format!(
            "UPDATE customers SET \
               display_name = CASE WHEN $2 = '' THEN display_name ELSE $2 END, \
               avatar_url = CASE WHEN $3 = '' THEN avatar_url ELSE $3 END, \
               updated_at = now() \
             WHERE id = $1 RETURNING {CUSTOMER_COLUMNS}"
        ))
        .bind(customer_id)
        .bind(profile.display_name.trim())
        .bind(profile.avatar_url.trim())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("customer", customer_id))?;
        parse_customer_row(&row)
    }

    async fn conversation_by_id(&self, conversation_id: i64) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn conversation_by_key(
        &self,
        channel_id: i64,
        key: &ThreadKey,
    ) -> StoreResult<Option<Conversation>> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE channel_id = $1 AND thread_key = $2"
        ))
        .bind(channel_id)
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_conversation_row).transpose()
    }

    async fn upsert_conversation(
        &self,
        conversation: NewConversation,
    ) -> StoreResult<Upserted<Conversation>> {
        // xmax is zero only for a row this statement inserted.
        let row = sqlx::query(&format!(
            "INSERT INTO conversations \
               (channel_id, shop_id, external_id, thread_key, conversation_type, is_bot, \
                created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, now(), $7) \
             ON CONFLICT (channel_id, thread_key) DO UPDATE SET \
               updated_at = GREATEST(conversations.updated_at, EXCLUDED.updated_at) \
             RETURNING {CONVERSATION_COLUMNS}, (xmax = 0) AS inserted"
        ))
        .bind(conversation.channel_id)
        .bind(conversation.shop_id)
        .bind(conversation.key.external_id())
        .bind(conversation.key.to_string())
        .bind(conversation.conversation_type.as_str())
        .bind(conversation.is_bot)
        .bind(conversation.updated_at)
        .fetch_one(&self.pool)
        .await?;
        let inserted: bool = row.try_get("inserted")?;
        let value = parse_conversation_row(&row)?;
        Ok(if inserted {
            Upserted::created(value)
        } else {
            Upserted::existing(value)
        })
    }

    async fn set_conversation_bot(
        &self,
        conversation_id: i64,
        is_bot: bool,
    ) -> StoreResult<Conversation> {
        let row = sqlx::query(&format!(
            "UPDATE conversations SET is_bot = $2, updated_at = GREATEST(updated_at, now()) \
             WHERE id = $1 RETURNING {CONVERSATION_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(is_bot)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
        parse_conversation_row(&row)
    }

    async fn touch_conversation(&self, conversation_id: i64, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            "UPDATE conversations SET updated_at = GREATEST(updated_at, $2) WHERE id = $1",
        )
        .bind(conversation_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn customer_has_human_reply(
        &self,
        channel_id: i64,
        customer_id: i64,
    ) -> StoreResult<bool> {
        let replied = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS ( \
               SELECT 1 FROM messages msg \
               JOIN conversation_members m ON m.conversation_id = msg.conversation_id \
               WHERE msg.channel_id = $1 AND msg.sender_type = 'user' AND m.customer_id = $2 \
             )",
        )
        .bind(channel_id)
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(replied)
    }

    async fn upsert_message(&self, message: NewMessage) -> StoreResult<Upserted<Message>> {
        let inserted = sqlx::query(&format!(
            "INSERT INTO messages \
               (conversation_id, channel_id, sender_type, sender_id, content_type, content, \
                attachments, external_id, client_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
             ON CONFLICT DO NOTHING \
             RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message.conversation_id)
        .bind(message.channel_id)
        .bind(message.sender_type.as_str())
        .bind(message.sender_id)
        .bind(message.content_type.as_str())
        .bind(&message.content)
        .bind(Json(&message.attachments))
        .bind(message.external_id.as_deref())
        .bind(message.client_key.as_deref())
        .bind(message.created_at)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = inserted {
            return Ok(Upserted::created(parse_message_row(&row)?));
        }

        let existing = if let Some(external_id) = message.external_id.as_deref() {
            self.message_by_external_id(message.channel_id, external_id)
                .await?
        } else {
            None
        };
        let existing = match (existing, message.client_key.as_deref()) {
            (Some(found), _) => Some(found),
            (None, Some(client_key)) => {
                let row = sqlx::query(&format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE conversation_id = $1 AND client_key = $2"
                ))
                .bind(message.conversation_id)
                .bind(client_key)
                .fetch_optional(&self.pool)
                .await?;
                row.as_ref().map(parse_message_row).transpose()?
            }
            (None, None) => None,
        };
        existing
            .map(Upserted::existing)
            .ok_or_else(|| StoreError::Constraint("message insert conflicted on no known key".into()))
    }

    async fn message_by_id(&self, message_id: i64) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
        ))
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_message_row).transpose()
    }

    async fn message_by_external_id(
        &self,
        channel_id: i64,
        external_id: &str,
    ) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE channel_id = $1 AND external_id = $2"
        ))
        .bind(channel_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_message_row).transpose()
    }

    async fn set_message_external_id(
        &self,
        message_id: i64,
        external_id: &str,
    ) -> StoreResult<ExternalIdPatch> {
        let mut tx = self.pool.begin().await?;
        let replaced = sqlx::query_scalar::<_, i64>(
            "DELETE FROM messages \
             WHERE channel_id = (SELECT channel_id FROM messages WHERE id = $1) \
               AND external_id = $2 AND id <> $1 AND sender_type = 'channel' \
             RETURNING id",
        )
        .bind(message_id)
        .bind(external_id)
        .fetch_all(&mut *tx)
        .await?;
        let updated = sqlx::query(&format!(
            "UPDATE messages SET external_id = $2 WHERE id = $1 RETURNING {MESSAGE_COLUMNS}"
        ))
        .bind(message_id)
        .bind(external_id)
        .fetch_optional(&mut *tx)
        .await;
        let row = match updated {
            Ok(Some(row)) => row,
            Ok(None) => return Err(StoreError::not_found("message", message_id)),
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::Constraint(format!(
                    "external id {external_id} already belongs to another message"
                )))
            }
            Err(err) => return Err(err.into()),
        };
        let message = parse_message_row(&row)?;
        tx.commit().await?;
        Ok(ExternalIdPatch { message, replaced })
    }

    async fn latest_message(&self, conversation_id: i64) -> StoreResult<Option<Message>> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(conversation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_message_row).transpose()
    }

    async fn list_messages(
        &self,
        conversation_id: i64,
        before: Option<i64>,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
               SELECT {MESSAGE_COLUMNS} FROM messages \
               WHERE conversation_id = $1 AND ($2::BIGINT IS NULL OR id < $2) \
               ORDER BY id DESC LIMIT $3 \
             ) page ORDER BY id ASC"
        ))
        .bind(conversation_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_message_row).collect()
    }

    async fn add_members(
        &self,
        conversation_id: i64,
        participants: &[Participant],
    ) -> StoreResult<Vec<Upserted<ConversationMember>>> {
        let mut tx = self.pool.begin().await?;
        let mut members = Vec::with_capacity(participants.len());
        for participant in participants {
            let inserted = sqlx::query(&format!(
                "INSERT INTO conversation_members \
                   (conversation_id, participant_type, customer_id, user_id) \
                 VALUES ($1, $2, $3, $4) \
                 ON CONFLICT DO NOTHING \
                 RETURNING {MEMBER_COLUMNS}"
            ))
            .bind(conversation_id)
            .bind(participant.kind().as_str())
            .bind(participant.customer_id())
            .bind(participant.user_id())
            .fetch_optional(&mut *tx)
            .await?;
            if let Some(row) = inserted {
                members.push(Upserted::created(parse_member_row(&row)?));
                continue;
            }
            let row = sqlx::query(&format!(
                "SELECT {MEMBER_COLUMNS} FROM conversation_members \
                 WHERE conversation_id = $1 AND active AND {PARTICIPANT_CLAUSE}"
            ))
            .bind(conversation_id)
            .bind(participant.kind().as_str())
            .bind(participant.id())
            .fetch_one(&mut *tx)
            .await?;
            members.push(Upserted::existing(parse_member_row(&row)?));
        }
        tx.commit().await?;
        Ok(members)
    }

    async fn remove_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>> {
        let row = sqlx::query(&format!(
            "UPDATE conversation_members SET active = FALSE, left_at = now() \
             WHERE conversation_id = $1 AND active AND {PARTICIPANT_CLAUSE} \
             RETURNING {MEMBER_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(participant.kind().as_str())
        .bind(participant.id())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_member_row).transpose()
    }

    async fn active_members(&self, conversation_id: i64) -> StoreResult<Vec<ConversationMember>> {
        let rows = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM conversation_members \
             WHERE conversation_id = $1 AND active ORDER BY id"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(parse_member_row).collect()
    }

    async fn active_member(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>> {
        let row = sqlx::query(&format!(
            "SELECT {MEMBER_COLUMNS} FROM conversation_members \
             WHERE conversation_id = $1 AND active AND {PARTICIPANT_CLAUSE}"
        ))
        .bind(conversation_id)
        .bind(participant.kind().as_str())
        .bind(participant.id())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_member_row).transpose()
    }

    async fn advance_read_pointer(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<Option<ConversationMember>> {
        let row = sqlx::query(&format!(
            "UPDATE conversation_members SET last_message_id = NULLIF(GREATEST( \
               COALESCE(last_message_id, 0), \
               COALESCE((SELECT MAX(id) FROM messages WHERE conversation_id = $1), 0) \
             ), 0) \
             WHERE conversation_id = $1 AND active AND {PARTICIPANT_CLAUSE} \
             RETURNING {MEMBER_COLUMNS}"
        ))
        .bind(conversation_id)
        .bind(participant.kind().as_str())
        .bind(participant.id())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(parse_member_row).transpose()
    }

    async fn unread_count(
        &self,
        conversation_id: i64,
        participant: Participant,
    ) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(msg.id) FROM conversation_members m \
             JOIN messages msg ON msg.conversation_id = m.conversation_id \
             WHERE m.conversation_id = $1 AND m.active \
               AND m.participant_type = $2 AND COALESCE(m.customer_id, m.user_id) = $3 \
               AND msg.id > COALESCE(m.last_message_id, 0) \
               AND NOT (msg.sender_type = m.participant_type \
                        AND msg.sender_id IS NOT DISTINCT FROM $3)",
        )
        .bind(conversation_id)
        .bind(participant.kind().as_str())
        .bind(participant.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn conversations_for(
        &self,
        shop_id: i64,
        participant: Participant,
        limit: i64,
    ) -> StoreResult<Vec<ConversationSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {columns}, ( \
               SELECT COUNT(*) FROM messages msg \
               WHERE msg.conversation_id = c.id \
                 AND msg.id > COALESCE(m.last_message_id, 0) \
                 AND NOT (msg.sender_type = m.participant_type \
                          AND msg.sender_id IS NOT DISTINCT FROM $2) \
             ) AS unread_count \
             FROM conversation_members m \
             JOIN conversations c ON c.id = m.conversation_id \
             WHERE m.active AND m.participant_type = $1 \
               AND COALESCE(m.customer_id, m.user_id) = $2 AND c.shop_id = $4 \
             ORDER BY c.updated_at DESC, c.id DESC LIMIT $3",
            columns = CONVERSATION_COLUMNS
                .split(", ")
                .map(|column| format!("c.{column}"))
                .collect::<Vec<_>>()
                .join(", ")
        ))
        .bind(participant.kind().as_str())
        .bind(participant.id())
        .bind(limit)
        .bind(shop_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in &rows {
            summaries.push(ConversationSummary {
                conversation: parse_conversation_row(row)?,
                unread_count: row.try_get("unread_count")?,
                last_message: None,
            });
        }
        if summaries.is_empty() {
            return Ok(summaries);
        }

        let ids = summaries
            .iter()
            .map(|summary| summary.conversation.id)
            .collect::<Vec<_>>();
        let latest = sqlx::query(&format!(
            "SELECT DISTINCT ON (conversation_id) {MESSAGE_COLUMNS} FROM messages \
             WHERE conversation_id = ANY($1) ORDER BY conversation_id, id DESC"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        for row in &latest {
            let message = parse_message_row(row)?;
            if let Some(summary) = summaries
                .iter_mut()
                .find(|summary| summary.conversation.id == message.conversation_id)
            {
                summary.last_message = Some(message);
            }
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ContentType, ConversationType, SenderType};

    async fn seed_channel(pool: &PgPool) -> i64 {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO channels (shop_id, platform, external_app_id, access_token) \
             VALUES (1, 'zalo', 'oa-1', 'tok') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .unwrap()
    }

    fn new_customer(external_id: &str) -> NewCustomer {
        NewCustomer {
            shop_id: 1,
            platform: Platform::Zalo,
            external_id: external_id.to_string(),
            profile: CustomerProfile::default(),
        }
    }

    fn new_conversation(channel_id: i64, customer_id: i64, at: DateTime<Utc>) -> NewConversation {
        NewConversation {
            channel_id,
            shop_id: 1,
            key: ThreadKey::Customer(customer_id),
            conversation_type: ConversationType::Direct,
            is_bot: false,
            updated_at: at,
        }
    }

    fn new_message(
        conversation_id: i64,
        channel_id: i64,
        sender: Participant,
        external_id: Option<&str>,
    ) -> NewMessage {
        let sender_type = match sender {
            Participant::Customer(_) => SenderType::Customer,
            Participant::User(_) => SenderType::User,
        };
        NewMessage {
            conversation_id,
            channel_id,
            sender_type,
            sender_id: Some(sender.id()),
            content_type: ContentType::Text,
            content: "hello".to_string(),
            attachments: vec![],
            external_id: external_id.map(str::to_string),
            client_key: None,
            created_at: Utc::now(),
        }
    }

    async fn seed_conversation(store: &PgStore) -> (i64, i64, i64) {
        let channel_id = seed_channel(store.pool()).await;
        let customer = store.upsert_customer(new_customer("u-1")).await.unwrap().value;
        let conversation = store
            .upsert_conversation(new_conversation(channel_id, customer.id, Utc::now()))
            .await
            .unwrap()
            .value;
        (channel_id, customer.id, conversation.id)
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_redelivery_stores_one_message(pool: PgPool) {
        let store = PgStore::new(pool);
        let (channel_id, customer_id, conversation_id) = seed_conversation(&store).await;
        let sender = Participant::Customer(customer_id);

        let (first, second) = tokio::join!(
            store.upsert_message(new_message(conversation_id, channel_id, sender, Some("m-1"))),
            store.upsert_message(new_message(conversation_id, channel_id, sender, Some("m-1"))),
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        assert_eq!(first.value.id, second.value.id);
        assert_eq!(u8::from(first.created) + u8::from(second.created), 1);
        let stored = store.list_messages(conversation_id, None, 10).await.unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_first_contact_creates_one_conversation(pool: PgPool) {
        let store = PgStore::new(pool);
        let channel_id = seed_channel(store.pool()).await;

        let (first, second) = tokio::join!(
            store.upsert_customer(new_customer("u-1")),
            store.upsert_customer(new_customer("u-1")),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.value.id, second.value.id);
        assert_eq!(u8::from(first.created) + u8::from(second.created), 1);

        let customer_id = first.value.id;
        let (first, second) = tokio::join!(
            store.upsert_conversation(new_conversation(channel_id, customer_id, Utc::now())),
            store.upsert_conversation(new_conversation(channel_id, customer_id, Utc::now())),
        );
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.value.id, second.value.id);
        assert_eq!(u8::from(first.created) + u8::from(second.created), 1);

        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM conversations")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn conversation_updated_at_never_moves_back(pool: PgPool) {
        let store = PgStore::new(pool);
        let (channel_id, customer_id, conversation_id) = seed_conversation(&store).await;
        let later = Utc::now() + chrono::Duration::minutes(5);
        store.touch_conversation(conversation_id, later).await.unwrap();

        let stale = store
            .upsert_conversation(new_conversation(
                channel_id,
                customer_id,
                later - chrono::Duration::hours(1),
            ))
            .await
            .unwrap();
        assert!(!stale.created);
        assert_eq!(
            stale.value.updated_at.timestamp_micros(),
            later.timestamp_micros()
        );

        store
            .touch_conversation(conversation_id, later - chrono::Duration::hours(2))
            .await
            .unwrap();
        let stored = store.conversation_by_id(conversation_id).await.unwrap().unwrap();
        assert_eq!(stored.updated_at.timestamp_micros(), later.timestamp_micros());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn read_pointer_only_moves_forward(pool: PgPool) {
        let store = PgStore::new(pool);
        let (channel_id, customer_id, conversation_id) = seed_conversation(&store).await;
        let customer = Participant::Customer(customer_id);
        let agent = Participant::User(10);
        store
            .add_members(conversation_id, &[customer, agent])
            .await
            .unwrap();

        let inbound = store
            .upsert_message(new_message(conversation_id, channel_id, customer, Some("m-1")))
            .await
            .unwrap()
            .value;
        assert_eq!(store.unread_count(conversation_id, agent).await.unwrap(), 1);
        assert_eq!(store.unread_count(conversation_id, customer).await.unwrap(), 0);

        let read = store
            .advance_read_pointer(conversation_id, agent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.last_message_id, Some(inbound.id));
        assert_eq!(store.unread_count(conversation_id, agent).await.unwrap(), 0);

        // A stale pointer in the row must not be lowered by a later advance.
        sqlx::query(
            "UPDATE conversation_members SET last_message_id = $2 \
             WHERE conversation_id = $1 AND user_id = 10",
        )
        .bind(conversation_id)
        .bind(inbound.id + 100)
        .execute(store.pool())
        .await
        .unwrap();
        let read = store
            .advance_read_pointer(conversation_id, agent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.last_message_id, Some(inbound.id + 100));

        store.remove_member(conversation_id, agent).await.unwrap();
        assert!(store
            .advance_read_pointer(conversation_id, agent)
            .await
            .unwrap()
            .is_none());
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn external_id_patch_deletes_the_channel_echo(pool: PgPool) {
        let store = PgStore::new(pool);
        let (channel_id, _, conversation_id) = seed_conversation(&store).await;
        let reply = store
            .upsert_message(new_message(conversation_id, channel_id, Participant::User(10), None))
            .await
            .unwrap()
            .value;
        let mut echo = new_message(conversation_id, channel_id, Participant::User(10), Some("zm-1"));
        echo.sender_type = SenderType::Channel;
        echo.sender_id = None;
        let echo = store.upsert_message(echo).await.unwrap().value;

        let patch = store.set_message_external_id(reply.id, "zm-1").await.unwrap();

        assert_eq!(patch.replaced, vec![echo.id]);
        assert_eq!(patch.message.external_id.as_deref(), Some("zm-1"));
        assert!(store.message_by_id(echo.id).await.unwrap().is_none());
        assert_eq!(
            store
                .message_by_external_id(channel_id, "zm-1")
                .await
                .unwrap()
                .map(|message| message.id),
            Some(reply.id)
        );
    }
}
