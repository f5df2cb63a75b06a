//! Facebook Messenger adapter (Graph API, page-scoped ids).

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use super::{
    adapter::{
        header_text, millis_at, require_token, text_at, ChannelAdapter, EventDirection,
        HistoryPage, HistoryRequest, HttpSettings, InboundEvent, OutboundContent, OutboundTarget,
    },
    signature::verify_hub_signature,
};
use crate::{
    error::ChannelError,
    types::{Attachment, Channel, ContentType, CustomerProfile, Platform},
};

const PLATFORM: Platform = Platform::Facebook;

pub struct FacebookAdapter {
    http: HttpSettings,
    graph_base: String,
    app_secret: String,
    verify_token: String,
}

impl FacebookAdapter {
    pub fn new(http: HttpSettings, graph_base: &str, app_secret: &str, verify_token: &str) -> Self {
        Self {
            http,
            graph_base: graph_base.trim_end_matches('/').to_string(),
            app_secret: app_secret.to_string(),
            verify_token: verify_token.to_string(),
        }
    }
}

fn graph_error(status: u16, body: &Value) -> Option<ChannelError> {
    let error = body.get("error")?;
    let message = text_at(error, &["message"]);
    Some(ChannelError::Rejected {
        platform: PLATFORM,
        message: format!("graph error {status}: {message}"),
    })
}

fn parse_attachments(message: &Value) -> Vec<Attachment> {
    message
        .get("attachments")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let url = text_at(item, &["payload", "url"]);
                    (!url.is_empty()).then(|| Attachment {
                        kind: text_at(item, &["type"]).to_ascii_lowercase(),
                        url: url.to_string(),
                        name: None,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_messaging(page_id: &str, item: &Value) -> Option<InboundEvent> {
    let message = item.get("message")?;
    let is_echo = message.get("is_echo").and_then(Value::as_bool).unwrap_or(false);
    let sender = text_at(item, &["sender", "id"]);
    let recipient = text_at(item, &["recipient", "id"]);
    let (direction, customer_id) = if is_echo {
        (EventDirection::Echo, recipient)
    } else {
        (EventDirection::Inbound, sender)
    };
    let attachments = parse_attachments(message);
    let content_type = attachments
        .first()
        .map(|attachment| ContentType::from_attachment_kind(&attachment.kind))
        .unwrap_or(ContentType::Text);
    Some(InboundEvent {
        platform: PLATFORM,
        channel_app_id: page_id.to_string(),
        external_sender_id: customer_id.to_string(),
        external_message_id: text_at(message, &["mid"]).to_string(),
        external_thread_id: None,
        direction,
        content_type,
        text: text_at(message, &["text"]).to_string(),
        attachments,
        timestamp: millis_at(item, "timestamp").unwrap_or_else(Utc::now),
    })
}

fn outbound_message(content: &OutboundContent) -> Value {
    match content.attachments.first() {
        Some(attachment) => {
            let kind = match content.content_type {
                ContentType::Image | ContentType::Sticker => "image",
                ContentType::Audio => "audio",
                ContentType::Video => "video",
                _ => "file",
            };
            json!({
                "attachment": {
                    "type": kind,
                    "payload": { "url": attachment.url, "is_reusable": true },
                }
            })
        }
        None => json!({ "text": content.text }),
    }
}

fn graph_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z")
        .ok()
        .map(|value| value.with_timezone(&Utc))
}

#[async_trait]
impl ChannelAdapter for FacebookAdapter {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ChannelError> {
        if verify_hub_signature(
            &self.app_secret,
            header_text(headers, "x-hub-signature-256"),
            body,
        ) {
            Ok(())
        } else {
            Err(ChannelError::InvalidSignature { platform: PLATFORM })
        }
    }

    fn verify_subscription(&self, query: &HashMap<String, String>) -> Option<String> {
        let mode = query.get("hub.mode").map(String::as_str).unwrap_or("");
        let token = query.get("hub.verify_token").map(String::as_str).unwrap_or("");
        if mode != "subscribe" || self.verify_token.is_empty() || token != self.verify_token {
            return None;
        }
        query.get("hub.challenge").cloned()
    }

    fn parse_webhook(&self, payload: &Value) -> Result<Vec<InboundEvent>, ChannelError> {
        if text_at(payload, &["object"]) != "page" {
            return Err(ChannelError::invalid(PLATFORM, "expected object=page"));
        }
        let mut events = Vec::new();
        let entries = payload
            .get("entry")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for entry in &entries {
            let page_id = text_at(entry, &["id"]);
            let Some(messaging) = entry.get("messaging").and_then(Value::as_array) else {
                continue;
            };
            for item in messaging {
                let Some(event) = parse_messaging(page_id, item) else {
                    continue;
                };
                match event.validate() {
                    Ok(()) => events.push(event),
                    Err(err) => tracing::warn!(error = %err, page_id, "skipping messenger event"),
                }
            }
        }
        Ok(events)
    }

    async fn fetch_profile(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<CustomerProfile, ChannelError> {
        let token = require_token(channel)?;
        let response = self
            .http
            .client
            .get(format!("{}/{external_id}", self.graph_base))
            .query(&[
                ("fields", "first_name,last_name,profile_pic"),
                ("access_token", token),
            ])
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(self.http.request_error(PLATFORM))?;
        let body = self.http.read_json(PLATFORM, response).await?;
        let display_name = [text_at(&body, &["first_name"]), text_at(&body, &["last_name"])]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(CustomerProfile {
            display_name,
            avatar_url: text_at(&body, &["profile_pic"]).to_string(),
        })
    }

    async fn send_message(
        &self,
        channel: &Channel,
        target: &OutboundTarget,
        content: &OutboundContent,
    ) -> Result<String, ChannelError> {
        let token = require_token(channel)?;
        let payload = json!({
            "recipient": { "id": target.recipient_id },
            "messaging_type": "RESPONSE",
            "message": outbound_message(content),
        });
        let response = self
            .http
            .client
            .post(format!("{}/me/messages", self.graph_base))
            .query(&[("access_token", token)])
            .json(&payload)
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(self.http.request_error(PLATFORM))?;
        let status = response.status().as_u16();
        let body = match self.http.read_json(PLATFORM, response).await {
            Ok(body) => body,
            // Graph 4xx bodies explain the rejection; keep 429 and 5xx transient.
            Err(ChannelError::Upstream { body, .. }) if (400..500).contains(&status) && status != 429 => {
                let parsed = serde_json::from_str::<Value>(&body).unwrap_or(Value::Null);
                return Err(graph_error(status, &parsed).unwrap_or(ChannelError::Upstream {
                    platform: PLATFORM,
                    status,
                    body,
                }));
            }
            Err(err) => return Err(err),
        };
        let message_id = text_at(&body, &["message_id"]);
        if message_id.is_empty() {
            return Err(ChannelError::invalid(PLATFORM, "send response without message_id"));
        }
        Ok(message_id.to_string())
    }

    async fn fetch_history(
        &self,
        channel: &Channel,
        request: &HistoryRequest,
    ) -> Result<HistoryPage, ChannelError> {
        let token = require_token(channel)?;
        let limit = request.limit.clamp(1, 100).to_string();
        let mut query = vec![
            (
                "fields",
                "participants,messages.limit(25){id,message,from,created_time}".to_string(),
            ),
            ("limit", limit),
            ("access_token", token.to_string()),
        ];
        if let Some(cursor) = request.cursor.as_deref() {
            query.push(("after", cursor.to_string()));
        }
        let response = self
            .http
            .client
            .get(format!("{}/me/conversations", self.graph_base))
            .query(&query)
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(self.http.request_error(PLATFORM))?;
        let body = self.http.read_json(PLATFORM, response).await?;

        let page_id = channel.external_app_id.as_str();
        let mut events = Vec::new();
        let threads = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for thread in &threads {
            let customer_id = thread
                .get("participants")
                .and_then(|participants| participants.get("data"))
                .and_then(Value::as_array)
                .and_then(|items| {
                    items
                        .iter()
                        .map(|item| text_at(item, &["id"]))
                        .find(|id| !id.is_empty() && *id != page_id)
                })
                .unwrap_or("");
            let messages = thread
                .get("messages")
                .and_then(|messages| messages.get("data"))
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for message in messages.iter().rev() {
                let from = text_at(message, &["from", "id"]);
                let direction = if from == page_id {
                    EventDirection::Echo
                } else {
                    EventDirection::Inbound
                };
                let event = InboundEvent {
                    platform: PLATFORM,
                    channel_app_id: page_id.to_string(),
                    external_sender_id: customer_id.to_string(),
                    external_message_id: text_at(message, &["id"]).to_string(),
                    external_thread_id: None,
                    direction,
                    content_type: ContentType::Text,
                    text: text_at(message, &["message"]).to_string(),
                    attachments: Vec::new(),
                    timestamp: graph_time(text_at(message, &["created_time"]))
                        .unwrap_or_else(Utc::now),
                };
                if event.validate().is_ok() {
                    events.push(event);
                }
            }
        }
        let next_cursor = body
            .get("paging")
            .and_then(|paging| paging.get("next"))
            .map(|_| text_at(&body, &["paging", "cursors", "after"]).to_string())
            .filter(|cursor| !cursor.is_empty());
        Ok(HistoryPage {
            events,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::{
        matchers::{method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn adapter(base: &str) -> FacebookAdapter {
        FacebookAdapter::new(
            HttpSettings::new(reqwest::Client::new(), Duration::from_millis(500)),
            base,
            "",
            "verify-me",
        )
    }

    fn channel() -> Channel {
        Channel {
            id: 5,
            shop_id: 1,
            platform: Platform::Facebook,
            external_app_id: "page-1".to_string(),
            name: "page".to_string(),
            access_token: "page-token".to_string(),
            refresh_token: String::new(),
            config: json!({}),
            active: true,
            has_active_agent: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn content(text: &str) -> OutboundContent {
        OutboundContent {
            content_type: ContentType::Text,
            text: text.to_string(),
            attachments: vec![],
        }
    }

    fn target() -> OutboundTarget {
        OutboundTarget {
            recipient_id: "psid-1".to_string(),
            thread_id: None,
        }
    }

    #[test]
    fn parses_messages_and_echoes_skipping_receipts() {
        let payload = json!({
            "object": "page",
            "entry": [{
                "id": "page-1",
                "messaging": [
                    { "sender": { "id": "psid-1" }, "recipient": { "id": "page-1" },
                      "timestamp": 1700000000000_i64,
                      "message": { "mid": "mid.1", "text": "hello" } },
                    { "sender": { "id": "page-1" }, "recipient": { "id": "psid-1" },
                      "timestamp": 1700000001000_i64,
                      "message": { "mid": "mid.2", "text": "hi there", "is_echo": true } },
                    { "sender": { "id": "psid-1" }, "recipient": { "id": "page-1" },
                      "delivery": { "mids": ["mid.2"] } }
                ]
            }]
        });
        let events = adapter("http://unused").parse_webhook(&payload).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].direction, EventDirection::Inbound);
        assert_eq!(events[1].direction, EventDirection::Echo);
        assert_eq!(events[1].external_sender_id, "psid-1");
        assert!(events.iter().all(|event| event.channel_app_id == "page-1"));
    }

    #[test]
    fn rejects_non_page_objects() {
        let err = adapter("http://unused")
            .parse_webhook(&json!({ "object": "instagram" }))
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidPayload { .. }));
    }

    #[test]
    fn subscription_handshake_requires_matching_token() {
        let adapter = adapter("http://unused");
        let mut query = HashMap::new();
        query.insert("hub.mode".to_string(), "subscribe".to_string());
        query.insert("hub.verify_token".to_string(), "verify-me".to_string());
        query.insert("hub.challenge".to_string(), "12345".to_string());
        assert_eq!(adapter.verify_subscription(&query).as_deref(), Some("12345"));

        query.insert("hub.verify_token".to_string(), "wrong".to_string());
        assert!(adapter.verify_subscription(&query).is_none());
    }

    #[tokio::test]
    async fn send_returns_message_id() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .and(query_param("access_token", "page-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "recipient_id": "psid-1",
                "message_id": "mid.out.1"
            })))
            .mount(&server)
            .await;

        let id = adapter(&server.uri())
            .send_message(&channel(), &target(), &content("hi"))
            .await
            .unwrap();
        assert_eq!(id, "mid.out.1");
    }

    #[tokio::test]
    async fn graph_client_error_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/me/messages"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "error": { "message": "outside allowed window", "code": 10 }
            })))
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .send_message(&channel(), &target(), &content("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn slow_upstream_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "message_id": "late" }))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .send_message(&channel(), &target(), &content("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn profile_joins_names() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/psid-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "first_name": "Lan",
                "last_name": "Nguyen",
                "profile_pic": "https://pic"
            })))
            .mount(&server)
            .await;

        let profile = adapter(&server.uri())
            .fetch_profile(&channel(), "psid-1")
            .await
            .unwrap();
        assert_eq!(profile.display_name, "Lan Nguyen");
        assert_eq!(profile.avatar_url, "https://pic");
    }

    #[test]
    fn parses_graph_timestamps() {
        let parsed = graph_time("2024-03-01T10:00:00+0000").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-03-01T10:00:00+00:00");
    }
}
