//! Zalo Official Account adapter.
//!
//! Webhooks carry one event per request. `user_send_*` events come from the
//! customer; `oa_send_*` events echo what the OA itself sent, including replies
//! made from the Zalo console.

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::{json, Value};

use super::{
    adapter::{
        header_text, millis_at, require_token, text_at, ChannelAdapter, EventDirection,
        HistoryPage, HistoryRequest, HttpSettings, InboundEvent, OutboundContent, OutboundTarget,
    },
    signature::verify_zalo_signature,
};
use crate::{
    error::ChannelError,
    types::{Attachment, Channel, ContentType, CustomerProfile, Platform},
};

const PLATFORM: Platform = Platform::Zalo;

pub struct ZaloAdapter {
    http: HttpSettings,
    api_base: String,
    oa_secret_key: String,
}

impl ZaloAdapter {
    pub fn new(http: HttpSettings, api_base: &str, oa_secret_key: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            oa_secret_key: oa_secret_key.to_string(),
        }
    }

    async fn get_json(&self, channel: &Channel, path: &str, data: Value) -> Result<Value, ChannelError> {
        let token = require_token(channel)?;
        let response = self
            .http
            .client
            .get(format!("{}{path}", self.api_base))
            .header("access_token", token)
            .query(&[("data", data.to_string())])
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(self.http.request_error(PLATFORM))?;
        let body = self.http.read_json(PLATFORM, response).await?;
        check_error_code(&body)?;
        Ok(body)
    }
}

/// Zalo answers HTTP 200 with a non-zero `error` field on failure.
fn check_error_code(body: &Value) -> Result<(), ChannelError> {
    let code = body.get("error").and_then(Value::as_i64).unwrap_or(0);
    if code == 0 {
        return Ok(());
    }
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Err(ChannelError::Rejected {
        platform: PLATFORM,
        message: format!("error {code}: {message}"),
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
                    if url.is_empty() {
                        return None;
                    }
                    let name = text_at(item, &["payload", "name"]);
                    Some(Attachment {
                        kind: text_at(item, &["type"]).to_ascii_lowercase(),
                        url: url.to_string(),
                        name: (!name.is_empty()).then(|| name.to_string()),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn content_type_for(attachments: &[Attachment]) -> ContentType {
    attachments
        .first()
        .map(|attachment| ContentType::from_attachment_kind(&attachment.kind))
        .unwrap_or(ContentType::Text)
}

fn outbound_message(content: &OutboundContent) -> Value {
    let Some(attachment) = content.attachments.first() else {
        return json!({ "text": content.text });
    };
    match content.content_type {
        ContentType::Image | ContentType::Sticker => json!({
            "text": content.text,
            "attachment": {
                "type": "template",
                "payload": {
                    "template_type": "media",
                    "elements": [{ "media_type": "image", "url": attachment.url }],
                },
            },
        }),
        _ => {
            let text = if content.text.trim().is_empty() {
                attachment.url.as_str()
            } else {
                content.text.as_str()
            };
            json!({ "text": text })
        }
    }
}

#[async_trait]
impl ChannelAdapter for ZaloAdapter {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ChannelError> {
        let payload = serde_json::from_slice::<Value>(body)
            .map_err(|err| ChannelError::invalid(PLATFORM, err.to_string()))?;
        let app_id = text_at(&payload, &["app_id"]);
        let timestamp = match payload.get("timestamp") {
            Some(Value::String(text)) => text.clone(),
            Some(Value::Number(number)) => number.to_string(),
            _ => String::new(),
        };
        if verify_zalo_signature(
            &self.oa_secret_key,
            header_text(headers, "x-zevent-signature"),
            app_id,
            &timestamp,
            body,
        ) {
            Ok(())
        } else {
            Err(ChannelError::InvalidSignature { platform: PLATFORM })
        }
    }

    fn parse_webhook(&self, payload: &Value) -> Result<Vec<InboundEvent>, ChannelError> {
        let event_name = text_at(payload, &["event_name"]);
        let direction = if event_name.starts_with("user_send_") {
            EventDirection::Inbound
        } else if event_name.starts_with("oa_send_") {
            EventDirection::Echo
        } else {
            return Ok(Vec::new());
        };
        let Some(message) = payload.get("message") else {
            return Err(ChannelError::invalid(PLATFORM, "event without message"));
        };
        let sender = text_at(payload, &["sender", "id"]);
        let recipient = text_at(payload, &["recipient", "id"]);
        let (oa_id, customer_id) = match direction {
            EventDirection::Inbound => (recipient, sender),
            EventDirection::Echo => (sender, recipient),
        };
        let attachments = parse_attachments(message);
        let event = InboundEvent {
            platform: PLATFORM,
            channel_app_id: oa_id.to_string(),
            external_sender_id: customer_id.to_string(),
            external_message_id: text_at(message, &["msg_id"]).to_string(),
            external_thread_id: None,
            direction,
            content_type: content_type_for(&attachments),
            text: text_at(message, &["text"]).to_string(),
            attachments,
            timestamp: millis_at(payload, "timestamp").unwrap_or_else(Utc::now),
        };
        event.validate()?;
        Ok(vec![event])
    }

    async fn fetch_profile(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<CustomerProfile, ChannelError> {
        let body = self
            .get_json(channel, "/v3.0/oa/user/detail", json!({ "user_id": external_id }))
            .await?;
        let data = body.get("data").cloned().unwrap_or(Value::Null);
        Ok(CustomerProfile {
            display_name: text_at(&data, &["display_name"]).to_string(),
            avatar_url: text_at(&data, &["avatar"]).to_string(),
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
            "recipient": { "user_id": target.recipient_id },
            "message": outbound_message(content),
        });
        let response = self
            .http
            .client
            .post(format!("{}/v3.0/oa/message/cs", self.api_base))
            .header("access_token", token)
            .json(&payload)
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(self.http.request_error(PLATFORM))?;
        let body = self.http.read_json(PLATFORM, response).await?;
        check_error_code(&body)?;
        let message_id = text_at(&body, &["data", "message_id"]);
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
        let offset = request
            .cursor
            .as_deref()
            .and_then(|cursor| cursor.parse::<usize>().ok())
            .unwrap_or(0);
        let count = request.limit.clamp(1, 10);
        let body = self
            .get_json(
                channel,
                "/v2.0/oa/listrecentchat",
                json!({ "offset": offset, "count": count }),
            )
            .await?;
        let items = body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut events = Vec::with_capacity(items.len());
        for item in &items {
            // src 1: written by the user, 0: sent by the OA.
            let from_user = item.get("src").and_then(Value::as_i64) == Some(1);
            let (direction, customer_id) = if from_user {
                (EventDirection::Inbound, text_at(item, &["from_id"]))
            } else {
                (EventDirection::Echo, text_at(item, &["to_id"]))
            };
            let kind = text_at(item, &["type"]);
            let (content_type, text, attachments) = if kind.is_empty() || kind == "text" {
                (ContentType::Text, text_at(item, &["message"]).to_string(), Vec::new())
            } else {
                let url = text_at(item, &["url"]);
                let attachments = if url.is_empty() {
                    Vec::new()
                } else {
                    vec![Attachment {
                        kind: kind.to_string(),
                        url: url.to_string(),
                        name: None,
                    }]
                };
                (
                    ContentType::from_attachment_kind(kind),
                    text_at(item, &["message"]).to_string(),
                    attachments,
                )
            };
            let event = InboundEvent {
                platform: PLATFORM,
                channel_app_id: channel.external_app_id.clone(),
                external_sender_id: customer_id.to_string(),
                external_message_id: text_at(item, &["message_id"]).to_string(),
                external_thread_id: None,
                direction,
                content_type,
                text,
                attachments,
                timestamp: millis_at(item, "time").unwrap_or_else(Utc::now),
            };
            if event.validate().is_ok() {
                events.push(event);
            }
        }
        let next_cursor = (items.len() >= count).then(|| (offset + items.len()).to_string());
        Ok(HistoryPage {
            events,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{
        matchers::{body_partial_json, header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    fn adapter(base: &str) -> ZaloAdapter {
        ZaloAdapter::new(
            HttpSettings::new(reqwest::Client::new(), Duration::from_millis(500)),
            base,
            "",
        )
    }

    fn channel() -> Channel {
        Channel {
            id: 77,
            shop_id: 1,
            platform: Platform::Zalo,
            external_app_id: "oa-77".to_string(),
            name: "zalo".to_string(),
            access_token: "tok".to_string(),
            refresh_token: String::new(),
            config: json!({}),
            active: true,
            has_active_agent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_user_text_event() {
        let payload = json!({
            "app_id": "app-1",
            "event_name": "user_send_text",
            "timestamp": "1700000000000",
            "sender": { "id": "u1" },
            "recipient": { "id": "oa-77" },
            "message": { "msg_id": "m-1", "text": "xin chao" }
        });
        let events = adapter("http://unused").parse_webhook(&payload).unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.channel_app_id, "oa-77");
        assert_eq!(event.external_sender_id, "u1");
        assert_eq!(event.direction, EventDirection::Inbound);
        assert_eq!(event.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn oa_echo_swaps_sender_and_recipient() {
        let payload = json!({
            "event_name": "oa_send_image",
            "sender": { "id": "oa-77" },
            "recipient": { "id": "u1" },
            "message": {
                "msg_id": "m-2",
                "attachments": [{ "type": "image", "payload": { "url": "https://img/x.png" } }]
            }
        });
        let events = adapter("http://unused").parse_webhook(&payload).unwrap();
        assert_eq!(events[0].direction, EventDirection::Echo);
        assert_eq!(events[0].external_sender_id, "u1");
        assert_eq!(events[0].content_type, ContentType::Image);
    }

    #[test]
    fn ignores_non_message_events() {
        let payload = json!({ "event_name": "follow", "follower": { "id": "u1" } });
        assert!(adapter("http://unused").parse_webhook(&payload).unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_posts_cs_message_with_access_token_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3.0/oa/message/cs"))
            .and(header("access_token", "tok"))
            .and(body_partial_json(json!({ "recipient": { "user_id": "u1" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": 0,
                "data": { "message_id": "zmid-1" }
            })))
            .mount(&server)
            .await;

        let id = adapter(&server.uri())
            .send_message(
                &channel(),
                &OutboundTarget {
                    recipient_id: "u1".to_string(),
                    thread_id: None,
                },
                &OutboundContent {
                    content_type: ContentType::Text,
                    text: "hello".to_string(),
                    attachments: vec![],
                },
            )
            .await
            .unwrap();
        assert_eq!(id, "zmid-1");
    }

    #[tokio::test]
    async fn error_code_is_permanent_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3.0/oa/user/detail"))
            .and(query_param("data", r#"{"user_id":"u1"}"#))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "error": -213, "message": "user not follow" })),
            )
            .mount(&server)
            .await;

        let err = adapter(&server.uri())
            .fetch_profile(&channel(), "u1")
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Rejected { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let err = adapter(&server.uri())
            .send_message(
                &channel(),
                &OutboundTarget {
                    recipient_id: "u1".to_string(),
                    thread_id: None,
                },
                &OutboundContent {
                    content_type: ContentType::Text,
                    text: "hello".to_string(),
                    attachments: vec![],
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn history_pages_by_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.0/oa/listrecentchat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "error": 0,
                "data": [
                    { "src": 1, "time": 1700000000000_i64, "type": "text", "message": "hi",
                      "message_id": "h1", "from_id": "u1", "to_id": "oa-77" },
                    { "src": 0, "time": 1700000001000_i64, "type": "text", "message": "hello",
                      "message_id": "h2", "from_id": "oa-77", "to_id": "u1" }
                ]
            })))
            .mount(&server)
            .await;

        let page = adapter(&server.uri())
            .fetch_history(
                &channel(),
                &HistoryRequest {
                    job_type: "conversations".to_string(),
                    cursor: None,
                    limit: 2,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.events.len(), 2);
        assert_eq!(page.events[1].direction, EventDirection::Echo);
        assert_eq!(page.events[1].external_sender_id, "u1");
        assert_eq!(page.next_cursor.as_deref(), Some("2"));
    }
}
