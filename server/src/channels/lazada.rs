//! Lazada seller IM adapter. Lazada addresses replies to a session rather than
//! a buyer, so the session id doubles as the conversation's thread id.

use std::collections::BTreeMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::Value;

use super::{
    adapter::{
        header_text, millis_at, require_token, text_at, ChannelAdapter, EventDirection,
        HttpSettings, InboundEvent, OutboundContent, OutboundTarget,
    },
    signature::{lazada_request_sign, verify_lazada_push},
};
use crate::{
    error::ChannelError,
    types::{Attachment, Channel, ContentType, CustomerProfile, Platform},
};

const PLATFORM: Platform = Platform::Lazada;
const SEND_PATH: &str = "/im/message/send";
/// `from_account_type` of messages written by the seller.
const SELLER_ACCOUNT: i64 = 2;
const TEMPLATE_TEXT: i64 = 1;
const TEMPLATE_IMAGE: i64 = 3;

pub struct LazadaAdapter {
    http: HttpSettings,
    api_base: String,
    app_key: String,
    app_secret: String,
}

impl LazadaAdapter {
    pub fn new(http: HttpSettings, api_base: &str, app_key: &str, app_secret: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            app_key: app_key.to_string(),
            app_secret: app_secret.to_string(),
        }
    }

    fn signed_params(
        &self,
        api_path: &str,
        mut params: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        params.insert("app_key".to_string(), self.app_key.clone());
        params.insert(
            "timestamp".to_string(),
            Utc::now().timestamp_millis().to_string(),
        );
        params.insert("sign_method".to_string(), "sha256".to_string());
        let sign = lazada_request_sign(&self.app_secret, api_path, &params);
        params.insert("sign".to_string(), sign);
        params
    }
}

/// Message bodies are JSON strings nested inside the push payload.
fn parse_content(template_id: i64, raw: &str) -> (ContentType, String, Vec<Attachment>) {
    let content = serde_json::from_str::<Value>(raw).unwrap_or(Value::Null);
    match template_id {
        TEMPLATE_IMAGE => {
            let url = text_at(&content, &["imgUrl"]);
            let attachments = if url.is_empty() {
                Vec::new()
            } else {
                vec![Attachment {
                    kind: "image".to_string(),
                    url: url.to_string(),
                    name: None,
                }]
            };
            (ContentType::Image, String::new(), attachments)
        }
        _ => {
            let text = text_at(&content, &["txt"]);
            let text = if text.is_empty() && content.is_null() {
                raw.trim()
            } else {
                text
            };
            (ContentType::Text, text.to_string(), Vec::new())
        }
    }
}

#[async_trait]
impl ChannelAdapter for LazadaAdapter {
    fn platform(&self) -> Platform {
        PLATFORM
    }

    fn verify_webhook(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), ChannelError> {
        if verify_lazada_push(
            &self.app_key,
            &self.app_secret,
            header_text(headers, "authorization"),
            body,
        ) {
            Ok(())
        } else {
            Err(ChannelError::InvalidSignature { platform: PLATFORM })
        }
    }

    fn parse_webhook(&self, payload: &Value) -> Result<Vec<InboundEvent>, ChannelError> {
        let Some(data) = payload.get("data") else {
            return Ok(Vec::new());
        };
        if text_at(data, &["message_id"]).is_empty() {
            return Ok(Vec::new());
        }
        let seller_id = match payload.get("seller_id") {
            Some(Value::Number(number)) => number.to_string(),
            Some(Value::String(text)) => text.trim().to_string(),
            _ => String::new(),
        };
        let from_seller = data.get("from_account_type").and_then(Value::as_i64) == Some(SELLER_ACCOUNT);
        let (direction, buyer_id) = if from_seller {
            (EventDirection::Echo, text_at(data, &["to_account_id"]))
        } else {
            (EventDirection::Inbound, text_at(data, &["from_account_id"]))
        };
        let template_id = data
            .get("template_id")
            .and_then(Value::as_i64)
            .unwrap_or(TEMPLATE_TEXT);
        let (content_type, text, attachments) =
            parse_content(template_id, text_at(data, &["content"]));
        let session_id = text_at(data, &["session_id"]);
        let event = InboundEvent {
            platform: PLATFORM,
            channel_app_id: seller_id,
            external_sender_id: buyer_id.to_string(),
            external_message_id: text_at(data, &["message_id"]).to_string(),
            external_thread_id: (!session_id.is_empty()).then(|| session_id.to_string()),
            direction,
            content_type,
            text,
            attachments,
            timestamp: millis_at(data, "send_time").unwrap_or_else(Utc::now),
        };
        event.validate()?;
        Ok(vec![event])
    }

    /// Lazada exposes no buyer profile lookup; names arrive with session lists only.
    async fn fetch_profile(
        &self,
        _channel: &Channel,
        _external_id: &str,
    ) -> Result<CustomerProfile, ChannelError> {
        Ok(CustomerProfile::default())
    }

    async fn send_message(
        &self,
        channel: &Channel,
        target: &OutboundTarget,
        content: &OutboundContent,
    ) -> Result<String, ChannelError> {
        let token = require_token(channel)?;
        let Some(session_id) = target.thread_id.as_deref().filter(|id| !id.is_empty()) else {
            return Err(ChannelError::invalid(PLATFORM, "reply requires a session id"));
        };
        let mut params = BTreeMap::new();
        params.insert("access_token".to_string(), token.to_string());
        params.insert("session_id".to_string(), session_id.to_string());
        match content.attachments.first() {
            Some(attachment) if content.content_type == ContentType::Image => {
                params.insert("template_id".to_string(), TEMPLATE_IMAGE.to_string());
                params.insert("img_url".to_string(), attachment.url.clone());
            }
            _ => {
                params.insert("template_id".to_string(), TEMPLATE_TEXT.to_string());
                params.insert("txt".to_string(), content.text.clone());
            }
        }
        let params = self.signed_params(SEND_PATH, params);
        let response = self
            .http
            .client
            .post(format!("{}{SEND_PATH}", self.api_base))
            .form(&params)
            .timeout(self.http.timeout)
            .send()
            .await
            .map_err(self.http.request_error(PLATFORM))?;
        let body = self.http.read_json(PLATFORM, response).await?;
        let code = match body.get("code") {
            Some(Value::String(code)) => code.clone(),
            Some(Value::Number(code)) => code.to_string(),
            _ => "0".to_string(),
        };
        if code != "0" {
            return Err(ChannelError::Rejected {
                platform: PLATFORM,
                message: format!("{code}: {}", text_at(&body, &["message"])),
            });
        }
        let message_id = text_at(&body, &["data", "message_id"]);
        if message_id.is_empty() {
            return Err(ChannelError::invalid(PLATFORM, "send response without message_id"));
        }
        Ok(message_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::{
        matchers::{body_string_contains, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    fn adapter(base: &str) -> LazadaAdapter {
        LazadaAdapter::new(
            HttpSettings::new(reqwest::Client::new(), Duration::from_millis(500)),
            base,
            "app-key",
            "app-secret",
        )
    }

    fn channel() -> Channel {
        Channel {
            id: 9,
            shop_id: 1,
            platform: Platform::Lazada,
            external_app_id: "100200".to_string(),
            name: "lazada".to_string(),
            access_token: "seller-token".to_string(),
            refresh_token: String::new(),
            config: json!({}),
            active: true,
            has_active_agent: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn parses_buyer_text_with_session_thread() {
        let payload = json!({
            "seller_id": 100200,
            "message_type": 2,
            "data": {
                "session_id": "sess-1",
                "message_id": "lz-1",
                "from_account_id": "buyer-9",
                "from_account_type": 1,
                "to_account_id": "100200",
                "template_id": 1,
                "content": "{\"txt\":\"is this in stock?\"}",
                "send_time": 1700000000000_i64
            }
        });
        let events = adapter("http://unused").parse_webhook(&payload).unwrap();
        let event = &events[0];
        assert_eq!(event.channel_app_id, "100200");
        assert_eq!(event.external_thread_id.as_deref(), Some("sess-1"));
        assert_eq!(event.text, "is this in stock?");
        assert_eq!(event.direction, EventDirection::Inbound);
    }

    #[test]
    fn seller_messages_are_echoes_and_images_become_attachments() {
        let payload = json!({
            "seller_id": "100200",
            "data": {
                "session_id": "sess-1",
                "message_id": "lz-2",
                "from_account_id": "100200",
                "from_account_type": 2,
                "to_account_id": "buyer-9",
                "template_id": 3,
                "content": "{\"imgUrl\":\"https://img/p.jpg\"}"
            }
        });
        let event = &adapter("http://unused").parse_webhook(&payload).unwrap()[0];
        assert_eq!(event.direction, EventDirection::Echo);
        assert_eq!(event.external_sender_id, "buyer-9");
        assert_eq!(event.content_type, ContentType::Image);
        assert_eq!(event.attachments[0].url, "https://img/p.jpg");
    }

    #[tokio::test]
    async fn send_signs_request_and_requires_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/im/message/send"))
            .and(body_string_contains("session_id=sess-1"))
            .and(body_string_contains("sign="))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": "0",
                "data": { "message_id": "lz-out-1" }
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server.uri());
        let content = OutboundContent {
            content_type: ContentType::Text,
            text: "yes".to_string(),
            attachments: vec![],
        };
        let id = adapter
            .send_message(
                &channel(),
                &OutboundTarget {
                    recipient_id: "buyer-9".to_string(),
                    thread_id: Some("sess-1".to_string()),
                },
                &content,
            )
            .await
            .unwrap();
        assert_eq!(id, "lz-out-1");

        let err = adapter
            .send_message(
                &channel(),
                &OutboundTarget {
                    recipient_id: "buyer-9".to_string(),
                    thread_id: None,
                },
                &content,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidPayload { .. }));
    }
}
