use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ChannelError,
    types::{Attachment, Channel, ContentType, CustomerProfile, Platform},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventDirection {
    /// Written by the customer.
    #[default]
    Inbound,
    /// The platform reporting a message the channel account itself sent.
    Echo,
}

/// Platform-neutral form of one webhook message. This is what travels through
/// the durable queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    pub platform: Platform,
    pub channel_app_id: String,
    /// The customer's id on the platform, whichever side of the message they are on.
    pub external_sender_id: String,
    pub external_message_id: String,
    #[serde(default)]
    pub external_thread_id: Option<String>,
    #[serde(default)]
    pub direction: EventDirection,
    #[serde(default)]
    pub content_type: ContentType,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub timestamp: DateTime<Utc>,
}

impl InboundEvent {
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.channel_app_id.trim().is_empty() {
            return Err(ChannelError::invalid(self.platform, "missing channel app id"));
        }
        if self.external_sender_id.trim().is_empty() {
            return Err(ChannelError::invalid(self.platform, "missing sender id"));
        }
        if self.external_message_id.trim().is_empty() {
            return Err(ChannelError::invalid(self.platform, "missing message id"));
        }
        if self.text.trim().is_empty() && self.attachments.is_empty() {
            return Err(ChannelError::invalid(self.platform, "message has no content"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundContent {
    pub content_type: ContentType,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// Where a reply goes: the customer's platform id, plus the platform thread
/// for platforms that address sessions instead of users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundTarget {
    pub recipient_id: String,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub job_type: String,
    pub cursor: Option<String>,
    pub limit: usize,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryPage {
    pub events: Vec<InboundEvent>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Checks the platform's webhook signature against the raw body.
    fn verify_webhook(&self, _headers: &HeaderMap, _body: &[u8]) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Answers a subscription handshake (`GET` on the webhook URL), if the
    /// platform has one.
    fn verify_subscription(&self, _query: &HashMap<String, String>) -> Option<String> {
        None
    }

    /// Messages carried by one webhook body. Non-message events (delivery,
    /// read, follow) yield nothing.
    fn parse_webhook(&self, payload: &Value) -> Result<Vec<InboundEvent>, ChannelError>;

    async fn fetch_profile(
        &self,
        channel: &Channel,
        external_id: &str,
    ) -> Result<CustomerProfile, ChannelError>;

    /// Returns the platform-assigned message id.
    async fn send_message(
        &self,
        channel: &Channel,
        target: &OutboundTarget,
        content: &OutboundContent,
    ) -> Result<String, ChannelError>;

    async fn fetch_history(
        &self,
        _channel: &Channel,
        _request: &HistoryRequest,
    ) -> Result<HistoryPage, ChannelError> {
        Err(ChannelError::Unsupported {
            platform: self.platform(),
            operation: "history sync",
        })
    }
}

/// Shared HTTP settings handed to every adapter.
#[derive(Clone)]
pub struct HttpSettings {
    pub client: reqwest::Client,
    pub timeout: Duration,
}

impl HttpSettings {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn request_error(&self, platform: Platform) -> impl Fn(reqwest::Error) -> ChannelError {
        let duration = self.timeout;
        move |source| {
            if source.is_timeout() {
                ChannelError::Timeout { platform, duration }
            } else {
                ChannelError::Transport { platform, source }
            }
        }
    }

    /// Reads a JSON body, turning non-2xx statuses into `Upstream` errors.
    pub async fn read_json(
        &self,
        platform: Platform,
        response: reqwest::Response,
    ) -> Result<Value, ChannelError> {
        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(self.request_error(platform))?;
        if !status.is_success() {
            return Err(ChannelError::Upstream {
                platform,
                status: status.as_u16(),
                body: raw_body,
            });
        }
        serde_json::from_str::<Value>(&raw_body)
            .map_err(|err| ChannelError::invalid(platform, format!("response is not json: {err}")))
    }
}

pub(crate) fn text_at<'a>(value: &'a Value, path: &[&str]) -> &'a str {
    let mut current = value;
    for key in path {
        match current.get(*key) {
            Some(next) => current = next,
            None => return "",
        }
    }
    current.as_str().map(str::trim).unwrap_or("")
}

/// Platform timestamps arrive as epoch millis, either as numbers or strings.
pub(crate) fn millis_at(value: &Value, key: &str) -> Option<DateTime<Utc>> {
    let raw = value.get(key)?;
    let millis = raw
        .as_i64()
        .or_else(|| raw.as_str().and_then(|text| text.trim().parse::<i64>().ok()))?;
    Utc.timestamp_millis_opt(millis).single()
}

pub(crate) fn require_token(channel: &Channel) -> Result<&str, ChannelError> {
    let token = channel.access_token.trim();
    if token.is_empty() {
        return Err(ChannelError::MissingCredentials {
            platform: channel.platform,
            field: "access_token",
        });
    }
    Ok(token)
}

pub(crate) fn header_text<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}
