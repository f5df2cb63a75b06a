use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::Platform;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid stored value in {column}: {message}")]
    Decode {
        column: &'static str,
        message: String,
    },

    #[error("constraint violated: {0}")]
    Constraint(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Lost connections and serialization failures clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Database(_))
    }
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{platform} request failed: {source}")]
    Transport {
        platform: Platform,
        #[source]
        source: reqwest::Error,
    },

    #[error("{platform} request timed out after {duration:?}")]
    Timeout {
        platform: Platform,
        duration: Duration,
    },

    #[error("{platform} responded with status {status}: {body}")]
    Upstream {
        platform: Platform,
        status: u16,
        body: String,
    },

    #[error("{platform} rejected the request: {message}")]
    Rejected { platform: Platform, message: String },

    #[error("invalid {platform} payload: {message}")]
    InvalidPayload { platform: Platform, message: String },

    #[error("invalid {platform} webhook signature")]
    InvalidSignature { platform: Platform },

    #[error("missing {platform} credentials: {field}")]
    MissingCredentials {
        platform: Platform,
        field: &'static str,
    },

    #[error("{platform} does not support {operation}")]
    Unsupported {
        platform: Platform,
        operation: &'static str,
    },

    #[error("no adapter registered for {0}")]
    UnknownPlatform(String),
}

impl ChannelError {
    pub fn invalid(platform: Platform, message: impl Into<String>) -> Self {
        ChannelError::InvalidPayload {
            platform,
            message: message.into(),
        }
    }

    /// Timeouts, connection failures, throttling and 5xx are worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            ChannelError::Transport { .. } | ChannelError::Timeout { .. } => true,
            ChannelError::Upstream { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("unknown channel {platform}:{app_id}")]
    UnknownChannel { platform: Platform, app_id: String },

    #[error("channel {0} is inactive")]
    InactiveChannel(i64),

    #[error("conversation {0} not found")]
    ConversationNotFound(i64),

    #[error("message {0} not found")]
    MessageNotFound(i64),

    #[error("participant is not an active member of conversation {0}")]
    NotMember(i64),

    #[error("{0}")]
    Invalid(String),
}

impl OrchestratorError {
    pub fn is_retryable(&self) -> bool {
        match self {
            OrchestratorError::Store(err) => err.is_transient(),
            OrchestratorError::Channel(err) => err.is_transient(),
            OrchestratorError::Queue(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue item {0} not found")]
    NotFound(i64),

    #[error("invalid queue payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("invalid stored queue value: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum HubError {
    #[error("user {0} already has an open socket")]
    AlreadyConnected(i64),

    #[error("socket {0} is not connected")]
    UnknownSocket(usize),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },

    #[error("{platform} is enabled but {key} is not set")]
    MissingCredential { platform: Platform, key: &'static str },
}

/// Error returned by the HTTP API as `{ "error": { "code", "message" } }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unavailable(String),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Auth(AuthError::Store(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE")
            }
            ApiError::Auth(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::Forbidden(_) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Unavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE"),
            ApiError::Orchestrator(err) => match err {
                OrchestratorError::ConversationNotFound(_)
                | OrchestratorError::MessageNotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                OrchestratorError::NotMember(_) => (StatusCode::FORBIDDEN, "NOT_MEMBER"),
                OrchestratorError::Invalid(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
                OrchestratorError::UnknownChannel { .. } | OrchestratorError::InactiveChannel(_) => {
                    (StatusCode::CONFLICT, "CHANNEL_UNAVAILABLE")
                }
                OrchestratorError::Channel(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
                OrchestratorError::Store(StoreError::NotFound { .. }) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND")
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
            },
            ApiError::Store(StoreError::NotFound { .. }) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Store(_) | ApiError::Queue(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code, "request failed");
        }
        (
            status,
            Json(json!({ "error": { "code": code, "message": self.to_string() } })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_throttling_and_5xx_are_transient() {
        let throttled = ChannelError::Upstream {
            platform: Platform::Zalo,
            status: 429,
            body: String::new(),
        };
        let bad_request = ChannelError::Upstream {
            platform: Platform::Zalo,
            status: 400,
            body: String::new(),
        };
        assert!(throttled.is_transient());
        assert!(!bad_request.is_transient());
        assert!(OrchestratorError::from(throttled).is_retryable());
        assert!(!OrchestratorError::NotMember(1).is_retryable());
    }

    #[test]
    fn api_error_maps_membership_to_forbidden() {
        let response = ApiError::from(OrchestratorError::NotMember(5)).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let response = ApiError::Auth(AuthError::MissingToken).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
