//! Token verification. Tokens are issued elsewhere; this side only resolves
//! them to a `{userId, shopId}` principal.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::{error::AuthError, store::ChatStore, types::Principal};

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Looks tokens up in the store's `auth_tokens` table.
pub struct StoreAuthenticator {
    store: Arc<dyn ChatStore>,
}

impl StoreAuthenticator {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Authenticator for StoreAuthenticator {
    async fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        self.store
            .principal_for_token(token)
            .await?
            .ok_or(AuthError::InvalidToken)
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

pub async fn principal_from_headers(
    auth: &dyn Authenticator,
    headers: &HeaderMap,
) -> Result<Principal, AuthError> {
    let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
    auth.verify(&token).await
}
