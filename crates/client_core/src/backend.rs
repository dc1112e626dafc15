//! Request/response collaborator: login, history and persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use shared::{
    domain::{Conversation, ConversationKind},
    error::{ApiException, ErrorDetail},
    protocol::{
        FriendSummary, HistoryResponse, LoginRequest, LoginResponse, MessagePayload,
        OutboundMessage, PendingRequest, PersistAck, RoomSummary, UserSummary,
    },
};
use tracing::debug;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn login(&self, username: &str) -> Result<UserSummary>;

    async fn fetch_history(
        &self,
        conversation: &Conversation,
        requesting_user: &str,
    ) -> Result<Vec<MessagePayload>>;

    /// Not idempotent; a repeated call stores the message twice.
    async fn persist_message(&self, message: &OutboundMessage) -> Result<PersistAck>;

    async fn list_friends(&self, username: &str) -> Result<Vec<FriendSummary>>;

    async fn list_pending_requests(&self, username: &str) -> Result<Vec<PendingRequest>>;

    async fn list_rooms(&self, username: &str) -> Result<Vec<RoomSummary>>;
}

pub struct HttpChatBackend {
    http: Client,
    base_url: String,
}

impl HttpChatBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        decode(response).await
    }
}

#[async_trait]
impl ChatBackend for HttpChatBackend {
    async fn login(&self, username: &str) -> Result<UserSummary> {
        let url = format!("{}/login/", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        let body: LoginResponse = decode(response).await?;
        Ok(body.user)
    }

    async fn fetch_history(
        &self,
        conversation: &Conversation,
        requesting_user: &str,
    ) -> Result<Vec<MessagePayload>> {
        let url = match conversation.kind {
            ConversationKind::Direct => {
                format!("{}/private-messages/{}", self.base_url, conversation.id)
            }
            ConversationKind::Group => {
                format!("{}/room-messages/{}", self.base_url, conversation.id)
            }
        };
        let mut request = self.http.get(&url);
        if conversation.is_direct() {
            request = request.query(&[("sender", requesting_user)]);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;
        let body: HistoryResponse = decode(response).await?;
        debug!(conversation = %conversation, count = body.messages.len(), "backend: history fetched");
        Ok(body.messages)
    }

    async fn persist_message(&self, message: &OutboundMessage) -> Result<PersistAck> {
        let (url, body) = match message {
            OutboundMessage::Private { .. } => (
                format!("{}/private-message/", self.base_url),
                serde_json::to_value(message).context("failed to encode private message")?,
            ),
            // The room endpoint names the author `username`.
            OutboundMessage::Room {
                sender,
                room,
                text,
                timestamp,
                correlation_id,
            } => (
                format!("{}/room-message/", self.base_url),
                json!({
                    "type": "room",
                    "username": sender,
                    "room": room,
                    "text": text,
                    "timestamp": timestamp,
                    "correlation_id": correlation_id,
                }),
            ),
        };
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url} failed"))?;
        decode(response).await
    }

    async fn list_friends(&self, username: &str) -> Result<Vec<FriendSummary>> {
        self.get_json(&format!("/friends/{username}")).await
    }

    // Not served by every backend; callers treat a failure as an empty list.
    async fn list_pending_requests(&self, username: &str) -> Result<Vec<PendingRequest>> {
        self.get_json(&format!("/friend-requests/{username}")).await
    }

    async fn list_rooms(&self, username: &str) -> Result<Vec<RoomSummary>> {
        self.get_json(&format!("/users/{username}/rooms")).await
    }
}

/// Maps non-success responses to [`ApiException`] using the `detail` body
/// when the backend sends one.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    let url = response.url().to_string();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorDetail>(&body)
            .map(|detail| detail.detail)
            .unwrap_or_else(|_| status.canonical_reason().unwrap_or("request failed").to_string());
        return Err(ApiException::from_status(status.as_u16(), detail))
            .with_context(|| format!("{url} returned {status}"));
    }
    response
        .json::<T>()
        .await
        .with_context(|| format!("failed to decode response from {url}"))
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
