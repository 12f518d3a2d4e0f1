use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, UserId, UserSummary},
    error::{ApiException, ErrorCode},
    protocol::{Conversation, CreateConversationRequest, Message, SendMessageRequest},
};
use tracing::warn;

use crate::auth::CredentialSource;

/// Request/response side of the conversation backend.
#[async_trait]
pub trait ConversationApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;
    async fn participants(&self, conversation_id: ConversationId) -> Result<Vec<UserSummary>>;
    async fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>>;
    async fn create_conversation(&self, participant_id: UserId) -> Result<Conversation>;
    /// Fallback delivery used while no live channel is open.
    async fn send_message(&self, conversation_id: ConversationId, content: &str)
        -> Result<Message>;
}

/// Users the current user may start a conversation with.
#[async_trait]
pub trait FriendDirectory: Send + Sync {
    async fn friends(&self) -> Result<Vec<UserSummary>>;
}

pub struct MissingFriendDirectory;

#[async_trait]
impl FriendDirectory for MissingFriendDirectory {
    async fn friends(&self) -> Result<Vec<UserSummary>> {
        Err(anyhow!("friend directory is unavailable"))
    }
}

pub(crate) async fn decode_response<T: DeserializeOwned>(response: Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let url = response.url().path().to_string();
    let body = response.text().await.unwrap_or_default();
    let err = ApiException::from_response(status.as_u16(), &body);
    warn!(path = %url, status = status.as_u16(), message = %err.message, "api request failed");
    Err(err.into())
}

pub struct HttpConversationApi {
    http: Client,
    api_url: String,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpConversationApi {
    pub fn new(
        http: Client,
        api_url: impl Into<String>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        Self {
            http,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_url)
    }

    fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let token = self
            .credentials
            .token()
            .ok_or_else(|| ApiException::new(ErrorCode::Unauthorized, "not logged in"))?;
        Ok(request.bearer_auth(token))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.authorized(self.http.get(self.url(path)))?.send().await?;
        decode_response(response).await
    }
}

#[async_trait]
impl ConversationApi for HttpConversationApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.get_json("/conversations/").await
    }

    async fn participants(&self, conversation_id: ConversationId) -> Result<Vec<UserSummary>> {
        self.get_json(&format!("/conversations/{}/participants", conversation_id.0))
            .await
    }

    async fn messages(&self, conversation_id: ConversationId) -> Result<Vec<Message>> {
        self.get_json(&format!("/conversations/{}/messages", conversation_id.0))
            .await
    }

    async fn create_conversation(&self, participant_id: UserId) -> Result<Conversation> {
        let response = self
            .authorized(self.http.post(self.url("/conversations/")))?
            .json(&CreateConversationRequest { participant_id })
            .send()
            .await?;
        decode_response(response).await
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> Result<Message> {
        let response = self
            .authorized(
                self.http
                    .post(self.url(&format!("/conversations/{}/messages", conversation_id.0))),
            )?
            .json(&SendMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        decode_response(response).await
    }
}

#[async_trait]
impl FriendDirectory for HttpConversationApi {
    async fn friends(&self) -> Result<Vec<UserSummary>> {
        let response = self
            .authorized(self.http.get(self.url("/friendships/")))?
            .query(&[("filter_type", "accepted")])
            .send()
            .await?;
        decode_response(response).await
    }
}
