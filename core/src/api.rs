/// REST client for the messaging backend
///
/// Endpoints:
///   GET  /messages/conversations
///   GET  /messages/:peer_id              404 = conversation not started yet
///   POST /messages                       body: {"recipientId":"..","message":"..","img":".."}
///   POST /messages/:conversation_id/seen
///   GET  /users/search/connected?q=..    only users already connected to the caller
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::messenger_types::{Conversation, Message, PeerSummary};
use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Result of fetching a peer's message history
#[derive(Debug, Clone, PartialEq)]
pub enum MessageHistory {
    /// No conversation with this peer exists on the server yet
    NotStarted,
    Messages(Vec<Message>),
}

impl MessageHistory {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            MessageHistory::NotStarted => Vec::new(),
            MessageHistory::Messages(messages) => messages,
        }
    }
}

/// Body of `POST /messages`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub recipient_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img: Option<String>,
}

/// The REST surface the messaging components depend on
#[async_trait]
pub trait MessagingApi: Send + Sync {
    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    async fn fetch_messages(&self, peer_id: &str) -> Result<MessageHistory>;

    /// Persist a message; the reply carries the server id and conversation id
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message>;

    async fn mark_seen(&self, conversation_id: &str) -> Result<()>;

    async fn search_connected(&self, query: &str) -> Result<Vec<PeerSummary>>;
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default, alias = "message")]
    error: Option<String>,
}

/// `MessagingApi` over HTTP with a bearer credential
#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    config: Config,
    identity: Option<Identity>,
}

impl HttpApi {
    pub fn new(config: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChatError::Config(format!("HTTP client: {}", e)))?;
        let identity = config.identity.clone();
        Ok(Self {
            client,
            config,
            identity,
        })
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.identity.as_ref().and_then(Identity::bearer) {
            Some(bearer) => builder.header(reqwest::header::AUTHORIZATION, bearer),
            None => builder,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.get(self.config.endpoint(path)))
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.authorized(self.client.post(self.config.endpoint(path)))
    }
}

/// Map non-success statuses onto the error taxonomy
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ChatError::Unauthorized);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or(text);
    warn!("Messaging API returned {}: {}", status, message);
    Err(ChatError::Server {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl MessagingApi for HttpApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let response = self.get("/messages/conversations").send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn fetch_messages(&self, peer_id: &str) -> Result<MessageHistory> {
        let path = format!("/messages/{}", urlencoding::encode(peer_id));
        let response = self.get(&path).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("No conversation with {} yet", peer_id);
            return Ok(MessageHistory::NotStarted);
        }
        let messages: Vec<Message> = check(response).await?.json().await?;
        Ok(MessageHistory::Messages(messages))
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message> {
        let response = self.post("/messages").json(request).send().await?;
        let message: Message = check(response).await?.json().await?;
        if message.conversation_id.is_none() {
            return Err(ChatError::Server {
                status: 200,
                message: "created message has no conversation id".to_string(),
            });
        }
        Ok(message)
    }

    async fn mark_seen(&self, conversation_id: &str) -> Result<()> {
        let path = format!("/messages/{}/seen", urlencoding::encode(conversation_id));
        let response = self.post(&path).send().await?;
        check(response).await?;
        Ok(())
    }

    async fn search_connected(&self, query: &str) -> Result<Vec<PeerSummary>> {
        let path = format!("/users/search/connected?q={}", urlencoding::encode(query));
        let response = self.get(&path).send().await?;
        Ok(check(response).await?.json().await?)
    }
}
