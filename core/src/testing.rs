/// In-memory collaborators for unit tests
use crate::api::{MessageHistory, MessagingApi, SendMessageRequest};
use crate::error::{ChatError, Result};
use crate::messenger_types::{Conversation, DeliveryState, Message, PeerSummary};
use crate::transport::{ClientEvent, EventSink};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct MockApi {
    pub conversations: Mutex<Vec<Conversation>>,
    pub histories: Mutex<HashMap<String, Vec<Message>>>,
    pub fetch_delays: Mutex<HashMap<String, Duration>>,
    pub search_results: Mutex<Vec<PeerSummary>>,
    pub sent: Mutex<Vec<SendMessageRequest>>,
    pub seen_calls: Mutex<Vec<String>>,
    pub send_delay: Mutex<Duration>,
    pub list_delay: Mutex<Duration>,
    pub fail_sends: AtomicBool,
    pub fail_seen: AtomicBool,
    pub unauthorized: AtomicBool,
    conversation_ids: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
}

impl MockApi {
    pub fn peer(id: &str) -> PeerSummary {
        PeerSummary {
            id: id.to_string(),
            username: id.to_string(),
            display_name: id.to_uppercase(),
            avatar_url: None,
        }
    }

    /// Pin the conversation id the server will assign for `peer_id`
    pub fn with_conversation_id(self, peer_id: &str, conversation_id: &str) -> Self {
        self.conversation_ids
            .lock()
            .insert(peer_id.to_string(), conversation_id.to_string());
        self
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

pub fn message(id: &str, conversation_id: &str, sender: &str, text: &str) -> Message {
    Message {
        id: id.to_string(),
        conversation_id: Some(conversation_id.to_string()),
        sender: sender.to_string(),
        text: text.to_string(),
        image: None,
        created_at: Utc::now(),
        seen: false,
        delivery_state: DeliveryState::Confirmed,
    }
}

#[async_trait]
impl MessagingApi for MockApi {
    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let delay = *self.list_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ChatError::Unauthorized);
        }
        Ok(self.conversations.lock().clone())
    }

    async fn fetch_messages(&self, peer_id: &str) -> Result<MessageHistory> {
        let delay = self.fetch_delays.lock().get(peer_id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(match self.histories.lock().get(peer_id) {
            Some(messages) => MessageHistory::Messages(messages.clone()),
            None => MessageHistory::NotStarted,
        })
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message> {
        let delay = *self.send_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ChatError::Unauthorized);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(ChatError::Http("connection refused".to_string()));
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conversation_id = self
            .conversation_ids
            .lock()
            .entry(request.recipient_id.clone())
            .or_insert_with(|| format!("c-{}", request.recipient_id))
            .clone();
        self.sent.lock().push(request.clone());
        let mut confirmed = message(&format!("m{}", n), &conversation_id, "me", &request.message);
        confirmed.image = request.img.clone();
        Ok(confirmed)
    }

    async fn mark_seen(&self, conversation_id: &str) -> Result<()> {
        self.seen_calls.lock().push(conversation_id.to_string());
        if self.fail_seen.load(Ordering::SeqCst) {
            return Err(ChatError::Http("connection reset".to_string()));
        }
        Ok(())
    }

    async fn search_connected(&self, query: &str) -> Result<Vec<PeerSummary>> {
        let q = query.to_lowercase();
        Ok(self
            .search_results
            .lock()
            .iter()
            .filter(|p| p.username.to_lowercase().contains(&q))
            .cloned()
            .collect())
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub events: Mutex<Vec<ClientEvent>>,
    pub offline: AtomicBool,
}

impl RecordingSink {
    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(ClientEvent::event_name).collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: &ClientEvent) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(ChatError::Disconnected);
        }
        self.events.lock().push(event.clone());
        Ok(())
    }
}
