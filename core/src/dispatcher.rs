/// Message dispatcher: optimistic send, server persistence, reconciliation
/// of the temporary id with the server id, and relay to the peer.
use crate::api::{MessagingApi, SendMessageRequest};
use crate::error::{ChatError, Result};
use crate::messenger_types::{ConversationPatch, DeliveryState, Message};
use crate::store::{AppendOutcome, ConversationStore};
use crate::transport::{ClientEvent, EventSink};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Prefix of client-generated ids. Server ids never carry it.
pub const TEMP_ID_PREFIX: &str = "temp-";

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// What the user typed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Draft {
    pub text: String,
    pub image: Option<String>,
}

impl Draft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
        }
    }
}

/// How a send ended
#[derive(Debug)]
pub enum SendOutcome {
    Confirmed(Message),
    /// The optimistic message was removed; `text` is the original draft text
    Failed {
        temp_id: String,
        text: String,
        error: ChatError,
    },
}

/// Handle for one in-flight send
#[derive(Debug)]
pub struct SendTicket {
    pub temp_id: String,
    text: String,
    outcome: oneshot::Receiver<SendOutcome>,
}

impl SendTicket {
    /// Wait for the server round-trip
    pub async fn outcome(self) -> SendOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(_) => SendOutcome::Failed {
                temp_id: self.temp_id,
                text: self.text,
                error: ChatError::Transport("send task dropped".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone)]
struct PendingSend {
    peer_id: String,
    text: String,
    image: Option<String>,
    /// Filled in once the server id is known
    server_id: Option<String>,
}

/// Temporary id → server id map for sends still in their pending window
#[derive(Clone, Default)]
pub struct PendingSends {
    inner: Arc<Mutex<HashMap<String, PendingSend>>>,
}

impl PendingSends {
    fn register(&self, temp_id: &str, pending: PendingSend) {
        self.inner.lock().insert(temp_id.to_string(), pending);
    }

    fn finish(&self, temp_id: &str) -> Option<PendingSend> {
        self.inner.lock().remove(temp_id)
    }

    /// Record the server id for `temp_id`. Returns `false` if the id was
    /// already resolved, to something else or not at all pending.
    fn resolve(&self, temp_id: &str, server_id: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(temp_id) {
            Some(pending) => match &pending.server_id {
                Some(existing) => existing == server_id,
                None => {
                    pending.server_id = Some(server_id.to_string());
                    true
                }
            },
            None => false,
        }
    }

    /// Find the unresolved send a server echo of our own message belongs to.
    /// Sends are matched oldest first by recipient and content.
    fn match_echo(&self, message: &Message, peer_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        let mut candidates: Vec<&String> = inner
            .iter()
            .filter(|(_, p)| {
                p.server_id.is_none()
                    && p.peer_id == peer_id
                    && p.text == message.text
                    && p.image == message.image
            })
            .map(|(temp_id, _)| temp_id)
            .collect();
        candidates.sort();
        candidates.first().map(|id| id.to_string())
    }

    /// Server id already assigned to `temp_id`
    pub fn server_id(&self, temp_id: &str) -> Option<String> {
        self.inner.lock().get(temp_id).and_then(|p| p.server_id.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns drafts into messages. Cheap to clone.
#[derive(Clone)]
pub struct MessageDispatcher {
    store: ConversationStore,
    api: Arc<dyn MessagingApi>,
    sink: Arc<dyn EventSink>,
    pending: PendingSends,
    seq: Arc<AtomicU64>,
}

impl MessageDispatcher {
    pub fn new(
        store: ConversationStore,
        api: Arc<dyn MessagingApi>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            api,
            sink,
            pending: PendingSends::default(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn pending(&self) -> &PendingSends {
        &self.pending
    }

    fn next_temp_id(&self) -> String {
        let n = self.seq.fetch_add(1, Ordering::Relaxed);
        // Zero-padded so lexical order follows send order
        format!(
            "{}{:016}-{:08}",
            TEMP_ID_PREFIX,
            Utc::now().timestamp_millis(),
            n
        )
    }

    /// Send `draft` to the open conversation. The optimistic message is in
    /// the store when this returns; persistence continues in the background.
    pub fn send(&self, draft: Draft) -> Result<SendTicket> {
        let text = draft.text.trim().to_string();
        if text.is_empty() && draft.image.is_none() {
            return Err(ChatError::EmptyMessage);
        }
        let (peer_id, conversation_id) = self.store.active_key().ok_or(ChatError::NoRecipient)?;

        let temp_id = self.next_temp_id();
        let optimistic = Message::optimistic(
            temp_id.clone(),
            conversation_id.clone(),
            self.store.user_id().to_string(),
            text.clone(),
            draft.image.clone(),
        );
        self.pending.register(
            &temp_id,
            PendingSend {
                peer_id: peer_id.clone(),
                text: text.clone(),
                image: draft.image.clone(),
                server_id: None,
            },
        );
        self.store.append_message(optimistic);
        debug!("Optimistic message {} to {}", temp_id, peer_id);

        let request = SendMessageRequest {
            recipient_id: peer_id.clone(),
            message: text,
            img: draft.image,
        };
        let (tx, rx) = oneshot::channel();
        let dispatcher = self.clone();
        let task_temp_id = temp_id.clone();
        let original = draft.text.clone();
        tokio::spawn(async move {
            let outcome = dispatcher
                .deliver(task_temp_id, peer_id, conversation_id.is_none(), original, request)
                .await;
            // The caller may have dropped the ticket
            let _ = tx.send(outcome);
        });

        Ok(SendTicket {
            temp_id,
            text: draft.text,
            outcome: rx,
        })
    }

    async fn deliver(
        &self,
        temp_id: String,
        peer_id: String,
        provisional: bool,
        original_text: String,
        request: SendMessageRequest,
    ) -> SendOutcome {
        match self.api.send_message(&request).await {
            Ok(mut confirmed) => {
                confirmed.delivery_state = DeliveryState::Confirmed;
                self.confirm(&temp_id, &peer_id, confirmed.clone());
                self.pending.finish(&temp_id);

                if provisional {
                    if let Some(conversation_id) = confirmed.conversation_id.clone() {
                        info!("Conversation with {} created as {}", peer_id, conversation_id);
                        self.store.upsert_conversation(ConversationPatch {
                            id: Some(conversation_id),
                            participant_ids: vec![self.store.user_id().to_string(), peer_id.clone()],
                            ..Default::default()
                        });
                    }
                }

                self.relay(&confirmed, &peer_id);
                SendOutcome::Confirmed(confirmed)
            }
            Err(error) => {
                warn!("Send {} to {} failed: {}", temp_id, peer_id, error);
                self.pending.finish(&temp_id);
                self.store.rollback_message(&temp_id, &original_text);
                SendOutcome::Failed {
                    temp_id,
                    text: original_text,
                    error,
                }
            }
        }
    }

    /// Replace the optimistic entry with the confirmed one. This is the only
    /// place a message id is rewritten.
    fn confirm(&self, temp_id: &str, peer_id: &str, confirmed: Message) -> bool {
        if self.pending.resolve(temp_id, &confirmed.id) {
            return self.store.reconcile_message(temp_id, peer_id, confirmed);
        }
        // An echo of an identical draft claimed this send under another id,
        // so the optimistic entry is gone and this one is listed on its own
        debug!(
            "Send {} already resolved to another id, inserting {}",
            temp_id, confirmed.id
        );
        self.store.insert_if_absent(confirmed) != AppendOutcome::NotActive
    }

    /// Claim a server echo of one of our own pending sends. Returns `true`
    /// if the message was reconciled against an optimistic entry.
    pub fn reconcile_echo(&self, message: &Message) -> bool {
        if message.sender != self.store.user_id() {
            return false;
        }
        let peer_id = match message
            .conversation_id
            .as_deref()
            .and_then(|id| self.store.find_by_id(id))
            .and_then(|c| c.peer_id(self.store.user_id()).map(str::to_string))
            .or_else(|| self.store.active_peer_id())
        {
            Some(peer_id) => peer_id,
            None => return false,
        };
        match self.pending.match_echo(message, &peer_id) {
            Some(temp_id) => {
                debug!("Echo {} claimed by pending send {}", message.id, temp_id);
                let mut confirmed = message.clone();
                confirmed.delivery_state = DeliveryState::Confirmed;
                self.confirm(&temp_id, &peer_id, confirmed);
                true
            }
            None => false,
        }
    }

    /// Push the confirmed message to the peer. While the transport is down
    /// the peer picks it up from REST on their next fetch.
    fn relay(&self, confirmed: &Message, peer_id: &str) {
        let Some(conversation_id) = confirmed.conversation_id.clone() else {
            return;
        };
        let event = ClientEvent::SendMessage {
            message: confirmed.clone(),
            recipient_id: peer_id.to_string(),
            conversation_id,
        };
        match self.sink.emit(&event) {
            Ok(()) => debug!("Relayed {} to {}", confirmed.id, peer_id),
            Err(ChatError::Disconnected) => {
                debug!("Transport offline, {} delivered via REST only", confirmed.id)
            }
            Err(e) => warn!("Relay of {} failed: {}", confirmed.id, e),
        }
    }
}
