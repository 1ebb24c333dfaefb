/// Shared types for the messaging layer: conversations, messages, peers, store events
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a message is in its send lifecycle. Messages fetched from the server
/// or delivered over the transport are always `Confirmed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Optimistic,
    #[default]
    Confirmed,
    Failed,
}

/// One chat message. Wire format follows the backend (`_id`, `img`, camelCase).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    /// Absent only on optimistic messages sent into a provisional conversation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "img", alias = "image", skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub seen: bool,
    #[serde(default, skip_serializing)]
    pub delivery_state: DeliveryState,
}

impl Message {
    /// Local placeholder shown until the server confirms the send
    pub fn optimistic(
        temp_id: String,
        conversation_id: Option<String>,
        sender: String,
        text: String,
        image: Option<String>,
    ) -> Self {
        Self {
            id: temp_id,
            conversation_id,
            sender,
            text,
            image,
            created_at: Utc::now(),
            seen: false,
            delivery_state: DeliveryState::Optimistic,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.delivery_state == DeliveryState::Optimistic
    }

    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            text: self.text.clone(),
            sender: self.sender.clone(),
            seen: self.seen,
        }
    }
}

/// Preview of the newest message, kept on each conversation in the list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSummary {
    #[serde(default)]
    pub text: String,
    pub sender: String,
    #[serde(default)]
    pub seen: bool,
}

/// Read-only projection of another user, replaced wholesale when refetched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, alias = "name")]
    pub display_name: String,
    #[serde(default, alias = "profilePic", skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// A one-to-one conversation. `id` is `None` while the conversation is
/// provisional, i.e. no message has been persisted to it yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default, rename = "_id", alias = "id")]
    pub id: Option<String>,
    #[serde(alias = "participants")]
    pub participant_ids: Vec<String>,
    #[serde(default)]
    pub participant_details: Vec<PeerSummary>,
    #[serde(default)]
    pub last_message: Option<MessageSummary>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Client-only conversation with `peer`, shown before the first send
    pub fn provisional(me: &str, peer: PeerSummary) -> Self {
        Self {
            id: None,
            participant_ids: vec![me.to_string(), peer.id.clone()],
            participant_details: vec![peer],
            last_message: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_provisional(&self) -> bool {
        self.id.is_none()
    }

    /// The participant that is not `me`
    pub fn peer_id(&self, me: &str) -> Option<&str> {
        self.participant_ids
            .iter()
            .map(String::as_str)
            .find(|id| *id != me)
    }

    pub fn peer_details(&self, me: &str) -> Option<&PeerSummary> {
        let peer = self.peer_id(me)?;
        self.participant_details.iter().find(|p| p.id == peer)
    }

    /// True when this conversation is between exactly `a` and `b`, in either order
    pub fn is_between(&self, a: &str, b: &str) -> bool {
        participant_pair(&self.participant_ids) == participant_pair(&[a.to_string(), b.to_string()])
    }
}

/// Order-independent key for a participant list
pub fn participant_pair(ids: &[String]) -> Vec<String> {
    let mut pair: Vec<String> = ids.to_vec();
    pair.sort();
    pair.dedup();
    pair
}

/// Partial conversation merged by `ConversationStore::upsert_conversation`.
/// `None` fields leave the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPatch {
    pub id: Option<String>,
    pub participant_ids: Vec<String>,
    pub participant_details: Option<Vec<PeerSummary>>,
    pub last_message: Option<MessageSummary>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<Conversation> for ConversationPatch {
    fn from(c: Conversation) -> Self {
        Self {
            id: c.id,
            participant_ids: c.participant_ids,
            participant_details: Some(c.participant_details),
            last_message: c.last_message,
            updated_at: Some(c.updated_at),
        }
    }
}

/// Store change notifications, fanned out to every subscriber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// The conversation list was replaced or an entry merged
    ConversationsChanged,
    /// A different conversation became active
    ConversationSelected {
        peer_id: String,
        conversation_id: Option<String>,
    },
    /// The active message list changed
    MessagesChanged { peer_id: String },
    /// Messages in a conversation were marked seen
    MessagesSeen { conversation_id: String },
    /// An optimistic send was rolled back; `text` goes back to the composer
    SendFailed { temp_id: String, text: String },
}
