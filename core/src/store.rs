/// Conversation store: the client-side cache of the conversation list and the
/// open conversation's messages. Every mutation of conversations or messages
/// goes through here; other components only hand values in.
use crate::api::MessagingApi;
use crate::error::{ChatError, Result};
use crate::messenger_types::{
    participant_pair, Conversation, ConversationPatch, DeliveryState, Message, PeerSummary,
    StoreEvent,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// What to open
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationTarget {
    /// A conversation already in the list, by server id
    Existing(String),
    /// A peer; resolves to their conversation or a provisional one
    Peer(PeerSummary),
}

/// Ticket returned by `select_conversation`; history fetched for it is only
/// applied while the same selection is still active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub peer_id: String,
    pub conversation_id: Option<String>,
    pub epoch: u64,
    pub needs_history: bool,
}

/// The open conversation and its message list
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveConversation {
    pub peer_id: String,
    pub conversation_id: Option<String>,
    pub messages: Vec<Message>,
    pub loaded: bool,
    epoch: u64,
}

impl ActiveConversation {
    fn owns(&self, me: &str, message: &Message) -> bool {
        match (&self.conversation_id, &message.conversation_id) {
            (Some(active), Some(incoming)) => active == incoming,
            _ => {
                message.sender == self.peer_id
                    || (message.sender == me && message.conversation_id.is_none())
            }
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }
}

/// Result of putting a message into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    Replaced,
    /// Already present; nothing changed
    Duplicate,
    /// Not for the open conversation; only its list summary was updated
    NotActive,
}

/// Seen flags flipped by one marking pass, so a failed receipt can be undone
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenMarks {
    pub conversation_id: String,
    pub message_ids: Vec<String>,
    /// The list summary's newest message was flipped too
    pub summary: bool,
}

impl SeenMarks {
    pub fn len(&self) -> usize {
        self.message_ids.len() + usize::from(self.summary)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Default)]
struct StoreState {
    conversations: Vec<Conversation>,
    active: Option<ActiveConversation>,
    epoch: u64,
    /// Conversation list fetches started and the newest one applied
    list_requested: u64,
    list_applied: u64,
}

impl StoreState {
    fn index_by_id(&self, id: &str) -> Option<usize> {
        self.conversations
            .iter()
            .position(|c| c.id.as_deref() == Some(id))
    }

    fn index_by_pair(&self, participants: &[String]) -> Option<usize> {
        let pair = participant_pair(participants);
        self.conversations
            .iter()
            .position(|c| participant_pair(&c.participant_ids) == pair)
    }

    /// Merge a patch. Matches by id, then by participant pair, so a
    /// provisional entry is upgraded in place rather than duplicated.
    fn upsert(&mut self, me: &str, patch: ConversationPatch) -> Option<Conversation> {
        let index = patch
            .id
            .as_deref()
            .and_then(|id| self.index_by_id(id))
            .or_else(|| {
                if patch.participant_ids.is_empty() {
                    None
                } else {
                    self.index_by_pair(&patch.participant_ids)
                }
            });

        let merged = match index {
            Some(i) => {
                let existing = &mut self.conversations[i];
                if let Some(id) = patch.id {
                    if existing.id.as_deref().is_some_and(|old| old != id) {
                        warn!(
                            "Conversation id for {:?} changed from {:?} to {}",
                            existing.participant_ids, existing.id, id
                        );
                    }
                    existing.id = Some(id);
                }
                if !patch.participant_ids.is_empty() {
                    existing.participant_ids = patch.participant_ids;
                }
                if let Some(details) = patch.participant_details {
                    if !details.is_empty() {
                        existing.participant_details = details;
                    }
                }
                if let Some(last) = patch.last_message {
                    existing.last_message = Some(last);
                }
                if let Some(at) = patch.updated_at {
                    existing.updated_at = at;
                }
                existing.clone()
            }
            None => {
                if patch.participant_ids.is_empty() {
                    warn!("Dropping conversation update without participants: {:?}", patch.id);
                    return None;
                }
                let conversation = Conversation {
                    id: patch.id,
                    participant_ids: patch.participant_ids,
                    participant_details: patch.participant_details.unwrap_or_default(),
                    last_message: patch.last_message,
                    updated_at: patch.updated_at.unwrap_or_else(Utc::now),
                };
                self.conversations.push(conversation.clone());
                conversation
            }
        };

        // Keep the open conversation pointing at the durable id
        if let (Some(active), Some(id)) = (self.active.as_mut(), merged.id.as_ref()) {
            if active.conversation_id.is_none() && merged.is_between(me, &active.peer_id) {
                active.conversation_id = Some(id.clone());
            }
        }
        Some(merged)
    }

    /// Merge the server's list. Entries it does not mention are kept: a
    /// provisional one unless the server now has its participant pair, a real
    /// one because the response may predate its creation.
    fn replace_list(&mut self, me: &str, conversations: Vec<Conversation>) {
        let previous = std::mem::take(&mut self.conversations);
        for conversation in conversations {
            self.upsert(me, conversation.into());
        }
        for local in previous {
            let listed = local.id.as_deref().is_some_and(|id| self.index_by_id(id).is_some())
                || self.index_by_pair(&local.participant_ids).is_some();
            if listed {
                continue;
            }
            if !local.is_provisional() {
                debug!("Keeping conversation {:?} missing from the server list", local.id);
            }
            self.conversations.push(local);
        }
    }

    /// Record `message` as the newest in its conversation with `peer_id`
    fn note_last_message(&mut self, me: &str, peer_id: &str, message: &Message) {
        let patch = ConversationPatch {
            id: message.conversation_id.clone(),
            participant_ids: vec![me.to_string(), peer_id.to_string()],
            participant_details: None,
            last_message: Some(message.summary()),
            updated_at: Some(message.created_at),
        };
        self.upsert(me, patch);
    }
}

/// Shared handle to the store. Cheap to clone.
#[derive(Clone)]
pub struct ConversationStore {
    user_id: Arc<str>,
    state: Arc<RwLock<StoreState>>,
    events: broadcast::Sender<StoreEvent>,
}

impl ConversationStore {
    pub fn new(user_id: &str, event_buffer: usize) -> Self {
        let (events, _rx) = broadcast::channel(event_buffer.max(1));
        Self {
            user_id: Arc::from(user_id),
            state: Arc::new(RwLock::new(StoreState::default())),
            events,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn notify(&self, events: Vec<StoreEvent>) {
        for event in events {
            let _ = self.events.send(event);
        }
    }

    // ─── Conversation list ──────────────────────────────────────────────────

    /// Conversations, newest activity first
    pub fn list_conversations(&self) -> Vec<Conversation> {
        let mut list = self.state.read().conversations.clone();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list
    }

    pub fn find_by_peer(&self, peer_id: &str) -> Option<Conversation> {
        let state = self.state.read();
        state
            .conversations
            .iter()
            .find(|c| c.is_between(&self.user_id, peer_id))
            .cloned()
    }

    pub fn find_by_id(&self, conversation_id: &str) -> Option<Conversation> {
        let state = self.state.read();
        state
            .index_by_id(conversation_id)
            .map(|i| state.conversations[i].clone())
    }

    /// Merge the server's list into ours. Local entries the server does not
    /// list yet are kept.
    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        self.state.write().replace_list(&self.user_id, conversations);
        self.notify(vec![StoreEvent::ConversationsChanged]);
    }

    /// Merge `patch` into the matching conversation or insert it. Never
    /// produces two entries for the same participant pair.
    pub fn upsert_conversation(&self, patch: ConversationPatch) -> Option<Conversation> {
        let merged = self.state.write().upsert(&self.user_id, patch);
        if merged.is_some() {
            self.notify(vec![StoreEvent::ConversationsChanged]);
        }
        merged
    }

    /// Fetch and merge the list. A response older than one already applied
    /// is dropped.
    pub async fn load_conversations(&self, api: &dyn MessagingApi) -> Result<usize> {
        let ticket = {
            let mut state = self.state.write();
            state.list_requested += 1;
            state.list_requested
        };
        let conversations = api.list_conversations().await?;
        let count = conversations.len();
        if !self.apply_conversations(ticket, conversations) {
            debug!("Discarding conversation list from fetch {}", ticket);
            return Ok(count);
        }
        info!("Loaded {} conversations", count);
        Ok(count)
    }

    /// Merge the list returned by fetch number `ticket` unless a later
    /// fetch was applied first
    fn apply_conversations(&self, ticket: u64, conversations: Vec<Conversation>) -> bool {
        {
            let mut state = self.state.write();
            if ticket < state.list_applied {
                return false;
            }
            state.list_applied = ticket;
            state.replace_list(&self.user_id, conversations);
        }
        self.notify(vec![StoreEvent::ConversationsChanged]);
        true
    }

    // ─── Selection ──────────────────────────────────────────────────────────

    /// Make a conversation active. Selecting a peer without a conversation
    /// stages a provisional one. The returned selection says whether history
    /// still has to be fetched.
    pub fn select_conversation(&self, target: ConversationTarget) -> Result<Selection> {
        let me = self.user_id.clone();
        let mut events = Vec::new();

        let selection = {
            let mut state = self.state.write();

            let conversation = match target {
                ConversationTarget::Existing(id) => {
                    let i = state
                        .index_by_id(&id)
                        .ok_or(ChatError::UnknownConversation(id))?;
                    state.conversations[i].clone()
                }
                ConversationTarget::Peer(peer) => {
                    if peer.id == *me {
                        return Err(ChatError::NoRecipient);
                    }
                    let pair = vec![me.to_string(), peer.id.clone()];
                    match state.index_by_pair(&pair) {
                        Some(i) => state.conversations[i].clone(),
                        None => {
                            debug!("Staging provisional conversation with {}", peer.id);
                            let provisional = Conversation::provisional(&me, peer);
                            state.conversations.push(provisional.clone());
                            events.push(StoreEvent::ConversationsChanged);
                            provisional
                        }
                    }
                }
            };

            let peer_id = conversation
                .peer_id(&me)
                .ok_or(ChatError::NoRecipient)?
                .to_string();

            let same = state
                .active
                .as_ref()
                .is_some_and(|a| a.peer_id == peer_id);

            if same {
                let epoch = state.epoch;
                let active = state.active.as_mut().ok_or(ChatError::NoRecipient)?;
                if active.conversation_id.is_none() {
                    active.conversation_id = conversation.id.clone();
                }
                Selection {
                    peer_id,
                    conversation_id: active.conversation_id.clone(),
                    epoch,
                    needs_history: !active.loaded,
                }
            } else {
                state.epoch += 1;
                let epoch = state.epoch;
                state.active = Some(ActiveConversation {
                    peer_id: peer_id.clone(),
                    conversation_id: conversation.id.clone(),
                    messages: Vec::new(),
                    loaded: false,
                    epoch,
                });
                events.push(StoreEvent::ConversationSelected {
                    peer_id: peer_id.clone(),
                    conversation_id: conversation.id.clone(),
                });
                Selection {
                    peer_id,
                    conversation_id: conversation.id,
                    epoch,
                    needs_history: true,
                }
            }
        };

        self.notify(events);
        Ok(selection)
    }

    /// Whether `selection` is still the open one
    pub fn is_current(&self, selection: &Selection) -> bool {
        self.state
            .read()
            .active
            .as_ref()
            .is_some_and(|a| a.peer_id == selection.peer_id && a.epoch == selection.epoch)
    }

    /// Apply fetched history for `selection`. Returns `false` and drops the
    /// messages if another conversation was selected in the meantime.
    pub fn apply_history(&self, selection: &Selection, history: Vec<Message>) -> bool {
        let peer_id = {
            let mut state = self.state.write();
            let Some(active) = state.active.as_mut() else {
                return false;
            };
            if active.peer_id != selection.peer_id || active.epoch != selection.epoch {
                debug!(
                    "Discarding stale history for {} (epoch {})",
                    selection.peer_id, selection.epoch
                );
                return false;
            }

            let mut merged: Vec<Message> = Vec::with_capacity(history.len() + active.messages.len());
            for message in history {
                if !merged.iter().any(|m| m.id == message.id) {
                    merged.push(message);
                }
            }
            // Anything that arrived while the fetch was in flight
            for message in active.messages.drain(..) {
                if !merged.iter().any(|m| m.id == message.id) {
                    merged.push(message);
                }
            }
            if active.conversation_id.is_none() {
                active.conversation_id = merged.iter().find_map(|m| m.conversation_id.clone());
            }
            active.messages = merged;
            active.loaded = true;
            active.peer_id.clone()
        };

        self.notify(vec![StoreEvent::MessagesChanged { peer_id }]);
        true
    }

    /// Fetch and apply history for `selection`. Returns whether it was applied.
    pub async fn load_history(&self, api: &dyn MessagingApi, selection: &Selection) -> Result<bool> {
        let history = api.fetch_messages(&selection.peer_id).await?;
        Ok(self.apply_history(selection, history.into_messages()))
    }

    /// Selection ticket for the conversation that is open right now
    pub fn current_selection(&self) -> Option<Selection> {
        let state = self.state.read();
        state.active.as_ref().map(|a| Selection {
            peer_id: a.peer_id.clone(),
            conversation_id: a.conversation_id.clone(),
            epoch: a.epoch,
            needs_history: !a.loaded,
        })
    }

    pub fn active(&self) -> Option<ActiveConversation> {
        self.state.read().active.clone()
    }

    /// Peer and conversation id of the open conversation
    pub fn active_key(&self) -> Option<(String, Option<String>)> {
        self.state
            .read()
            .active
            .as_ref()
            .map(|a| (a.peer_id.clone(), a.conversation_id.clone()))
    }

    pub fn active_peer_id(&self) -> Option<String> {
        self.state.read().active.as_ref().map(|a| a.peer_id.clone())
    }

    pub fn active_messages(&self) -> Vec<Message> {
        self.state
            .read()
            .active
            .as_ref()
            .map(|a| a.messages.clone())
            .unwrap_or_default()
    }

    pub fn contains_message(&self, message_id: &str) -> bool {
        self.state
            .read()
            .active
            .as_ref()
            .is_some_and(|a| a.position(message_id).is_some())
    }

    /// Close the open conversation. Provisional conversations that never
    /// received a message are dropped with it.
    pub fn close_active(&self) {
        let me = self.user_id.clone();
        {
            let mut state = self.state.write();
            let Some(active) = state.active.take() else {
                return;
            };
            state
                .conversations
                .retain(|c| !(c.is_provisional() && c.is_between(&me, &active.peer_id)));
        }
        self.notify(vec![StoreEvent::ConversationsChanged]);
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    /// Append or replace (by id) in the open conversation. Messages for
    /// other conversations only update that conversation's summary.
    pub fn append_message(&self, message: Message) -> AppendOutcome {
        self.put_message(message, true)
    }

    /// Insert unless a message with the same id is already listed
    pub fn insert_if_absent(&self, message: Message) -> AppendOutcome {
        self.put_message(message, false)
    }

    fn put_message(&self, message: Message, replace: bool) -> AppendOutcome {
        let me = self.user_id.clone();
        let mut events = Vec::new();

        let outcome = {
            let mut state = self.state.write();
            let owned = state.active.as_ref().is_some_and(|a| a.owns(&me, &message));

            let peer_id = if message.sender != *me {
                Some(message.sender.clone())
            } else if owned {
                state.active.as_ref().map(|a| a.peer_id.clone())
            } else {
                message
                    .conversation_id
                    .as_deref()
                    .and_then(|id| state.index_by_id(id))
                    .and_then(|i| state.conversations[i].peer_id(&me).map(str::to_string))
            };

            let outcome = match state.active.as_mut().filter(|_| owned) {
                Some(active) => {
                    if active.conversation_id.is_none() {
                        active.conversation_id = message.conversation_id.clone();
                    }
                    match active.position(&message.id) {
                        Some(i) if replace => {
                            active.messages[i] = message.clone();
                            AppendOutcome::Replaced
                        }
                        Some(_) => AppendOutcome::Duplicate,
                        None => {
                            active.messages.push(message.clone());
                            AppendOutcome::Inserted
                        }
                    }
                }
                None => AppendOutcome::NotActive,
            };

            if outcome != AppendOutcome::Duplicate
                && message.delivery_state == DeliveryState::Confirmed
            {
                match peer_id.as_deref() {
                    Some(peer) => {
                        state.note_last_message(&me, peer, &message);
                        events.push(StoreEvent::ConversationsChanged);
                    }
                    None => debug!("No conversation known for message {}", message.id),
                }
            }
            if matches!(outcome, AppendOutcome::Inserted | AppendOutcome::Replaced) {
                if let Some(active) = state.active.as_ref() {
                    events.push(StoreEvent::MessagesChanged {
                        peer_id: active.peer_id.clone(),
                    });
                }
            }
            outcome
        };

        self.notify(events);
        outcome
    }

    /// Swap an optimistic entry for its confirmed copy in one step. If the
    /// confirmed id is already listed the optimistic entry is just removed.
    /// If the optimistic entry is gone, e.g. the conversation was reopened
    /// while the send was in flight, the confirmed copy is inserted unless
    /// already listed. Returns `false` when the conversation is not open.
    pub(crate) fn reconcile_message(&self, temp_id: &str, peer_id: &str, confirmed: Message) -> bool {
        let me = self.user_id.clone();
        let mut events = vec![StoreEvent::ConversationsChanged];

        let found = {
            let mut state = self.state.write();
            let found = match state.active.as_mut() {
                Some(active) if active.peer_id == peer_id => {
                    let listed = active.position(&confirmed.id).is_some();
                    let changed = match active.position(temp_id) {
                        Some(i) if listed => {
                            active.messages.remove(i);
                            true
                        }
                        Some(i) => {
                            active.messages[i] = confirmed.clone();
                            true
                        }
                        None if listed => false,
                        None => {
                            active.messages.push(confirmed.clone());
                            true
                        }
                    };
                    if active.conversation_id.is_none() {
                        active.conversation_id = confirmed.conversation_id.clone();
                    }
                    if changed {
                        events.push(StoreEvent::MessagesChanged {
                            peer_id: peer_id.to_string(),
                        });
                    }
                    true
                }
                _ => false,
            };
            state.note_last_message(&me, peer_id, &confirmed);
            found
        };

        self.notify(events);
        found
    }

    /// Drop a failed optimistic entry and hand its text back through `SendFailed`
    pub(crate) fn rollback_message(&self, temp_id: &str, text: &str) -> Option<Message> {
        let (removed, peer_id) = {
            let mut state = self.state.write();
            match state.active.as_mut() {
                Some(active) => {
                    let removed = active.position(temp_id).map(|i| active.messages.remove(i));
                    (removed, Some(active.peer_id.clone()))
                }
                None => (None, None),
            }
        };

        let mut events = Vec::new();
        if let (Some(_), Some(peer_id)) = (&removed, peer_id) {
            events.push(StoreEvent::MessagesChanged { peer_id });
        }
        events.push(StoreEvent::SendFailed {
            temp_id: temp_id.to_string(),
            text: text.to_string(),
        });
        self.notify(events);
        removed
    }

    // ─── Seen state ─────────────────────────────────────────────────────────

    /// Conversation id of the open conversation if it holds unseen messages
    /// from the peer
    pub fn unseen_incoming(&self) -> Option<String> {
        let state = self.state.read();
        let active = state.active.as_ref()?;
        let id = active.conversation_id.as_ref()?;
        active
            .messages
            .iter()
            .any(|m| m.sender != *self.user_id && !m.seen && !m.is_optimistic())
            .then(|| id.clone())
    }

    /// Mark the peer's messages in `conversation_id` as seen by us. The
    /// returned marks undo exactly this pass if the receipt fails.
    pub fn mark_incoming_seen(&self, conversation_id: &str) -> SeenMarks {
        let me = self.user_id.clone();
        self.mark_seen(conversation_id, |sender| sender != &*me)
    }

    /// Mark our own messages in `conversation_id` as seen by the peer
    pub fn mark_outgoing_seen(&self, conversation_id: &str) -> usize {
        let me = self.user_id.clone();
        self.mark_seen(conversation_id, |sender| sender == &*me).len()
    }

    /// Revert the flags set by a `mark_incoming_seen` pass whose receipt
    /// never reached the server
    pub fn unmark_incoming_seen(&self, marks: &SeenMarks) -> usize {
        let reverted = {
            let mut state = self.state.write();
            let mut reverted = 0;
            if let Some(active) = state.active.as_mut() {
                if active.conversation_id.as_deref() == Some(marks.conversation_id.as_str()) {
                    for message in active.messages.iter_mut() {
                        if message.seen && marks.message_ids.contains(&message.id) {
                            message.seen = false;
                            reverted += 1;
                        }
                    }
                }
            }
            if marks.summary {
                if let Some(i) = state.index_by_id(&marks.conversation_id) {
                    if let Some(last) = state.conversations[i].last_message.as_mut() {
                        if last.sender != *self.user_id && last.seen {
                            last.seen = false;
                            reverted += 1;
                        }
                    }
                }
            }
            reverted
        };

        if reverted > 0 {
            self.notify(vec![StoreEvent::MessagesSeen {
                conversation_id: marks.conversation_id.clone(),
            }]);
        }
        reverted
    }

    fn mark_seen<F>(&self, conversation_id: &str, authored_by: F) -> SeenMarks
    where
        F: Fn(&str) -> bool,
    {
        let mut marks = SeenMarks {
            conversation_id: conversation_id.to_string(),
            ..Default::default()
        };
        {
            let mut state = self.state.write();
            if let Some(active) = state.active.as_mut() {
                if active.conversation_id.as_deref() == Some(conversation_id) {
                    for message in active.messages.iter_mut() {
                        if authored_by(&message.sender) && !message.seen && !message.is_optimistic()
                        {
                            message.seen = true;
                            marks.message_ids.push(message.id.clone());
                        }
                    }
                }
            }
            if let Some(i) = state.index_by_id(conversation_id) {
                if let Some(last) = state.conversations[i].last_message.as_mut() {
                    if authored_by(&last.sender) && !last.seen {
                        last.seen = true;
                        marks.summary = true;
                    }
                }
            }
        }

        if !marks.is_empty() {
            self.notify(vec![StoreEvent::MessagesSeen {
                conversation_id: conversation_id.to_string(),
            }]);
        }
        marks
    }
}
