/// Chat client: wires the transport, store, dispatcher, sequencer, seen
/// receipts, presence and typing into one session for a signed-in user.
use crate::api::MessagingApi;
use crate::config::Config;
use crate::dispatcher::{Draft, MessageDispatcher, SendTicket};
use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::messenger_types::PeerSummary;
use crate::peers::PeerResolver;
use crate::presence::PresenceTracker;
use crate::seen::SeenTracker;
use crate::sequencer::InboundSequencer;
use crate::store::{ConversationStore, ConversationTarget, Selection};
use crate::transport::{ConnectionState, Transport, TransportHandle};
use crate::typing::TypingIndicator;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// One user's messaging session. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct ChatClient {
    identity: Identity,
    api: Arc<dyn MessagingApi>,
    transport: Transport,
    store: ConversationStore,
    presence: PresenceTracker,
    dispatcher: MessageDispatcher,
    sequencer: InboundSequencer,
    seen: SeenTracker,
    peers: PeerResolver,
    typing: TypingIndicator,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Held for the whole of `start` so concurrent calls spawn one set of tasks
    starting: Arc<tokio::sync::Mutex<()>>,
}

impl ChatClient {
    /// Build a client for the identity in `config`. Must be called inside a
    /// Tokio runtime; nothing touches the network until `start`.
    pub fn new(config: Config, api: Arc<dyn MessagingApi>) -> Result<Self> {
        config.validate()?;
        let identity = config
            .identity
            .clone()
            .ok_or_else(|| ChatError::Config("no signed-in user".to_string()))?;

        let transport = Transport::new(config.clone());
        let store = ConversationStore::new(&identity.user_id, config.event_buffer);
        let sink = Arc::new(transport.clone());
        let dispatcher = MessageDispatcher::new(store.clone(), api.clone(), sink.clone());
        let (sequencer, sequencer_task) =
            InboundSequencer::spawn(store.clone(), dispatcher.clone(), api.clone());
        let seen = SeenTracker::new(store.clone(), api.clone(), sink.clone());
        let peers = PeerResolver::new(store.clone(), api.clone());
        let typing = TypingIndicator::new(sink, config.typing_idle_timeout);

        info!("Created chat client for {}", identity.user_id);

        Ok(Self {
            identity,
            api,
            transport,
            store,
            presence: PresenceTracker::new(),
            dispatcher,
            sequencer,
            seen,
            peers,
            typing,
            tasks: Arc::new(Mutex::new(vec![sequencer_task])),
            starting: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Load the conversation list and open the realtime connection.
    /// Calling it again returns the existing connection handle.
    pub async fn start(&self) -> Result<TransportHandle> {
        let _starting = self.starting.lock().await;
        if let Some(handle) = self.transport.handle() {
            return Ok(handle);
        }

        match self.store.load_conversations(self.api.as_ref()).await {
            Ok(_) => {}
            Err(ChatError::Unauthorized) => return Err(ChatError::Unauthorized),
            Err(e) => warn!("Conversation list unavailable, starting empty: {}", e),
        }

        // Subscribe before connecting so the first presence snapshot is seen
        let presence_rx = self.transport.subscribe();
        let sequencer_rx = self.transport.subscribe();
        let seen_rx = self.transport.subscribe();
        let typing_rx = self.transport.subscribe();
        let store_rx = self.store.subscribe();

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(self.presence.clone().run(presence_rx)));
            tasks.push(tokio::spawn(self.sequencer.clone().pump(sequencer_rx)));
            tasks.push(tokio::spawn(self.seen.clone().run(store_rx, seen_rx)));
            tasks.push(tokio::spawn(self.typing.clone().run(typing_rx)));
        }

        let handle = self.transport.connect(&self.identity)?;
        info!("Chat session {} started", handle.session_id);
        Ok(handle)
    }

    /// Open a conversation from the list and load its history
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<Selection> {
        let selection = self
            .store
            .select_conversation(ConversationTarget::Existing(conversation_id.to_string()))?;
        self.load_history(&selection).await?;
        Ok(selection)
    }

    /// Open the conversation with `peer`; a provisional one if none exists yet
    pub async fn open_peer(&self, peer: PeerSummary) -> Result<Selection> {
        let selection = self.peers.select_peer(peer)?;
        self.load_history(&selection).await?;
        Ok(selection)
    }

    async fn load_history(&self, selection: &Selection) -> Result<()> {
        if !selection.needs_history {
            return Ok(());
        }
        if !self.store.load_history(self.api.as_ref(), selection).await? {
            debug!("History for {} arrived after switching away", selection.peer_id);
        }
        Ok(())
    }

    /// Close the open conversation
    pub fn close_conversation(&self) {
        if let Some(peer_id) = self.store.active_peer_id() {
            self.typing.stop(&peer_id);
        }
        self.store.close_active();
    }

    pub async fn search_peers(&self, query: &str) -> Result<Vec<PeerSummary>> {
        self.peers.search(query).await
    }

    /// Send to the open conversation
    pub fn send(&self, draft: Draft) -> Result<SendTicket> {
        if let Some(peer_id) = self.store.active_peer_id() {
            self.typing.stop(&peer_id);
        }
        self.dispatcher.send(draft)
    }

    /// Report a keystroke in the open conversation's composer
    pub fn keystroke(&self) -> Result<()> {
        let (peer_id, conversation_id) = self.store.active_key().ok_or(ChatError::NoRecipient)?;
        self.typing.keystroke(&peer_id, conversation_id);
        Ok(())
    }

    pub fn online_users(&self) -> Vec<String> {
        self.presence.online_users()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn peer_is_typing(&self, peer_id: &str) -> bool {
        self.typing.peer_is_typing(peer_id)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn sequencer(&self) -> &InboundSequencer {
        &self.sequencer
    }

    pub fn seen(&self) -> &SeenTracker {
        &self.seen
    }

    /// Stop typing, close the connection and stop background tasks
    pub fn shutdown(&self) {
        self.typing.shutdown();
        self.transport.close();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        info!("Chat client for {} stopped", self.identity.user_id);
    }
}
