/// Peer search and selection
use crate::api::MessagingApi;
use crate::error::Result;
use crate::messenger_types::PeerSummary;
use crate::store::{ConversationStore, ConversationTarget, Selection};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct PeerResolver {
    store: ConversationStore,
    api: Arc<dyn MessagingApi>,
}

impl PeerResolver {
    pub fn new(store: ConversationStore, api: Arc<dyn MessagingApi>) -> Self {
        Self { store, api }
    }

    /// Search the caller's connections. The server only ever returns users
    /// already connected to the caller; we never widen that.
    pub async fn search(&self, query: &str) -> Result<Vec<PeerSummary>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let me = self.store.user_id();
        let mut peers = self.api.search_connected(query).await?;
        peers.retain(|p| p.id != me);
        debug!("Search {:?} matched {} peers", query, peers.len());
        Ok(peers)
    }

    /// Open the conversation with `peer`, staging a provisional one if none
    /// exists yet
    pub fn select_peer(&self, peer: PeerSummary) -> Result<Selection> {
        self.store.select_conversation(ConversationTarget::Peer(peer))
    }
}
