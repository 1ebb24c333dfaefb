/// Seen receipts in both directions.
///
/// Outgoing: when the open conversation holds unseen messages from the peer,
/// mark them locally, persist through REST and notify the peer. Incoming: a
/// `messagesSeen` event marks our own messages in that conversation.
use crate::api::MessagingApi;
use crate::error::Result;
use crate::messenger_types::StoreEvent;
use crate::store::ConversationStore;
use crate::transport::{ClientEvent, EventSink, ServerEvent, TransportEvent};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct SeenTracker {
    store: ConversationStore,
    api: Arc<dyn MessagingApi>,
    sink: Arc<dyn EventSink>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl SeenTracker {
    pub fn new(
        store: ConversationStore,
        api: Arc<dyn MessagingApi>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            api,
            sink,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Send a receipt for the open conversation if it has unseen incoming
    /// messages. Returns the conversation id a receipt was sent for.
    ///
    /// Messages are marked locally before the request goes out, so the
    /// resulting store events do not trigger a second receipt. If the request
    /// fails those marks are reverted and the next store change retries.
    pub async fn check(&self) -> Result<Option<String>> {
        let Some(conversation_id) = self.store.unseen_incoming() else {
            return Ok(None);
        };
        if !self.in_flight.lock().insert(conversation_id.clone()) {
            return Ok(None);
        }

        let marks = self.store.mark_incoming_seen(&conversation_id);
        debug!("Marked {} messages seen in {}", marks.len(), conversation_id);

        let result = self.api.mark_seen(&conversation_id).await;
        if result.is_err() {
            let reverted = self.store.unmark_incoming_seen(&marks);
            debug!("Receipt for {} failed, {} marks reverted", conversation_id, reverted);
        }
        self.in_flight.lock().remove(&conversation_id);
        result?;

        let event = ClientEvent::MarkMessagesAsSeen {
            conversation_id: conversation_id.clone(),
            user_id: self.store.user_id().to_string(),
        };
        if let Err(e) = self.sink.emit(&event) {
            // The receipt is persisted; the peer sees it on their next fetch
            debug!("Seen receipt for {} not relayed: {}", conversation_id, e);
        }
        Ok(Some(conversation_id))
    }

    /// The peer read our messages. Returns how many changed.
    pub fn handle_remote(&self, event: &TransportEvent) -> usize {
        match event {
            TransportEvent::Server(ServerEvent::MessagesSeen { conversation_id }) => {
                self.store.mark_outgoing_seen(conversation_id)
            }
            _ => 0,
        }
    }

    async fn check_logged(&self) {
        if let Err(e) = self.check().await {
            warn!("Seen receipt failed: {}", e);
        }
    }

    /// React to store and transport events until both channels close
    pub async fn run(
        self,
        mut store_events: broadcast::Receiver<StoreEvent>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
    ) {
        let mut store_open = true;
        let mut transport_open = true;

        while store_open || transport_open {
            tokio::select! {
                event = store_events.recv(), if store_open => match event {
                    Ok(StoreEvent::MessagesChanged { .. })
                    | Ok(StoreEvent::ConversationSelected { .. }) => self.check_logged().await,
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        debug!("Seen tracker skipped {} store events", n);
                        self.check_logged().await;
                    }
                    Err(RecvError::Closed) => store_open = false,
                },
                event = transport_events.recv(), if transport_open => match event {
                    Ok(event) => {
                        self.handle_remote(&event);
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Seen tracker skipped {} transport events", n);
                    }
                    Err(RecvError::Closed) => transport_open = false,
                },
            }
        }
        debug!("Seen tracker stopped");
    }
}
