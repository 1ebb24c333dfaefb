/// Inbound message sequencer: the single consumer of `newMessage` events.
///
/// Transport deliveries are queued and applied one at a time, in arrival
/// order, with an idempotent insert. Echoes of our own sends are handed to
/// the dispatcher first so a message is never listed under two ids.
use crate::api::MessagingApi;
use crate::dispatcher::{is_temp_id, MessageDispatcher};
use crate::error::{ChatError, Result};
use crate::messenger_types::{DeliveryState, Message};
use crate::store::{AppendOutcome, ConversationStore};
use crate::transport::{ServerEvent, TransportEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What applying one inbound message did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Added to the open conversation
    Inserted,
    /// Already listed under the same id
    Duplicate,
    /// Echo of one of our pending sends; swapped in for the optimistic entry
    Reconciled,
    /// For a conversation that is not open; its list summary was updated
    SummaryOnly,
    /// Carried a client-side id and was ignored
    Rejected,
}

enum Inbound {
    Message(Message),
    /// Refetch the conversation list and the open history after a gap
    Resync,
    /// Resolves once everything queued before it has been applied
    Flush(oneshot::Sender<()>),
}

/// Handle to the sequencer queue. Cheap to clone.
#[derive(Clone)]
pub struct InboundSequencer {
    queue: mpsc::UnboundedSender<Inbound>,
}

impl InboundSequencer {
    /// Start the worker that drains the queue
    pub fn spawn(
        store: ConversationStore,
        dispatcher: MessageDispatcher,
        api: Arc<dyn MessagingApi>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_refreshes(store.clone(), api, refresh_rx));
        let worker = Worker {
            store,
            dispatcher,
            refresh: refresh_tx,
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { queue: tx }, handle)
    }

    /// Queue a message delivered by the transport
    pub fn enqueue(&self, message: Message) -> Result<()> {
        self.queue
            .send(Inbound::Message(message))
            .map_err(|_| ChatError::Transport("sequencer stopped".to_string()))
    }

    /// Queue a full refetch of the list and the open conversation
    pub fn resync(&self) -> Result<()> {
        self.queue
            .send(Inbound::Resync)
            .map_err(|_| ChatError::Transport("sequencer stopped".to_string()))
    }

    /// Wait until every message queued so far has been applied
    pub async fn flush(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.queue
            .send(Inbound::Flush(tx))
            .map_err(|_| ChatError::Transport("sequencer stopped".to_string()))?;
        rx.await
            .map_err(|_| ChatError::Transport("sequencer stopped".to_string()))
    }

    /// Feed transport events into the queue until the transport goes away.
    /// A reconnect or a lagged receiver means deliveries may have been
    /// missed, so both trigger a resync.
    pub async fn pump(self, mut events: broadcast::Receiver<TransportEvent>) {
        let mut connected_before = false;
        loop {
            let queued = match events.recv().await {
                Ok(TransportEvent::Server(ServerEvent::NewMessage(message))) => {
                    self.enqueue(message)
                }
                Ok(TransportEvent::Connected) => {
                    let result = if connected_before {
                        info!("Transport reconnected, resyncing messages");
                        self.resync()
                    } else {
                        Ok(())
                    };
                    connected_before = true;
                    result
                }
                Ok(_) => Ok(()),
                Err(RecvError::Lagged(n)) => {
                    warn!("Sequencer lagged, {} transport events skipped", n);
                    self.resync()
                }
                Err(RecvError::Closed) => break,
            };
            if queued.is_err() {
                break;
            }
        }
        debug!("Sequencer pump stopped");
    }
}

struct Worker {
    store: ConversationStore,
    dispatcher: MessageDispatcher,
    /// Refresh requests; `true` also refetches the open history
    refresh: mpsc::UnboundedSender<bool>,
}

impl Worker {
    async fn run(self, mut queue: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(item) = queue.recv().await {
            match item {
                Inbound::Message(message) => {
                    let id = message.id.clone();
                    let known = self.is_known(&message);
                    let outcome = self.apply(message);
                    debug!("Inbound {} -> {:?}", id, outcome);
                    if !known && outcome != InboundOutcome::Rejected {
                        self.refresh(false);
                    }
                }
                Inbound::Resync => self.refresh(true),
                Inbound::Flush(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Sequencer worker stopped");
    }

    fn is_known(&self, message: &Message) -> bool {
        let by_id = message
            .conversation_id
            .as_deref()
            .and_then(|id| self.store.find_by_id(id));
        by_id.is_some() || self.store.find_by_peer(&message.sender).is_some()
    }

    /// Apply one message. Never runs concurrently with itself.
    fn apply(&self, mut message: Message) -> InboundOutcome {
        if is_temp_id(&message.id) {
            warn!("Ignoring inbound message with client id {}", message.id);
            return InboundOutcome::Rejected;
        }
        message.delivery_state = DeliveryState::Confirmed;

        if message.sender == self.store.user_id() && self.dispatcher.reconcile_echo(&message) {
            return InboundOutcome::Reconciled;
        }

        match self.store.insert_if_absent(message) {
            AppendOutcome::Inserted | AppendOutcome::Replaced => InboundOutcome::Inserted,
            AppendOutcome::Duplicate => InboundOutcome::Duplicate,
            AppendOutcome::NotActive => InboundOutcome::SummaryOnly,
        }
    }

    /// Refetch the list without holding up the queue, e.g. to learn about a
    /// conversation a peer just started
    fn refresh(&self, with_history: bool) {
        if self.refresh.send(with_history).is_err() {
            warn!("Conversation refresh task stopped");
        }
    }
}

/// Run refreshes one at a time. Requests that pile up while one is in
/// flight are folded into the next.
async fn run_refreshes(
    store: ConversationStore,
    api: Arc<dyn MessagingApi>,
    mut requests: mpsc::UnboundedReceiver<bool>,
) {
    while let Some(mut with_history) = requests.recv().await {
        while let Ok(more) = requests.try_recv() {
            with_history |= more;
        }
        if let Err(e) = store.load_conversations(api.as_ref()).await {
            warn!("Conversation refresh failed: {}", e);
        }
        if !with_history {
            continue;
        }
        if let Some(selection) = store.current_selection() {
            if let Err(e) = store.load_history(api.as_ref(), &selection).await {
                warn!("History resync for {} failed: {}", selection.peer_id, e);
            }
        }
    }
    debug!("Conversation refresh task stopped");
}
