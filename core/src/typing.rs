/// Typing indicator: `idle -> typing -> idle` per conversation, driven by one
/// owned timer per conversation that is re-armed on every keystroke.
use crate::transport::{ClientEvent, EventSink, ServerEvent, TransportEvent};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingState {
    Idle,
    Typing,
}

struct Slot {
    generation: u64,
    conversation_id: Option<String>,
    timer: JoinHandle<()>,
}

#[derive(Clone)]
pub struct TypingIndicator {
    sink: Arc<dyn EventSink>,
    idle_timeout: Duration,
    /// Our own typing state, keyed by recipient
    slots: Arc<Mutex<HashMap<String, Slot>>>,
    /// Peers currently typing to us, with the conversation they type in
    remote: Arc<RwLock<HashMap<String, Option<String>>>>,
    generation: Arc<AtomicU64>,
}

impl TypingIndicator {
    pub fn new(sink: Arc<dyn EventSink>, idle_timeout: Duration) -> Self {
        Self {
            sink,
            idle_timeout,
            slots: Arc::new(Mutex::new(HashMap::new())),
            remote: Arc::new(RwLock::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    fn publish(&self, event: ClientEvent) {
        if let Err(e) = self.sink.emit(&event) {
            debug!("{} not sent: {}", event.event_name(), e);
        }
    }

    /// Register a keystroke in the conversation with `recipient_id`
    pub fn keystroke(&self, recipient_id: &str, conversation_id: Option<String>) {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slots = self.slots.lock();

        match slots.remove(recipient_id) {
            Some(previous) => previous.timer.abort(),
            None => self.publish(ClientEvent::TypingStart {
                recipient_id: recipient_id.to_string(),
                conversation_id: conversation_id.clone(),
            }),
        }

        let indicator = self.clone();
        let recipient = recipient_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(indicator.idle_timeout).await;
            indicator.expire(&recipient, generation);
        });

        slots.insert(
            recipient_id.to_string(),
            Slot {
                generation,
                conversation_id,
                timer,
            },
        );
    }

    fn expire(&self, recipient_id: &str, generation: u64) {
        let mut slots = self.slots.lock();
        let current = slots
            .get(recipient_id)
            .is_some_and(|slot| slot.generation == generation);
        if !current {
            return;
        }
        if let Some(slot) = slots.remove(recipient_id) {
            self.publish(ClientEvent::TypingStop {
                recipient_id: recipient_id.to_string(),
                conversation_id: slot.conversation_id,
            });
        }
    }

    /// Go idle right away, e.g. when the message is sent. Returns `false`
    /// if we were not typing.
    pub fn stop(&self, recipient_id: &str) -> bool {
        let slot = self.slots.lock().remove(recipient_id);
        match slot {
            Some(slot) => {
                slot.timer.abort();
                self.publish(ClientEvent::TypingStop {
                    recipient_id: recipient_id.to_string(),
                    conversation_id: slot.conversation_id,
                });
                true
            }
            None => false,
        }
    }

    pub fn state(&self, recipient_id: &str) -> TypingState {
        if self.slots.lock().contains_key(recipient_id) {
            TypingState::Typing
        } else {
            TypingState::Idle
        }
    }

    /// Track peers typing to us
    pub fn apply(&self, event: &TransportEvent) {
        match event {
            TransportEvent::Server(ServerEvent::UserTyping {
                sender_id,
                conversation_id,
            }) => {
                self.remote
                    .write()
                    .insert(sender_id.clone(), conversation_id.clone());
            }
            TransportEvent::Server(ServerEvent::UserStoppedTyping { sender_id, .. }) => {
                self.remote.write().remove(sender_id);
            }
            TransportEvent::Disconnected => self.remote.write().clear(),
            _ => {}
        }
    }

    pub fn peer_is_typing(&self, peer_id: &str) -> bool {
        self.remote.read().contains_key(peer_id)
    }

    pub async fn run(self, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => self.apply(&event),
                Err(RecvError::Lagged(n)) => warn!("Typing tracker skipped {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Stop every timer, sending `typingStop` for each
    pub fn shutdown(&self) {
        let recipients: Vec<String> = self.slots.lock().keys().cloned().collect();
        for recipient in recipients {
            self.stop(&recipient);
        }
    }
}
