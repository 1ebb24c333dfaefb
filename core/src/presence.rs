/// Presence tracking: which users are currently connected to the transport
use crate::transport::{ServerEvent, TransportEvent};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Set of online user ids. Lives as long as the transport connection and is
/// emptied whenever it drops.
#[derive(Clone, Default)]
pub struct PresenceTracker {
    online: Arc<RwLock<HashSet<String>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one transport event. Returns `true` if the set changed.
    pub fn apply(&self, event: &TransportEvent) -> bool {
        match event {
            TransportEvent::Server(ServerEvent::OnlineUsers(users)) => {
                let fresh: HashSet<String> = users.iter().cloned().collect();
                let mut online = self.online.write();
                if *online == fresh {
                    return false;
                }
                *online = fresh;
                true
            }
            TransportEvent::Server(ServerEvent::UserOnline(id)) => {
                self.online.write().insert(id.clone())
            }
            TransportEvent::Server(ServerEvent::UserOffline(id)) => {
                self.online.write().remove(id)
            }
            TransportEvent::Disconnected => self.reset(),
            _ => false,
        }
    }

    /// Forget everyone; returns `true` if anybody was online
    pub fn reset(&self) -> bool {
        let mut online = self.online.write();
        let changed = !online.is_empty();
        online.clear();
        changed
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.online.read().contains(user_id)
    }

    /// Snapshot, sorted for stable display
    pub fn online_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.online.read().iter().cloned().collect();
        users.sort();
        users
    }

    pub fn count(&self) -> usize {
        self.online.read().len()
    }

    /// Consume transport events until the channel closes
    pub async fn run(self, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if self.apply(&event) {
                        debug!("Presence updated: {} online", self.count());
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    // The next onlineUsers snapshot repairs the set
                    warn!("Presence tracker lagged {} events", n);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}
