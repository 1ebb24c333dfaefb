/// Persistent websocket connection to the realtime server
use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::identity::Identity;
use crate::transport::protocol::{
    parse_server_event, ClientEvent, ConnectionState, TransportEvent,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Returned by `Transport::connect`; identical for repeated calls with the same identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportHandle {
    pub session_id: Uuid,
    pub user_id: String,
}

struct Session {
    handle: TransportHandle,
    shutdown: watch::Sender<bool>,
}

struct Inner {
    config: Config,
    events: broadcast::Sender<TransportEvent>,
    state: RwLock<ConnectionState>,
    session: Mutex<Option<Session>>,
    /// Writer queue of the live socket; `None` while disconnected
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl Inner {
    fn is_current(&self, session_id: Uuid) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.handle.session_id == session_id)
            .unwrap_or(false)
    }

    fn set_state(&self, session_id: Uuid, state: ConnectionState) -> bool {
        if !self.is_current(session_id) {
            return false;
        }
        *self.state.write() = state;
        true
    }

    fn publish(&self, event: TransportEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// A socket of `session_id` went away. A superseded session stays quiet
    /// so it cannot reset state belonging to its replacement.
    fn socket_closed(&self, session_id: Uuid) -> bool {
        if !self.is_current(session_id) {
            return false;
        }
        *self.outbound.lock() = None;
        self.publish(TransportEvent::Disconnected);
        true
    }
}

/// Exponential reconnect delay with jitter
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to `max`, plus up to 25% jitter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        let jitter_ms = (base.as_millis() / 4) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        self.current = (self.current * 2).min(self.max);
        (base + jitter).min(self.max + self.max / 4)
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Websocket URL carrying the caller's durable user id
pub fn socket_url_for(base: &str, user_id: &str) -> String {
    let sep = if base.contains('?') { '&' } else { '?' };
    format!("{}{}userId={}", base, sep, urlencoding::encode(user_id))
}

/// The single realtime connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(config: Config) -> Self {
        let (events, _rx) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                events,
                state: RwLock::new(ConnectionState::Disconnected),
                session: Mutex::new(None),
                outbound: Mutex::new(None),
            }),
        }
    }

    /// Open the connection for `identity`. Calling again with the same user
    /// returns the existing handle instead of opening a second socket; a
    /// different user replaces the current session.
    pub fn connect(&self, identity: &Identity) -> Result<TransportHandle> {
        let mut session = self.inner.session.lock();

        if let Some(existing) = session.as_ref() {
            if existing.handle.user_id == identity.user_id {
                debug!("Transport already open for {}", identity.user_id);
                return Ok(existing.handle.clone());
            }
            info!(
                "Switching transport from {} to {}",
                existing.handle.user_id, identity.user_id
            );
            let _ = existing.shutdown.send(true);
            *self.inner.outbound.lock() = None;
            if *self.inner.state.read() == ConnectionState::Connected {
                self.inner.publish(TransportEvent::Disconnected);
            }
        }

        let handle = TransportHandle {
            session_id: Uuid::new_v4(),
            user_id: identity.user_id.clone(),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *session = Some(Session {
            handle: handle.clone(),
            shutdown: shutdown_tx,
        });
        *self.inner.state.write() = ConnectionState::Connecting;
        drop(session);

        let inner = self.inner.clone();
        let session_handle = handle.clone();
        tokio::spawn(async move {
            run_session(inner, session_handle, shutdown_rx).await;
        });

        Ok(handle)
    }

    /// Subscribe to connection changes and server events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }

    /// Publish an event. Fails fast with `ChatError::Disconnected` while offline.
    pub fn emit(&self, event: &ClientEvent) -> Result<()> {
        let text = event.to_text()?;
        let outbound = self.inner.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| ChatError::Disconnected),
            None => Err(ChatError::Disconnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current session, if `connect` has been called
    pub fn handle(&self) -> Option<TransportHandle> {
        self.inner.session.lock().as_ref().map(|s| s.handle.clone())
    }

    /// Close the connection and stop reconnecting
    pub fn close(&self) {
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            info!("Closing transport for {}", session.handle.user_id);
            let _ = session.shutdown.send(true);
        }
        *self.inner.outbound.lock() = None;
        let was_connected = std::mem::replace(&mut *self.inner.state.write(), ConnectionState::Closed)
            == ConnectionState::Connected;
        if was_connected {
            self.inner.publish(TransportEvent::Disconnected);
        }
    }
}

/// Anything that can publish client events; the transport in production
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &ClientEvent) -> Result<()>;
}

impl EventSink for Transport {
    fn emit(&self, event: &ClientEvent) -> Result<()> {
        Transport::emit(self, event)
    }
}

/// Connect/reconnect loop for one session
async fn run_session(
    inner: Arc<Inner>,
    handle: TransportHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = socket_url_for(&inner.config.socket_url, &handle.user_id);
    let mut backoff = Backoff::new(inner.config.reconnect_initial, inner.config.reconnect_max);

    loop {
        if *shutdown.borrow() || !inner.set_state(handle.session_id, ConnectionState::Connecting)
        {
            break;
        }

        let attempt = tokio::select! {
            r = timeout(inner.config.request_timeout, connect_async(url.as_str())) => r,
            _ = shutdown.changed() => break,
        };

        match attempt {
            Ok(Ok((socket, _response))) => {
                backoff.reset();
                info!("Transport connected as {}", handle.user_id);
                let stopped = drive_socket(&inner, handle.session_id, socket, &mut shutdown).await;
                if stopped {
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!("Transport connection failed: {}", e);
            }
            Err(_) => {
                warn!("Transport connection timeout to {}", inner.config.socket_url);
            }
        }

        if !inner.set_state(handle.session_id, ConnectionState::Disconnected) {
            break;
        }
        let delay = backoff.next_delay();
        debug!("Reconnecting in {:?}", delay);
        tokio::select! {
            _ = sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    debug!("Transport session {} finished", handle.session_id);
}

/// Pump one live socket until it drops. Returns `true` when the caller closed the session.
async fn drive_socket(
    inner: &Arc<Inner>,
    session_id: Uuid,
    socket: Socket,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Presence must be resynced after every (re)connect
    if let Ok(text) = ClientEvent::GetOnlineUsers.to_text() {
        if let Err(e) = write.send(WsMessage::Text(text.into())).await {
            warn!("Transport dropped before presence sync: {}", e);
            return false;
        }
    }

    if !inner.is_current(session_id) {
        return true;
    }
    *inner.outbound.lock() = Some(tx);
    inner.set_state(session_id, ConnectionState::Connected);
    inner.publish(TransportEvent::Connected);

    let stopped = loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match parse_server_event(text.as_str()) {
                    Ok(event) => {
                        debug!("Transport received {}", event);
                        inner.publish(TransportEvent::Server(event));
                    }
                    Err(e) => warn!("Ignoring malformed transport frame: {}", e),
                },
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Transport closed by server");
                    break false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("Transport read error: {}", e);
                    break false;
                }
            },
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if let Err(e) = write.send(WsMessage::Text(text.into())).await {
                        warn!("Transport write error: {}", e);
                        break false;
                    }
                }
                None => break false,
            },
            _ = shutdown.changed() => {
                let _ = write.send(WsMessage::Close(None)).await;
                break true;
            }
        }
    };

    inner.socket_closed(session_id);
    stopped
}
