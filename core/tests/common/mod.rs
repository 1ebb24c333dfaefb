//! In-process messaging backend for integration tests: the REST API on a
//! hyper server and the realtime transport on a tokio-tungstenite server.
#![allow(dead_code)]

use bytes::Bytes;
use chatlink_core::identity::Identity;
use chatlink_core::messenger_types::{DeliveryState, Message, PeerSummary};
use chatlink_core::Config;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as WsRequest, Response as WsResponse,
};
use tokio_tungstenite::tungstenite::Message as WsMessage;

type Shared = Arc<Mutex<BackendState>>;

struct FakeConversation {
    id: String,
    participants: Vec<String>,
    updated_at: DateTime<Utc>,
}

impl FakeConversation {
    fn is_between(&self, a: &str, b: &str) -> bool {
        self.participants.iter().any(|p| p == a) && self.participants.iter().any(|p| p == b)
    }

    fn other(&self, me: &str) -> Option<String> {
        self.participants.iter().find(|p| *p != me).cloned()
    }
}

#[derive(Default)]
struct BackendState {
    users: HashMap<String, PeerSummary>,
    connections: HashSet<(String, String)>,
    conversations: Vec<FakeConversation>,
    messages: Vec<Message>,
    /// user id -> (socket generation, writer queue)
    sockets: HashMap<String, (u64, mpsc::UnboundedSender<String>)>,
    socket_seq: u64,
    /// (user id, event name) for every frame a client sent
    frames: Vec<(String, String)>,
    history_delays: HashMap<String, Duration>,
    fail_sends: bool,
    next_message: u64,
    next_conversation: u64,
}

impl BackendState {
    fn send_to(&self, user_id: &str, event: &str, data: Value) {
        if let Some((_, tx)) = self.sockets.get(user_id) {
            let _ = tx.send(json!({ "event": event, "data": data }).to_string());
        }
    }

    fn broadcast_except(&self, user_id: &str, event: &str, data: Value) {
        for id in self.sockets.keys().filter(|id| *id != user_id) {
            self.send_to(id, event, data.clone());
        }
    }

    fn connected(&self, a: &str, b: &str) -> bool {
        self.connections.contains(&pair(a, b))
    }

    fn conversation_between(&self, a: &str, b: &str) -> Option<&FakeConversation> {
        self.conversations.iter().find(|c| c.is_between(a, b))
    }

    fn conversation_json(&self, conversation: &FakeConversation, caller: &str) -> Value {
        let details: Vec<&PeerSummary> = conversation
            .participants
            .iter()
            .filter(|p| *p != caller)
            .filter_map(|p| self.users.get(p))
            .collect();
        let last = self
            .messages
            .iter()
            .filter(|m| m.conversation_id.as_deref() == Some(conversation.id.as_str()))
            .last()
            .map(|m| json!({ "text": m.text, "sender": m.sender, "seen": m.seen }));
        json!({
            "_id": conversation.id,
            "participants": conversation.participants,
            "participantDetails": details,
            "lastMessage": last,
            "updatedAt": conversation.updated_at,
        })
    }

    fn create_message(&mut self, conversation_id: &str, sender: &str, text: &str, img: Option<String>) -> Message {
        self.next_message += 1;
        let message = Message {
            id: format!("m{}", self.next_message),
            conversation_id: Some(conversation_id.to_string()),
            sender: sender.to_string(),
            text: text.to_string(),
            image: img,
            created_at: Utc::now(),
            seen: false,
            delivery_state: DeliveryState::Confirmed,
        };
        self.messages.push(message.clone());
        if let Some(c) = self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            c.updated_at = message.created_at;
        }
        message
    }

    fn ensure_conversation(&mut self, a: &str, b: &str) -> String {
        if let Some(existing) = self.conversation_between(a, b) {
            return existing.id.clone();
        }
        self.next_conversation += 1;
        let id = format!("c{}", self.next_conversation);
        self.conversations.push(FakeConversation {
            id: id.clone(),
            participants: vec![a.to_string(), b.to_string()],
            updated_at: Utc::now(),
        });
        id
    }
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

fn query_value(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|kv| {
        let (k, v) = kv.split_once('=')?;
        if k == key {
            urlencoding::decode(v).ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

pub struct FakeBackend {
    pub api_url: String,
    pub socket_url: String,
    state: Shared,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state: Shared = Arc::new(Mutex::new(BackendState::default()));

        let http = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let http_addr = http.local_addr().unwrap();
        let http_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = http.accept().await {
                let io = TokioIo::new(stream);
                let state = http_state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    let _ = http1::Builder::new().serve_connection(io, svc).await;
                });
            }
        });

        let ws = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_addr = ws.local_addr().unwrap();
        let ws_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = ws.accept().await {
                tokio::spawn(serve_socket(stream, ws_state.clone()));
            }
        });

        Self {
            api_url: format!("http://{}/api", http_addr),
            socket_url: format!("ws://{}/socket", ws_addr),
            state,
        }
    }

    /// Client config for `user_id`; the token is the user id
    pub fn config_for(&self, user_id: &str) -> Config {
        Config {
            api_url: self.api_url.clone(),
            socket_url: self.socket_url.clone(),
            identity: Some(Identity::new(user_id, Some(user_id.to_string())).unwrap()),
            request_timeout: Duration::from_secs(5),
            reconnect_initial: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(200),
            typing_idle_timeout: Duration::from_millis(200),
            event_buffer: 256,
        }
    }

    pub fn add_user(&self, id: &str, name: &str) -> PeerSummary {
        let peer = PeerSummary {
            id: id.to_string(),
            username: id.to_string(),
            display_name: name.to_string(),
            avatar_url: None,
        };
        self.state.lock().users.insert(id.to_string(), peer.clone());
        peer
    }

    pub fn connect_users(&self, a: &str, b: &str) {
        self.state.lock().connections.insert(pair(a, b));
    }

    pub fn seed_conversation(&self, a: &str, b: &str) -> String {
        self.state.lock().ensure_conversation(a, b)
    }

    pub fn seed_message(&self, conversation_id: &str, sender: &str, text: &str) -> Message {
        self.state
            .lock()
            .create_message(conversation_id, sender, text, None)
    }

    pub fn set_fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub fn set_history_delay(&self, peer_id: &str, delay: Duration) {
        self.state
            .lock()
            .history_delays
            .insert(peer_id.to_string(), delay);
    }

    /// Messages persisted in `conversation_id`
    pub fn stored_messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id.as_deref() == Some(conversation_id))
            .cloned()
            .collect()
    }

    pub fn conversation_count(&self) -> usize {
        self.state.lock().conversations.len()
    }

    /// Push server events to `user_id`'s socket, in order
    pub fn push(&self, user_id: &str, events: Vec<(&str, Value)>) {
        let state = self.state.lock();
        for (event, data) in events {
            state.send_to(user_id, event, data);
        }
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.state.lock().sockets.contains_key(user_id)
    }

    /// Drop `user_id`'s socket from the server side
    pub fn disconnect(&self, user_id: &str) {
        self.state.lock().sockets.remove(user_id);
    }

    pub fn frame_count(&self, user_id: &str, event: &str) -> usize {
        self.state
            .lock()
            .frames
            .iter()
            .filter(|(u, e)| u == user_id && e == event)
            .count()
    }
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ─── REST ────────────────────────────────────────────────────────────────────

fn json_resp(status: StatusCode, value: Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(value.to_string())))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

fn caller(req: &Request<Incoming>, state: &Shared) -> Option<String> {
    let header = req.headers().get("authorization")?.to_str().ok()?;
    let user = header.strip_prefix("Bearer ")?;
    state
        .lock()
        .users
        .contains_key(user)
        .then(|| user.to_string())
}

async fn handle(req: Request<Incoming>, state: Shared) -> Response<Full<Bytes>> {
    let method = req.method().as_str().to_string();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    let Some(me) = caller(&req, &state) else {
        return json_resp(StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }));
    };
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    let segments: Vec<String> = path
        .trim_start_matches("/api/")
        .split('/')
        .map(|s| urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_default())
        .collect();
    let segments: Vec<&str> = segments.iter().map(String::as_str).collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", ["messages", "conversations"]) => {
            let state = state.lock();
            let list: Vec<Value> = state
                .conversations
                .iter()
                .filter(|c| c.participants.iter().any(|p| *p == me))
                .map(|c| state.conversation_json(c, &me))
                .collect();
            json_resp(StatusCode::OK, Value::Array(list))
        }
        ("GET", ["users", "search", "connected"]) => {
            let q = query_value(&query, "q").unwrap_or_default().to_lowercase();
            let state = state.lock();
            let found: Vec<&PeerSummary> = state
                .users
                .values()
                .filter(|u| u.id != me && state.connected(&me, &u.id))
                .filter(|u| {
                    u.username.to_lowercase().contains(&q)
                        || u.display_name.to_lowercase().contains(&q)
                })
                .collect();
            json_resp(StatusCode::OK, json!(found))
        }
        ("POST", ["messages"]) => {
            let Ok(request) = serde_json::from_slice::<Value>(&body) else {
                return json_resp(StatusCode::BAD_REQUEST, json!({ "error": "bad body" }));
            };
            let mut state = state.lock();
            if state.fail_sends {
                return json_resp(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                );
            }
            let recipient = request["recipientId"].as_str().unwrap_or_default().to_string();
            let text = request["message"].as_str().unwrap_or_default().to_string();
            let img = request["img"].as_str().map(str::to_string);
            let conversation_id = state.ensure_conversation(&me, &recipient);
            let message = state.create_message(&conversation_id, &me, &text, img);
            json_resp(StatusCode::CREATED, json!(message))
        }
        ("POST", ["messages", conversation_id, "seen"]) => {
            let mut state = state.lock();
            for m in state
                .messages
                .iter_mut()
                .filter(|m| m.conversation_id.as_deref() == Some(*conversation_id) && m.sender != me)
            {
                m.seen = true;
            }
            json_resp(StatusCode::OK, json!({ "message": "Messages marked as seen" }))
        }
        ("GET", ["messages", peer_id]) => {
            let delay = state.lock().history_delays.get(*peer_id).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let state = state.lock();
            match state.conversation_between(&me, peer_id) {
                Some(c) => {
                    let messages: Vec<&Message> = state
                        .messages
                        .iter()
                        .filter(|m| m.conversation_id.as_deref() == Some(c.id.as_str()))
                        .collect();
                    json_resp(StatusCode::OK, json!(messages))
                }
                None => json_resp(
                    StatusCode::NOT_FOUND,
                    json!({ "error": "Conversation not found" }),
                ),
            }
        }
        _ => json_resp(StatusCode::NOT_FOUND, json!({ "error": "Not found" })),
    }
}

// ─── Transport ───────────────────────────────────────────────────────────────

async fn serve_socket(stream: TcpStream, state: Shared) {
    let mut user_id: Option<String> = None;
    let accepted = tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &WsRequest, resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
            user_id = req.uri().query().and_then(|q| query_value(q, "userId"));
            Ok(resp)
        },
    )
    .await;
    let (Ok(socket), Some(user_id)) = (accepted, user_id) else {
        return;
    };

    let (mut write, mut read) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let generation = {
        let mut state = state.lock();
        state.socket_seq += 1;
        let generation = state.socket_seq;
        state.sockets.insert(user_id.clone(), (generation, tx));
        state.broadcast_except(&user_id, "userOnline", json!(user_id));
        generation
    };

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => on_frame(&state, &user_id, text.as_str()),
                Some(Ok(WsMessage::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if write.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    break;
                }
            },
        }
    }

    let mut state = state.lock();
    let current = state
        .sockets
        .get(&user_id)
        .is_some_and(|(g, _)| *g == generation);
    if current {
        state.sockets.remove(&user_id);
    }
    if !state.sockets.contains_key(&user_id) {
        state.broadcast_except(&user_id, "userOffline", json!(user_id));
    }
}

fn on_frame(state: &Shared, from: &str, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let event = frame["event"].as_str().unwrap_or_default().to_string();
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    let mut state = state.lock();
    state.frames.push((from.to_string(), event.clone()));

    match event.as_str() {
        "getOnlineUsers" => {
            let online: Vec<String> = state.sockets.keys().cloned().collect();
            state.send_to(from, "onlineUsers", json!(online));
        }
        "sendMessage" => {
            if let Some(recipient) = data["recipientId"].as_str() {
                state.send_to(recipient, "newMessage", data["message"].clone());
            }
        }
        "markMessagesAsSeen" => {
            let conversation_id = data["conversationId"].as_str().unwrap_or_default();
            let other = state
                .conversations
                .iter()
                .find(|c| c.id == conversation_id)
                .and_then(|c| c.other(from));
            if let Some(other) = other {
                state.send_to(&other, "messagesSeen", json!({ "conversationId": conversation_id }));
            }
        }
        "typingStart" | "typingStop" => {
            let name = if event == "typingStart" {
                "userTyping"
            } else {
                "userStoppedTyping"
            };
            if let Some(recipient) = data["recipientId"].as_str() {
                state.send_to(
                    recipient,
                    name,
                    json!({ "senderId": from, "conversationId": data["conversationId"] }),
                );
            }
        }
        _ => {}
    }
}
