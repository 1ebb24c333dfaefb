/// Event frames exchanged with the realtime server.
///
/// Every websocket text frame is one JSON object `{"event": <name>, "data": <payload>}`.
use crate::messenger_types::Message;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events pushed by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerEvent {
    /// Full presence list, sent on connect and on `getOnlineUsers`
    OnlineUsers(Vec<String>),

    UserOnline(String),

    UserOffline(String),

    NewMessage(Message),

    /// The peer has seen our messages in this conversation
    #[serde(rename_all = "camelCase")]
    MessagesSeen { conversation_id: String },

    #[serde(rename_all = "camelCase")]
    UserTyping {
        sender_id: String,
        conversation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    UserStoppedTyping {
        sender_id: String,
        conversation_id: Option<String>,
    },
}

impl ServerEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerEvent::OnlineUsers(_) => "onlineUsers",
            ServerEvent::UserOnline(_) => "userOnline",
            ServerEvent::UserOffline(_) => "userOffline",
            ServerEvent::NewMessage(_) => "newMessage",
            ServerEvent::MessagesSeen { .. } => "messagesSeen",
            ServerEvent::UserTyping { .. } => "userTyping",
            ServerEvent::UserStoppedTyping { .. } => "userStoppedTyping",
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ServerEvent({})", self.event_name())
    }
}

/// Events the client publishes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Relay a server-confirmed message so the recipient sees it immediately
    #[serde(rename_all = "camelCase")]
    SendMessage {
        message: Message,
        recipient_id: String,
        conversation_id: String,
    },

    #[serde(rename_all = "camelCase")]
    MarkMessagesAsSeen {
        conversation_id: String,
        user_id: String,
    },

    #[serde(rename_all = "camelCase")]
    TypingStart {
        recipient_id: String,
        conversation_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    TypingStop {
        recipient_id: String,
        conversation_id: Option<String>,
    },

    /// Ask for a fresh `onlineUsers` snapshot
    GetOnlineUsers,
}

impl ClientEvent {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage { .. } => "sendMessage",
            ClientEvent::MarkMessagesAsSeen { .. } => "markMessagesAsSeen",
            ClientEvent::TypingStart { .. } => "typingStart",
            ClientEvent::TypingStop { .. } => "typingStop",
            ClientEvent::GetOnlineUsers => "getOnlineUsers",
        }
    }

    /// Serialize to the JSON text carried by one websocket frame
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientEvent({})", self.event_name())
    }
}

/// Parse one inbound frame
pub fn parse_server_event(text: &str) -> Result<ServerEvent, serde_json::Error> {
    serde_json::from_str(text)
}

/// Connection state of the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not connected, a reconnect may be pending
    Disconnected,
    /// Socket handshake in progress
    Connecting,
    /// Connected and able to emit
    Connected,
    /// Closed by the caller, no further reconnects
    Closed,
}

/// What transport subscribers receive
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Server(ServerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_event_names_match_wire() {
        let ev = parse_server_event(r#"{"event":"userOnline","data":"alice"}"#).unwrap();
        assert_eq!(ev, ServerEvent::UserOnline("alice".to_string()));

        let ev = parse_server_event(r#"{"event":"onlineUsers","data":["a","b"]}"#).unwrap();
        assert_eq!(ev.event_name(), "onlineUsers");

        let ev =
            parse_server_event(r#"{"event":"messagesSeen","data":{"conversationId":"c1"}}"#)
                .unwrap();
        assert_eq!(
            ev,
            ServerEvent::MessagesSeen {
                conversation_id: "c1".to_string()
            }
        );
    }

    #[test]
    fn test_client_event_encoding() {
        let ev = ClientEvent::MarkMessagesAsSeen {
            conversation_id: "c1".to_string(),
            user_id: "me".to_string(),
        };
        let v: serde_json::Value = serde_json::from_str(&ev.to_text().unwrap()).unwrap();
        assert_eq!(v["event"], "markMessagesAsSeen");
        assert_eq!(v["data"]["conversationId"], "c1");
        assert_eq!(v["data"]["userId"], "me");

        let v: serde_json::Value =
            serde_json::from_str(&ClientEvent::GetOnlineUsers.to_text().unwrap()).unwrap();
        assert_eq!(v["event"], "getOnlineUsers");
    }

    #[test]
    fn test_unknown_event_is_an_error() {
        assert!(parse_server_event(r#"{"event":"mystery","data":1}"#).is_err());
    }
}
