/// Error types for the messaging client
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Http(String),

    #[error("Not authorized, sign in again")]
    Unauthorized,

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Transport is disconnected")]
    Disconnected,

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Message text is empty")]
    EmptyMessage,

    #[error("No recipient selected")]
    NoRecipient,

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(String),
}

impl ChatError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChatError::Http(_) | ChatError::Timeout(_) | ChatError::Disconnected
        )
    }
}

impl From<reqwest::Error> for ChatError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ChatError::Timeout(e.to_string())
        } else if e.is_decode() {
            ChatError::Server {
                status: e.status().map(|s| s.as_u16()).unwrap_or(0),
                message: format!("undecodable response: {}", e),
            }
        } else {
            ChatError::Http(e.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ChatError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ChatError::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
