/// Configuration management
use crate::error::{ChatError, Result};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://127.0.0.1:5000/api";
const DEFAULT_SOCKET_URL: &str = "ws://127.0.0.1:5000/socket";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST API (no trailing slash)
    pub api_url: String,

    /// Websocket endpoint of the realtime transport
    pub socket_url: String,

    /// Signed-in user; the transport is only opened once this is set
    pub identity: Option<Identity>,

    /// Timeout applied to every REST request
    pub request_timeout: Duration,

    /// First reconnect delay after the transport drops
    pub reconnect_initial: Duration,

    /// Upper bound for the reconnect backoff
    pub reconnect_max: Duration,

    /// Quiet period after the last keystroke before `typingStop` is sent
    pub typing_idle_timeout: Duration,

    /// Capacity of the broadcast channels fanning out transport and store events
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            identity: None,
            request_timeout: Duration::from_secs(10),
            reconnect_initial: Duration::from_millis(500),
            reconnect_max: Duration::from_secs(30),
            typing_idle_timeout: Duration::from_secs(3),
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Create config from command line arguments
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut user_id: Option<String> = None;
        let mut token: Option<String> = None;
        let mut api_url: Option<String> = None;
        let mut socket_url: Option<String> = None;

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--api-url requires a URL argument".to_string())
                    })?;
                    api_url = Some(url.clone());
                    i += 2;
                }
                "--socket-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--socket-url requires a URL argument".to_string())
                    })?;
                    socket_url = Some(url.clone());
                    i += 2;
                }
                "--token" => {
                    let t = args.get(i + 1).ok_or_else(|| {
                        ChatError::Config("--token requires a value".to_string())
                    })?;
                    token = Some(t.clone());
                    i += 2;
                }
                flag if flag.starts_with("--") => {
                    return Err(ChatError::Config(format!("Unknown flag: {}", flag)));
                }
                other => {
                    if user_id.is_some() {
                        return Err(ChatError::Config(format!(
                            "Unexpected argument: {}",
                            other
                        )));
                    }
                    user_id = Some(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("CHATLINK_API_URL") {
            api_url = Some(url);
        }
        if let Ok(url) = std::env::var("CHATLINK_SOCKET_URL") {
            socket_url = Some(url);
        }
        if let Ok(id) = std::env::var("CHATLINK_USER_ID") {
            user_id = Some(id);
        }
        if let Ok(t) = std::env::var("CHATLINK_TOKEN") {
            token = Some(t);
        }

        let user_id = user_id.ok_or_else(|| {
            ChatError::Config(format!(
                "Usage: {} <user_id> [--api-url <url>] [--socket-url <url>] [--token <token>]",
                args.first().map(String::as_str).unwrap_or("chatlink")
            ))
        })?;

        let config = Self {
            api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            socket_url: socket_url.unwrap_or_else(|| DEFAULT_SOCKET_URL.to_string()),
            identity: Some(Identity::new(user_id, token)?),
            ..Default::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Check URL schemes and timing bounds
    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(ChatError::Config(format!(
                "api url must be http(s): {}",
                self.api_url
            )));
        }
        if !(self.socket_url.starts_with("ws://") || self.socket_url.starts_with("wss://")) {
            return Err(ChatError::Config(format!(
                "socket url must be ws(s): {}",
                self.socket_url
            )));
        }
        if self.reconnect_initial > self.reconnect_max {
            return Err(ChatError::Config(
                "reconnect_initial must not exceed reconnect_max".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ChatError::Config("event_buffer must be positive".to_string()));
        }
        Ok(())
    }

    /// REST endpoint for a path like `/messages/conversations`
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_url.trim_end_matches('/'), path)
    }
}
