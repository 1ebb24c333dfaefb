/// Caller identity issued by the authentication service
use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Durable user id plus the bearer credential used for REST calls.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub token: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, token: Option<String>) -> Result<Self> {
        let user_id = user_id.into().trim().to_string();
        if user_id.is_empty() {
            return Err(ChatError::Config("user id must not be empty".to_string()));
        }
        let token = token.filter(|t| !t.trim().is_empty());
        Ok(Self { user_id, token })
    }

    /// `Authorization` header value, if a credential is present.
    pub fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {}", t))
    }
}

// Keep the credential out of logs.
impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("user_id", &self.user_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
