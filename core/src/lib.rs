/// ChatLink - Real-time conversation and message delivery client
///
/// Keeps a local conversation store in sync with a messaging backend over
/// REST and a websocket transport: optimistic sends with reconciliation,
/// ordered inbound delivery, seen receipts, presence and typing indicators.

pub mod error;
pub mod config;
pub mod identity;
pub mod messenger_types;
pub mod transport;
pub mod presence;
pub mod api;
pub mod store;
pub mod dispatcher;
pub mod sequencer;
pub mod seen;
pub mod peers;
pub mod typing;
pub mod client;
pub mod cli_app;

#[cfg(test)]
mod testing;

pub use error::{ChatError, Result};
pub use config::Config;
pub use client::ChatClient;
pub use dispatcher::{Draft, SendOutcome};
pub use identity::Identity;
