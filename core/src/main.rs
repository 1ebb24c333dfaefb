/// ChatLink session - Main entry point
use chatlink_core::api::HttpApi;
use chatlink_core::messenger_types::StoreEvent;
use chatlink_core::{ChatClient, Config};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse configuration
    let args: Vec<String> = env::args().collect();
    let config =
        Config::from_args(&args).map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let api = Arc::new(HttpApi::new(config.clone())?);
    let client = ChatClient::new(config.clone(), api)?;
    info!("🚀 Starting ChatLink session");
    info!("   User: {}", client.user_id());
    info!("   API: {}", config.api_url);
    info!("   Socket: {}", config.socket_url);

    let mut events = client.store().subscribe();
    let handle = client
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("Session error: {}", e))?;
    info!("   Session: {}", handle.session_id);

    for conversation in client.store().list_conversations() {
        let peer = conversation.peer_id(client.user_id()).unwrap_or("?");
        let preview = conversation
            .last_message
            .as_ref()
            .map(|m| m.text.as_str())
            .unwrap_or("");
        info!("   {} {}", peer, preview);
    }

    let shutdown = wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            event = events.recv() => match event {
                Ok(event) => log_event(&client, event),
                Err(RecvError::Lagged(n)) => warn!("Skipped {} store events", n),
                Err(RecvError::Closed) => break,
            },
        }
    }

    info!("Shutdown signal received, stopping session...");
    client.shutdown();
    Ok(())
}

fn log_event(client: &ChatClient, event: StoreEvent) {
    match event {
        StoreEvent::ConversationsChanged => {
            info!("{} conversations", client.store().list_conversations().len());
        }
        StoreEvent::MessagesChanged { peer_id } => {
            if let Some(last) = client.store().active_messages().last() {
                info!("[{}] {}: {}", peer_id, last.sender, last.text);
            }
        }
        StoreEvent::SendFailed { text, .. } => warn!("Send failed, draft restored: {}", text),
        other => info!("{:?}", other),
    }
}

/// Wait for shutdown signal (Ctrl+C)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
