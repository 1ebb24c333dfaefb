use crate::api::{HttpApi, MessageHistory, MessagingApi, SendMessageRequest};
use crate::config::Config;
use crate::error::ChatError;
use crate::messenger_types::Conversation;
use colored::*;

/// One-shot REST commands against the messaging backend.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("chatlink-cli")
        .to_string();

    let (positional, config_args) = split_args(&bin, &args[1..]);
    if positional.is_empty() {
        print_usage(&bin);
        return Ok(());
    }

    let config = match Config::from_args(&config_args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e.to_string().red());
            eprintln!("  Set {} or pass {}", "CHATLINK_USER_ID".yellow(), "--as <user_id>".yellow());
            return Ok(());
        }
    };
    let me = config
        .identity
        .as_ref()
        .map(|i| i.user_id.clone())
        .unwrap_or_default();
    let api = HttpApi::new(config)?;

    let command = positional[0].as_str();
    let result = match command {
        "conversations" => list_conversations(&api, &me).await,
        "history" => match positional.get(1) {
            Some(peer) => show_history(&api, &me, peer).await,
            None => {
                eprintln!("{}", format!("Usage: {} history <peer_id>", bin).yellow());
                return Ok(());
            }
        },
        "search" => {
            if positional.len() < 2 {
                eprintln!("{}", format!("Usage: {} search <query>", bin).yellow());
                return Ok(());
            }
            search(&api, &positional[1..].join(" ")).await
        }
        "send" => {
            if positional.len() < 3 {
                eprintln!("{}", format!("Usage: {} send <peer_id> <message>", bin).yellow());
                return Ok(());
            }
            send(&api, &positional[1], positional[2..].join(" ")).await
        }
        "seen" => match positional.get(1) {
            Some(conversation_id) => mark_seen(&api, conversation_id).await,
            None => {
                eprintln!("{}", format!("Usage: {} seen <conversation_id>", bin).yellow());
                return Ok(());
            }
        },
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
            return Ok(());
        }
    };

    if let Err(e) = result {
        match e {
            ChatError::Unauthorized => eprintln!(
                "{} {}",
                "✗".red().bold(),
                "Not authorized, check CHATLINK_TOKEN".red()
            ),
            other => eprintln!("{} Error: {}", "✗".red().bold(), other.to_string().red()),
        }
        std::process::exit(1);
    }
    Ok(())
}

/// Separate the command words from the flags `Config::from_args` understands.
/// `--as <user>` becomes the positional user id.
fn split_args(bin: &str, args: &[String]) -> (Vec<String>, Vec<String>) {
    let mut positional = Vec::new();
    let mut config_args = vec![bin.to_string()];
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--as" => {
                if let Some(user) = args.get(i + 1) {
                    config_args.push(user.clone());
                }
                i += 2;
            }
            flag @ ("--api-url" | "--socket-url" | "--token") => {
                config_args.push(flag.to_string());
                if let Some(value) = args.get(i + 1) {
                    config_args.push(value.clone());
                }
                i += 2;
            }
            _ => {
                positional.push(args[i].clone());
                i += 1;
            }
        }
    }
    (positional, config_args)
}

fn print_usage(bin: &str) {
    println!("{}", "💬 ChatLink CLI".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args] [--as <user_id>] [--api-url <url>] [--token <token>]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                    List conversations", "conversations".cyan());
    println!("  {} <peer_id>                Show message history", "history".cyan());
    println!("  {} <query>                   Search connected users", "search".cyan());
    println!("  {} <peer_id> <message>         Send a message", "send".cyan());
    println!("  {} <conversation_id>           Mark a conversation seen", "seen".cyan());
}

fn peer_label(conversation: &Conversation, me: &str) -> String {
    match conversation.peer_details(me) {
        Some(peer) if !peer.display_name.is_empty() => peer.display_name.clone(),
        Some(peer) => peer.username.clone(),
        None => conversation.peer_id(me).unwrap_or("?").to_string(),
    }
}

async fn list_conversations(api: &HttpApi, me: &str) -> crate::Result<()> {
    let mut conversations = api.list_conversations().await?;
    if conversations.is_empty() {
        println!("{}", "No conversations yet".yellow());
        return Ok(());
    }
    conversations.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    println!(
        "{}",
        format!("Conversations ({})", conversations.len())
            .bright_cyan()
            .bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for conversation in &conversations {
        let id = conversation.id.as_deref().unwrap_or("-");
        let preview = match &conversation.last_message {
            Some(last) => {
                let text = if last.sender == me {
                    format!("You: {}", last.text)
                } else {
                    last.text.clone()
                };
                if !last.seen && last.sender != me {
                    text.bold().to_string()
                } else {
                    text.dimmed().to_string()
                }
            }
            None => String::new(),
        };
        println!(
            "  {} {} {}",
            peer_label(conversation, me).cyan(),
            format!("[{}]", id).dimmed(),
            preview
        );
    }
    Ok(())
}

async fn show_history(api: &HttpApi, me: &str, peer_id: &str) -> crate::Result<()> {
    let messages = match api.fetch_messages(peer_id).await? {
        MessageHistory::NotStarted => {
            println!("{}", format!("No conversation with {} yet", peer_id).yellow());
            return Ok(());
        }
        MessageHistory::Messages(messages) => messages,
    };

    println!("{}", format!("Conversation with {}", peer_id).bright_cyan().bold());
    println!("{}", "─".repeat(60).dimmed());
    for message in &messages {
        let at = message.created_at.format("%Y-%m-%d %H:%M");
        let who = if message.sender == me {
            "you".green()
        } else {
            message.sender.as_str().cyan()
        };
        let mut line = format!("  {} {}: {}", at.to_string().dimmed(), who, message.text);
        if let Some(image) = &message.image {
            line.push_str(&format!(" {}", format!("[image {}]", image).dimmed()));
        }
        if message.sender == me && message.seen {
            line.push_str(&format!(" {}", "✓✓".green()));
        }
        println!("{}", line);
    }
    Ok(())
}

async fn search(api: &HttpApi, query: &str) -> crate::Result<()> {
    let peers = api.search_connected(query).await?;
    if peers.is_empty() {
        println!("{}", "No matching connections".yellow());
        return Ok(());
    }
    for peer in peers {
        println!(
            "  {} {} {}",
            peer.username.cyan(),
            peer.display_name,
            format!("[{}]", peer.id).dimmed()
        );
    }
    Ok(())
}

async fn send(api: &HttpApi, peer_id: &str, text: String) -> crate::Result<()> {
    if text.trim().is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let request = SendMessageRequest {
        recipient_id: peer_id.to_string(),
        message: text.trim().to_string(),
        img: None,
    };
    let message = api.send_message(&request).await?;
    println!(
        "{} Message sent! ID: {} in {}",
        "✓".green().bold(),
        message.id.cyan(),
        message.conversation_id.as_deref().unwrap_or("-").cyan()
    );
    Ok(())
}

async fn mark_seen(api: &HttpApi, conversation_id: &str) -> crate::Result<()> {
    api.mark_seen(conversation_id).await?;
    println!("{} Marked {} as seen", "✓".green().bold(), conversation_id.cyan());
    Ok(())
}
