use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, AuthSession, ConnectionManager, ConversationSession, HttpConversationApi,
    SessionEvent, TungsteniteConnector,
};
use shared::domain::{ConversationId, UserId};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for a single conversation view")]
struct Args {
    /// Overrides `api_url` from the settings file and environment.
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    username: String,
    #[arg(long, env = "MESSENGER_PASSWORD", hide_env_values = true)]
    password: String,
    /// Conversation to open right after login.
    #[arg(long, conflicts_with = "with_user")]
    conversation: Option<i64>,
    /// Opens (or starts) the direct conversation with this user.
    #[arg(long)]
    with_user: Option<i64>,
}

const HELP: &str = "commands: /list  /open <id>  /friends  /dm <user_id>  /status  /quit; anything else is sent";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings(args.config.as_deref())?;
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }

    let http = reqwest::Client::builder()
        .timeout(settings.request_timeout())
        .build()
        .context("failed to build http client")?;
    let auth = Arc::new(AuthSession::new());
    let me = auth
        .login(&http, &settings.api_url, &args.username, &args.password)
        .await
        .context("login failed")?;
    println!("logged in as {} (user_id={})", me.display_name(), me.id.0);

    let api = Arc::new(HttpConversationApi::new(
        http,
        settings.api_url.clone(),
        auth.clone(),
    ));
    let connection = ConnectionManager::new(
        settings.api_url.clone(),
        settings.reconnect_policy(),
        Arc::new(TungsteniteConnector),
        auth.clone(),
        settings.event_buffer,
    );
    let session = ConversationSession::new(
        api.clone(),
        api,
        auth,
        connection,
        settings.event_buffer,
    );
    let printer = tokio::spawn(print_events(session.subscribe()));

    if let Err(err) = session.load_conversations().await {
        error!(error = %err, "could not load conversations");
    }
    if let Some(id) = args.conversation {
        open_conversation(&session, ConversationId(id)).await;
    } else if let Some(user_id) = args.with_user {
        if let Err(err) = session.select_counterpart(UserId(user_id)).await {
            println!("! {err}");
        }
    }

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "/quit" => break,
            "/list" => list_conversations(&session).await,
            "/status" => {
                let connection = session.connection();
                println!(
                    "connection: {:?} (reconnect attempts {}/{})",
                    connection.status(),
                    connection.reconnect_attempts().await,
                    connection.policy().max_attempts
                );
            }
            "/open" => match arg.trim().parse() {
                Ok(id) => open_conversation(&session, ConversationId(id)).await,
                Err(_) => println!("usage: /open <conversation_id>"),
            },
            "/dm" => match arg.trim().parse() {
                Ok(id) => {
                    if let Err(err) = session.select_counterpart(UserId(id)).await {
                        println!("! {err}");
                    }
                }
                Err(_) => println!("usage: /dm <user_id>"),
            },
            "/friends" => match session.load_friends().await {
                Ok(friends) => {
                    for friend in friends {
                        println!("  {:>5}  {} (@{})", friend.id.0, friend.display_name(), friend.username);
                    }
                }
                Err(err) => println!("! {err}"),
            },
            _ if command.starts_with('/') => println!("{HELP}"),
            _ => {
                session.set_draft(line).await;
                if let Err(err) = session.send_draft().await {
                    println!("! {err}");
                }
            }
        }
    }

    session.dispose().await;
    printer.abort();
    info!("bye");
    Ok(())
}

async fn list_conversations(session: &ConversationSession) {
    let selected = session.selected().await.map(|c| c.id);
    for conversation in session.conversations().await {
        let marker = if Some(conversation.id) == selected { '*' } else { ' ' };
        println!("{marker} {:>5}  {}", conversation.id.0, conversation.label());
    }
}

async fn open_conversation(session: &ConversationSession, id: ConversationId) {
    let known = session
        .conversations()
        .await
        .into_iter()
        .find(|conversation| conversation.id == id);
    let Some(conversation) = known else {
        println!("! unknown conversation {}", id.0);
        return;
    };
    if let Err(err) = session.select_conversation(&conversation).await {
        println!("! {err}");
        return;
    }
    for message in session.messages().await {
        println!(
            "[{}] {}: {}",
            message.created_at.format("%H:%M"),
            message.sender_name,
            message.content
        );
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::MessageAppended(message)) => println!(
                "[{}] {}: {}",
                message.created_at.format("%H:%M"),
                message.sender_name,
                message.content
            ),
            Ok(SessionEvent::ConversationSelected(id)) => println!("-- conversation {} --", id.0),
            Ok(SessionEvent::UserLeft { username, .. }) => println!("-- {username} left --"),
            Ok(SessionEvent::Error(message)) => println!("! {message}"),
            Ok(SessionEvent::ConversationsLoaded { count }) => {
                println!("{count} conversations (/list to show)")
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
