use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use client_core::{
    day_label, load_settings, ClientEvent, ConnectionEvent, ConversationState, SendOutcome,
    Session, TimelineEntry,
};
use shared::domain::Conversation;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    websocket_url: Option<String>,
    #[arg(long)]
    username: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(url) = args.backend_url {
        settings.backend_url = url;
    }
    if let Some(url) = args.websocket_url {
        settings.websocket_url = Some(url);
    }

    let session = Session::connect(&settings, &args.username)
        .await
        .context("failed to start chat session")?;
    println!("Logged in as {}", session.identity());
    println!("Commands: /dm <user>, /room <name>, /list, /quit");

    let mut client_events = BroadcastStream::new(session.subscribe_events());
    let state = session.state().clone();
    tokio::spawn(async move {
        while let Some(event) = client_events.next().await {
            match event {
                Ok(ClientEvent::TimelineUpdated { conversation }) => {
                    let guard = state.lock().await;
                    if guard.active_conversation() == Some(&conversation) {
                        render_timeline(&guard);
                    }
                }
                Ok(ClientEvent::PreviewUpdated {
                    conversation,
                    preview,
                }) if preview.unread > 0 => {
                    println!("[{conversation}] {} unread", preview.unread);
                }
                Ok(ClientEvent::PersistFailed { reason, .. }) => {
                    println!("! message not saved: {reason}");
                }
                Ok(ClientEvent::HistoryFailed {
                    conversation,
                    reason,
                }) => {
                    println!("! history for {conversation} unavailable: {reason}");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "desktop: event stream lagged"),
            }
        }
    });

    let mut connection_events = BroadcastStream::new(session.connection().subscribe());
    tokio::spawn(async move {
        while let Some(Ok(event)) = connection_events.next().await {
            match event {
                ConnectionEvent::StateChanged { to, .. } => println!("* connection {to:?}"),
                ConnectionEvent::ReconnectScheduled {
                    attempt, delay_ms, ..
                } => println!("* reconnect attempt {attempt} in {delay_ms}ms"),
                ConnectionEvent::ReconnectExhausted { .. } => {
                    println!("* reconnect gave up; restart to retry")
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut active: Option<Conversation> = None;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/list", _) => list_conversations(&session).await,
            ("/dm", peer) if !peer.trim().is_empty() => {
                let conversation = Conversation::direct(peer.trim());
                select(&session, conversation.clone()).await;
                active = Some(conversation);
            }
            ("/room", room) if !room.trim().is_empty() => {
                let conversation = Conversation::group(room.trim());
                select(&session, conversation.clone()).await;
                active = Some(conversation);
            }
            _ => {
                let Some(conversation) = active.as_ref() else {
                    println!("select a conversation first (/dm <user> or /room <name>)");
                    continue;
                };
                if let SendOutcome::Rejected(reason) =
                    session.controller().send_message(conversation, line).await
                {
                    println!("! not sent: {reason:?}");
                }
            }
        }
    }

    session.logout();
    Ok(())
}

async fn select(session: &Session, conversation: Conversation) {
    let outcome = session
        .controller()
        .select_conversation(conversation.clone())
        .await;
    println!("== {conversation} ({outcome:?})");
}

async fn list_conversations(session: &Session) {
    match session.controller().conversation_list().await {
        Ok(directory) => {
            for summary in directory.conversations {
                let last = summary.preview.last_text.unwrap_or_default();
                println!(
                    "{:<24} {:>3} unread  {last}",
                    summary.conversation.to_string(),
                    summary.preview.unread
                );
            }
            for request in directory.pending_requests {
                println!("pending friend request from {}", request.from_user);
            }
        }
        Err(err) => println!("! conversation list unavailable: {err:#}"),
    }
}

fn render_timeline(state: &ConversationState) {
    let today = Local::now().date_naive();
    for entry in state.store().entries(Local) {
        match entry {
            TimelineEntry::DaySeparator(date) => println!("--- {} ---", day_label(date, today)),
            TimelineEntry::Message(record) => {
                let marker = if record.persist_failed {
                    " (not saved)"
                } else if record.is_pending() {
                    " (sending)"
                } else {
                    ""
                };
                println!(
                    "{} {}: {}{marker}",
                    record.timestamp.with_timezone(&Local).format("%H:%M"),
                    record.sender,
                    record.text
                );
            }
        }
    }
}
