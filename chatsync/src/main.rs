//! `chatsync`: headless chat synchronization client.
//!
//! Connects the configured channels and REST API, loads the conversation
//! list, and reads commands from stdin. Plain lines are sent as messages
//! to the open conversation; lines starting with `/` are commands:
//!
//! ```text
//! /open <conversation-id>   open a conversation
//! /close                    close it
//! /older                    load older messages
//! /retry                    retry a failed history load
//! /typing on|off            report typing state
//! /reconnect <channel>      retry a channel that gave up (admin, shop, ai)
//! /quit                     exit (so does EOF)
//! ```
//!
//! ```bash
//! cargo run --bin chatsync -- --user-id agent-7 \
//!     --admin-url wss://chat.example.com/admin \
//!     --api-url https://api.example.com/v1 --conversation c1
//! ```

use std::io;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use chatsync::api::ChatApi;
use chatsync::api::http::HttpChatApi;
use chatsync::api::memory::InMemoryApi;
use chatsync::chat::EngineEvent;
use chatsync::config::{CliArgs, ClientConfig, EngineConfig};
use chatsync::engine::{EngineCommand, spawn_engine};
use chatsync::transport::ws::WsConnector;
use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::message::ConversationId;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();
    let config = ClientConfig::load(&cli).map_err(io::Error::other)?;
    let _guard = init_logging(&cli.log_level, cli.log_file.as_deref());

    let Some(engine_config) = config.to_engine_config() else {
        return Err(io::Error::other(
            "no user id configured (use --user-id or CHATSYNC_USER)",
        ));
    };
    let initial = cli.conversation.map(ConversationId::new);

    match &config.api_base_url {
        Some(base) => {
            let api = HttpChatApi::new(base, config.api_token.clone()).map_err(io::Error::other)?;
            run(&config, engine_config, api, initial).await
        }
        None => {
            tracing::warn!("no API base URL configured, running without history");
            run(&config, engine_config, InMemoryApi::new(), initial).await
        }
    }
}

/// Initialize the `tracing` subscriber.
///
/// Logs go to stderr, or to `file_path` through a non-blocking writer
/// whose guard must be held until exit.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_env("CHATSYNC_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name()?.to_str()?;
    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Drive the engine from stdin until EOF or `/quit`.
async fn run<A: ChatApi>(
    config: &ClientConfig,
    engine_config: EngineConfig,
    api: A,
    initial: Option<ConversationId>,
) -> io::Result<()> {
    let connector = WsConnector::new(config.channel_urls(), config.connect_timeout);
    let mut handle = spawn_engine(engine_config, connector, api);
    let stopped = |_| io::Error::other("engine stopped unexpectedly");

    handle
        .send(EngineCommand::LoadConversations)
        .await
        .map_err(stopped)?;
    let mut pending_open = initial;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_line(&line) {
                    Some(Input::Quit) => break,
                    Some(Input::Command(command)) => handle.send(command).await.map_err(stopped)?,
                    None => {}
                }
            }
            event = handle.next_event() => {
                let Some(event) = event else {
                    break;
                };
                if event == EngineEvent::ConversationsChanged
                    && let Some(id) = pending_open.take()
                {
                    handle
                        .send(EngineCommand::SelectConversation(id))
                        .await
                        .map_err(stopped)?;
                }
                log_event(&event);
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Notification(text) => tracing::warn!(%text, "notification"),
        EngineEvent::Disconnected { channel, attempts } => {
            tracing::error!(channel = %channel, attempts, "channel disconnected");
        }
        EngineEvent::HistoryFetchFailed {
            conversation_id,
            reason,
        } => tracing::warn!(conversation = %conversation_id, %reason, "history unavailable"),
        other => tracing::info!(event = ?other, "engine event"),
    }
}

/// A parsed stdin line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Command(EngineCommand),
    Quit,
}

fn parse_line(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Some(Input::Command(EngineCommand::SendMessage {
            text: line.to_string(),
            attachments: Vec::new(),
        }));
    };

    let (verb, arg) = rest
        .split_once(char::is_whitespace)
        .map_or((rest, ""), |(v, a)| (v, a.trim()));
    let command = match (verb, arg) {
        ("quit", _) => return Some(Input::Quit),
        ("open", id) if !id.is_empty() => EngineCommand::SelectConversation(ConversationId::new(id)),
        ("close", _) => EngineCommand::CloseConversation,
        ("older", _) => EngineCommand::LoadOlderMessages,
        ("retry", _) => EngineCommand::RetryHistory,
        ("typing", "on") => EngineCommand::SetLocalTyping(true),
        ("typing", "off") => EngineCommand::SetLocalTyping(false),
        ("reconnect", tag) => match tag.parse::<ChannelKey>() {
            Ok(channel) => EngineCommand::Reconnect(channel),
            Err(e) => {
                tracing::warn!(error = %e, "bad reconnect target");
                return None;
            }
        },
        _ => {
            tracing::warn!(%line, "unknown command");
            return None;
        }
    };
    Some(Input::Command(command))
}
