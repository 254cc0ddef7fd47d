//! Engine runtime: one task that owns the [`SyncEngine`].
//!
//! ```text
//! UI ── EngineCommand ──▶ ┌────────────┐ ◀── Inbound ── socket pumps, REST calls,
//!                         │ SyncEngine │                typing timers, reconnects
//! UI ◀── EngineEvent ──── └────────────┘
//! ```
//!
//! Commands and inbound items are serialized through one `select!` loop,
//! so every mutation runs to completion before the next input.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use chatsync_proto::conversation::ChannelKey;
use chatsync_proto::message::{Attachment, ConversationId};

use crate::api::ChatApi;
use crate::chat::{EngineError, EngineEvent, Inbound, SyncEngine};
use crate::config::EngineConfig;
use crate::transport::Connector;

/// Commands from the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Fetch the conversation list.
    LoadConversations,
    /// Open a conversation.
    SelectConversation(ConversationId),
    /// Close the open conversation.
    CloseConversation,
    /// Fetch the page before the oldest loaded message.
    LoadOlderMessages,
    /// Retry a failed history load.
    RetryHistory,
    /// Send a message to the open conversation.
    SendMessage {
        /// Text body.
        text: String,
        /// Attached files.
        attachments: Vec<Attachment>,
    },
    /// Report whether the local user is typing.
    SetLocalTyping(bool),
    /// Retry a channel whose reconnection gave up.
    Reconnect(ChannelKey),
    /// Stop the engine.
    Shutdown,
}

/// The engine task has stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("engine has stopped")]
pub struct EngineStopped;

/// Handle to a running engine.
#[derive(Debug)]
pub struct EngineHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: mpsc::Receiver<EngineEvent>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Queue a command.
    ///
    /// # Errors
    ///
    /// Returns [`EngineStopped`] if the engine task has exited.
    pub async fn send(&self, command: EngineCommand) -> Result<(), EngineStopped> {
        self.commands.send(command).await.map_err(|_| EngineStopped)
    }

    /// A sender for issuing commands from elsewhere.
    #[must_use]
    pub fn commands(&self) -> mpsc::Sender<EngineCommand> {
        self.commands.clone()
    }

    /// Wait for the next UI event. `None` once the engine has stopped.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        self.events.recv().await
    }

    /// Take an event if one is ready.
    pub fn try_next_event(&mut self) -> Option<EngineEvent> {
        self.events.try_recv().ok()
    }

    /// Ask the engine to stop and wait for it.
    pub async fn shutdown(self) {
        if self.commands.send(EngineCommand::Shutdown).await.is_err() {
            tracing::debug!("engine already stopped");
        }
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "engine task ended abnormally");
        }
    }
}

/// Spawn the engine task.
///
/// Nothing is dialed or fetched until the first command.
#[must_use]
pub fn spawn_engine<C, A>(config: EngineConfig, connector: C, api: A) -> EngineHandle
where
    C: Connector,
    A: ChatApi,
{
    let capacity = config.channel_capacity;
    let (engine, inbound, events) = SyncEngine::new(config, connector, api);
    let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
    let task = tokio::spawn(run(engine, inbound, cmd_rx));
    EngineHandle {
        commands: cmd_tx,
        events,
        task,
    }
}

async fn run<C: Connector, A: ChatApi>(
    mut engine: SyncEngine<C, A>,
    mut inbound: mpsc::UnboundedReceiver<Inbound<C::Transport>>,
    mut commands: mpsc::Receiver<EngineCommand>,
) {
    tracing::info!("engine started");
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(EngineCommand::Shutdown) | None => break,
                Some(command) => execute(&mut engine, command).await,
            },
            Some(item) = inbound.recv() => {
                let outcome = engine.handle_inbound(item).await;
                tracing::trace!(?outcome, "inbound handled");
            }
        }
    }

    engine.close_conversation().await;
    tracing::info!("engine stopped");
}

async fn execute<C: Connector, A: ChatApi>(engine: &mut SyncEngine<C, A>, command: EngineCommand) {
    tracing::debug!(?command, "engine command");
    let result = match command {
        EngineCommand::LoadConversations => {
            engine.load_conversations();
            Ok(())
        }
        EngineCommand::SelectConversation(id) => engine.select_conversation(&id).await,
        EngineCommand::CloseConversation => {
            engine.close_conversation().await;
            Ok(())
        }
        EngineCommand::LoadOlderMessages => engine.load_older_messages().map(drop),
        EngineCommand::RetryHistory => engine.retry_history().map(drop),
        EngineCommand::SendMessage { text, attachments } => {
            match engine.send_message(&text, attachments).await {
                // Already surfaced as a notification.
                Err(EngineError::TransportUnavailable(_)) => Ok(()),
                other => other,
            }
        }
        EngineCommand::SetLocalTyping(is_typing) => engine.set_local_typing(is_typing).await,
        EngineCommand::Reconnect(channel) => {
            engine.reconnect(channel);
            Ok(())
        }
        EngineCommand::Shutdown => Ok(()),
    };
    if let Err(e) = result {
        tracing::warn!(error = %e, "engine command failed");
        engine.notify(&e);
    }
}
