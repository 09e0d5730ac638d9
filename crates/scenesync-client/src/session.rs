//! Session runtime.
//!
//! A [`SyncSession`] owns a [`SyncClient`] on one task and drives it from
//! three sources: host commands arriving through a [`SyncHandle`], transport
//! events, and the resync deadline. Each handler runs to completion before
//! the next source is polled.

use crate::client::{SyncClient, SyncOptions};
use crate::config::ClientConfig;
use crate::persistence::{SessionStore, SqliteRepository};
use crate::transport::{Transport, TransportConfig, TransportEvent, WebSocketTransport};
use anyhow::{Context, Result};
use scenesync_core::{
    Change, Delta, DeltasRepository, ErrorSink, MemoryRepository, MetadataRepository, Scene,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Host requests to a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Start connecting
    Connect,
    /// Drop the connection
    Disconnect,
    /// Pull from a version, or from the current one
    Pull(Option<u64>),
    /// Queue a delta (if any) and push the queue
    Push(Option<Delta>),
    /// Broadcast an ephemeral change
    Relay(Change),
    /// Disconnect and stop the session
    Dispose,
}

/// Cloneable, host-facing handle to a session.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl SyncHandle {
    fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed)
    }

    /// Start connecting.
    ///
    /// # Errors
    ///
    /// Returns error if the session has stopped.
    pub fn connect(&self) -> Result<(), SessionError> {
        self.send(Command::Connect)
    }

    /// Drop the connection.
    ///
    /// # Errors
    ///
    /// Returns error if the session has stopped.
    pub fn disconnect(&self) -> Result<(), SessionError> {
        self.send(Command::Disconnect)
    }

    /// Pull acknowledged deltas after `since`, or after the current version.
    ///
    /// # Errors
    ///
    /// Returns error if the session has stopped.
    pub fn pull(&self, since: Option<u64>) -> Result<(), SessionError> {
        self.send(Command::Pull(since))
    }

    /// Queue `delta` (if any) and push every queued delta.
    ///
    /// # Errors
    ///
    /// Returns error if the session has stopped.
    pub fn push(&self, delta: Option<Delta>) -> Result<(), SessionError> {
        self.send(Command::Push(delta))
    }

    /// Broadcast an ephemeral change.
    ///
    /// # Errors
    ///
    /// Returns error if the session has stopped.
    pub fn relay(&self, change: Change) -> Result<(), SessionError> {
        self.send(Command::Relay(change))
    }

    /// Disconnect and stop the session.
    ///
    /// # Errors
    ///
    /// Returns error if the session has already stopped.
    pub fn dispose(&self) -> Result<(), SessionError> {
        self.send(Command::Dispose)
    }

    /// Check if the session has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Errors talking to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// The session task is gone
    #[error("sync session is closed")]
    Closed,
}

/// Single-task driver for a [`SyncClient`].
#[derive(Debug)]
pub struct SyncSession<T, S, R> {
    client: SyncClient<T, S, R>,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl<T, S, R> SyncSession<T, S, R>
where
    T: Transport,
    S: Scene,
    R: DeltasRepository + MetadataRepository,
{
    /// Wrap `client`, whose transport reports on the sender paired with
    /// `events`.
    #[must_use]
    pub fn new(
        client: SyncClient<T, S, R>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> (Self, SyncHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                commands: rx,
                events,
            },
            SyncHandle { commands: tx },
        )
    }

    /// Run until disposed or every handle is dropped; returns the client.
    pub async fn run(mut self) -> SyncClient<T, S, R> {
        tracing::info!(room_id = %self.client.room_id(), "Sync session running");

        loop {
            let deadline = self.client.resync_deadline();

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Dispose) | None => break,
                        Some(command) => self.apply(command),
                    }
                }

                Some(event) = self.events.recv() => {
                    self.client.handle_event(event);
                }

                () = resync_due(deadline) => {
                    self.client.poll_resync(Instant::now());
                }
            }
        }

        self.client.disconnect();
        tracing::info!(room_id = %self.client.room_id(), "Sync session stopped");
        self.client
    }

    fn apply(&mut self, command: Command) {
        tracing::trace!(?command, "Session command");
        match command {
            Command::Connect => self.client.connect(),
            Command::Disconnect => self.client.disconnect(),
            Command::Pull(since) => self.client.pull(since),
            Command::Push(delta) => self.client.push(delta),
            Command::Relay(change) => self.client.relay(change),
            Command::Dispose => {}
        }
    }
}

async fn resync_due(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Open the configured store.
///
/// # Errors
///
/// Returns error if the `SQLite` database cannot be opened.
pub fn open_store(config: &ClientConfig) -> Result<SessionStore> {
    if config.persistence.store_type == "memory" {
        return Ok(SessionStore::Memory(MemoryRepository::new()));
    }

    let store = SqliteRepository::open(&config.persistence.db_path).with_context(|| {
        format!(
            "Failed to open SQLite database at {}",
            config.persistence.db_path.display()
        )
    })?;
    Ok(SessionStore::Sqlite(store))
}

/// A session over WebSocket with the configured store.
pub type WebSocketSession<S> = SyncSession<WebSocketTransport, S, SessionStore>;

/// Build a WebSocket session for the configured room.
///
/// # Errors
///
/// Returns error if the room address is invalid or the store cannot be
/// opened or read.
pub fn open_session<S: Scene>(
    config: &ClientConfig,
    scene: S,
    reachability: Option<watch::Receiver<bool>>,
    errors: Box<dyn ErrorSink>,
) -> Result<(WebSocketSession<S>, SyncHandle)> {
    let address = config.room_address().context("Invalid room address")?;
    let store = open_store(config)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut transport = WebSocketTransport::new(address, TransportConfig::from(config), events_tx);
    if let Some(reachability) = reachability {
        transport = transport.with_reachability(reachability);
    }

    let client = SyncClient::create(
        config.room_id.clone(),
        transport,
        scene,
        store,
        SyncOptions::from(config),
        errors,
    )
    .context("Failed to load sync state")?;

    Ok(SyncSession::new(client, events_rx))
}
