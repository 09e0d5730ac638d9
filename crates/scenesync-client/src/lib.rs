//! # scenesync client
//!
//! Sync client runtime for collaborative scenes.
//!
//! ## Architecture
//!
//! A session runs on one task and multiplexes three inputs:
//! 1. **Commands**: `connect`, `pull`, `push`, `relay` from the host
//! 2. **Transport events**: socket open, back online, inbound frames
//! 3. **Resync deadline**: debounced full pull after a faulty batch
//!
//! The WebSocket transport runs its socket on a separate task with its own
//! reconnect policy. Local deltas are persisted in `SQLite` until the server
//! acknowledges them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod persistence;
pub mod session;
pub mod transport;

pub use client::{ClientError, SyncClient, SyncOptions};
pub use config::{ClientConfig, PersistenceConfig, ReconnectConfig};
pub use persistence::{SessionStore, SqliteRepository};
pub use session::{open_session, open_store, Command, SessionError, SyncHandle, SyncSession};
pub use transport::{
    ConnectionState, MockTransport, Transport, TransportConfig, TransportEvent, WebSocketTransport,
};
