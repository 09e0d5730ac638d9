//! Transport abstraction for the sync client.
//!
//! A transport owns the connection to one room and hides reconnection,
//! reachability and framing from the client:
//! - `connect()` / `disconnect()` manage the connection lifecycle
//! - `send()` frames a logical message; nothing is buffered while the
//!   connection is not online
//! - inbound traffic and lifecycle changes arrive as [`TransportEvent`]s on
//!   the channel handed to the transport at construction
//!
//! Transports never surface network errors to the caller. Failures are
//! logged and handed to the reconnect policy.

mod mock;
mod websocket;

pub use mock::MockTransport;
pub use websocket::WebSocketTransport;

use crate::config::{ClientConfig, ReconnectConfig};
use scenesync_proto::ClientMessage;
use std::time::Duration;

/// Connection state as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection and no reconnection in progress
    Disconnected,
    /// Dialing or waiting to redial
    Connecting,
    /// Socket open and the host reports the network as reachable
    Online,
    /// Socket open but the host reports the network as unreachable
    Offline,
}

impl ConnectionState {
    /// Wire-independent name, used for logging.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Online => "online",
            ConnectionState::Offline => "offline",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle and traffic notifications from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A socket opened
    Open,
    /// The network became reachable again while the socket was open
    Online,
    /// A raw inbound frame
    Message(String),
    /// The socket closed; reconnection is up to the policy
    Closed,
}

/// Transport options.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Outbound payloads at or above this size are chunked
    pub max_message_size: usize,
    /// Minimum spacing between accepted connect calls
    pub connect_throttle: Duration,
    /// Reconnection policy
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for TransportConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            max_message_size: config.max_message_size,
            connect_throttle: config.connect_throttle,
            reconnect: config.reconnect.clone(),
        }
    }
}

/// A connection to one room.
pub trait Transport: Send {
    /// Start connecting; idempotent and throttled.
    fn connect(&mut self);

    /// Drop the connection; safe to call repeatedly.
    fn disconnect(&mut self);

    /// Frame and send a message, or drop it when not online.
    fn send(&mut self, message: &ClientMessage);

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}
