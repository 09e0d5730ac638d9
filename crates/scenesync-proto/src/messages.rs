//! Logical protocol messages.
//!
//! Both directions are closed, tagged enums serialized as
//! `{"type": ..., "payload": ...}`, so every message kind is handled
//! exhaustively.

use scenesync_core::{AcknowledgedDelta, Change, Delta, DeltaId};
use serde::{Deserialize, Serialize};

/// Message kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Client → server: ephemeral change broadcast
    Relay,
    /// Client → server: request acknowledged deltas since a version
    Pull,
    /// Client → server: submit a local delta
    Push,
    /// Server → client: someone else's ephemeral change
    Relayed,
    /// Server → client: a batch of versioned deltas
    Acknowledged,
    /// Server → client: refused deltas
    Rejected,
}

impl MessageType {
    /// Wire name of the message type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Relay => "relay",
            MessageType::Pull => "pull",
            MessageType::Push => "push",
            MessageType::Relayed => "relayed",
            MessageType::Acknowledged => "acknowledged",
            MessageType::Rejected => "rejected",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "relay" => Some(MessageType::Relay),
            "pull" => Some(MessageType::Pull),
            "push" => Some(MessageType::Push),
            "relayed" => Some(MessageType::Relayed),
            "acknowledged" => Some(MessageType::Acknowledged),
            "rejected" => Some(MessageType::Rejected),
            _ => None,
        }
    }

    /// Check if the server sends this type.
    #[must_use]
    pub fn is_inbound(&self) -> bool {
        matches!(
            self,
            MessageType::Relayed | MessageType::Acknowledged | MessageType::Rejected
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pull request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    /// Return deltas with a version strictly greater than this
    pub last_acknowledged_version: u64,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Ephemeral broadcast, not queued
    Relay(Change),
    /// Ask for acknowledged history
    Pull(PullRequest),
    /// Submit a queued delta
    Push(Delta),
}

impl ClientMessage {
    /// Build a pull request.
    #[must_use]
    pub fn pull(last_acknowledged_version: u64) -> Self {
        ClientMessage::Pull(PullRequest {
            last_acknowledged_version,
        })
    }

    /// The message kind.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Relay(_) => MessageType::Relay,
            ClientMessage::Pull(_) => MessageType::Pull,
            ClientMessage::Push(_) => MessageType::Push,
        }
    }

    /// Serialize only the payload, as carried inside an envelope.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn payload_json(&self) -> Result<String, MessageError> {
        let encoded = match self {
            ClientMessage::Relay(change) => serde_json::to_string(change),
            ClientMessage::Pull(request) => serde_json::to_string(request),
            ClientMessage::Push(delta) => serde_json::to_string(delta),
        };
        encoded.map_err(|e| MessageError::Serialize(e.to_string()))
    }

    /// Rebuild a client message from a type name and a decoded payload.
    ///
    /// # Errors
    ///
    /// Returns error if the type is not a client type or the payload does
    /// not match it.
    pub fn from_parts(message_type: &str, payload: serde_json::Value) -> Result<Self, MessageError> {
        match MessageType::parse(message_type) {
            Some(kind) if !kind.is_inbound() => {}
            _ => return Err(MessageError::UnknownType(message_type.to_string())),
        }
        decode_tagged(message_type, payload)
    }
}

/// Acknowledgement payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    /// Committed deltas with their versions
    pub deltas: Vec<AcknowledgedDelta>,
}

/// Rejection payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    /// Refused delta ids
    pub ids: Vec<DeltaId>,
    /// Reason given by the server
    pub message: String,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Another client's ephemeral change
    Relayed(Change),
    /// Versioned deltas
    Acknowledged(Acknowledgement),
    /// Refused deltas
    Rejected(Rejection),
}

impl ServerMessage {
    /// The message kind.
    #[must_use]
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Relayed(_) => MessageType::Relayed,
            ServerMessage::Acknowledged(_) => MessageType::Acknowledged,
            ServerMessage::Rejected(_) => MessageType::Rejected,
        }
    }

    /// Rebuild a server message from a type name and a decoded payload.
    ///
    /// # Errors
    ///
    /// Returns error if the type is unknown or the payload does not match it.
    pub fn from_parts(message_type: &str, payload: serde_json::Value) -> Result<Self, MessageError> {
        match MessageType::parse(message_type) {
            Some(kind) if kind.is_inbound() => {}
            _ => return Err(MessageError::UnknownType(message_type.to_string())),
        }
        decode_tagged(message_type, payload)
    }
}

fn decode_tagged<T: serde::de::DeserializeOwned>(
    message_type: &str,
    payload: serde_json::Value,
) -> Result<T, MessageError> {
    let tagged = serde_json::json!({ "type": message_type, "payload": payload });
    serde_json::from_value(tagged).map_err(|e| MessageError::Deserialize(e.to_string()))
}

/// Errors for message serialization/deserialization.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MessageError {
    /// Serialization failed
    #[error("serialization failed: {0}")]
    Serialize(String),
    /// Deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialize(String),
    /// The type tag is not valid in this direction
    #[error("unknown message type: {0}")]
    UnknownType(String),
}
