//! Envelope framing.
//!
//! Every frame on the socket is a JSON envelope
//! `{"type", "payload", "chunkInfo"?}`. Outbound payloads are serialized to a
//! string; if that string reaches the size limit it is cut into
//! `ceil(len / limit)` consecutive slices that share a chunk id. Slices are
//! cut on UTF-8 character boundaries so each one is valid text, and joining
//! them in position order restores the original payload exactly.
//!
//! Inbound frames go through a [`Reassembler`], which buffers chunk groups
//! until complete and decodes the result into a [`ServerMessage`].

use crate::messages::{ClientMessage, MessageError, MessageType, ServerMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// Default outbound size limit, in bytes of serialized payload.
pub const MAX_MESSAGE_SIZE: usize = 800_000;

/// Default lifetime of an incomplete inbound chunk group.
pub const DEFAULT_CHUNK_TTL: Duration = Duration::from_secs(60);

/// Default number of incomplete inbound chunk groups kept at once.
pub const DEFAULT_MAX_PENDING_GROUPS: usize = 64;

/// Default upper bound on the declared slice count of an inbound group.
pub const DEFAULT_MAX_CHUNK_COUNT: usize = 1024;

/// Position of a slice within a chunked payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    /// Shared by all slices of one payload
    pub id: String,
    /// Zero-based slice index
    pub position: usize,
    /// Total number of slices
    pub count: usize,
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Message type name
    #[serde(rename = "type")]
    pub message_type: String,
    /// Serialized payload, or one slice of it
    pub payload: String,
    /// Present only on chunked frames
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_info: Option<ChunkInfo>,
}

impl Envelope {
    /// Serialize the frame.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json(&self) -> Result<String, MessageError> {
        serde_json::to_string(self).map_err(|e| MessageError::Serialize(e.to_string()))
    }
}

/// Frame a client message, chunking when the payload reaches `max_message_size`.
///
/// # Errors
///
/// Returns error if the payload cannot be serialized.
pub fn frame_message(
    message: &ClientMessage,
    max_message_size: usize,
) -> Result<Vec<Envelope>, MessageError> {
    let payload = message.payload_json()?;
    Ok(split_payload(message.message_type(), &payload, max_message_size))
}

/// Split a serialized payload into envelopes.
///
/// A payload shorter than `max_message_size` yields one unchunked envelope.
/// Otherwise exactly `ceil(len / max_message_size)` chunks are produced.
///
/// Slice ends are moved back to the nearest character boundary, so a slice
/// may exceed `max_message_size` by up to three bytes, the tail of a
/// multi-byte character cut from the previous slice. A limit below the width
/// of a multi-byte character can leave some slices empty; the concatenation
/// is still exact.
#[must_use]
pub fn split_payload(
    message_type: MessageType,
    payload: &str,
    max_message_size: usize,
) -> Vec<Envelope> {
    let limit = max_message_size.max(1);

    if payload.len() < limit {
        return vec![Envelope {
            message_type: message_type.as_str().to_string(),
            payload: payload.to_string(),
            chunk_info: None,
        }];
    }

    let count = payload.len().div_ceil(limit);
    let chunk_id = uuid::Uuid::new_v4().simple().to_string();

    let mut envelopes = Vec::with_capacity(count);
    let mut start = 0;
    for position in 0..count {
        let end = if position + 1 == count {
            payload.len()
        } else {
            floor_char_boundary(payload, (position + 1) * limit).max(start)
        };

        envelopes.push(Envelope {
            message_type: message_type.as_str().to_string(),
            payload: payload[start..end].to_string(),
            chunk_info: Some(ChunkInfo {
                id: chunk_id.clone(),
                position,
                count,
            }),
        });
        start = end;
    }

    tracing::debug!(
        message_type = %message_type,
        chunk_id = %chunk_id,
        count,
        size = payload.len(),
        "Split payload into chunks"
    );

    envelopes
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut boundary = index;
    while !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    boundary
}

/// Frame as received; the payload may be a JSON string or inline JSON.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundFrame {
    #[serde(rename = "type")]
    message_type: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    chunk_info: Option<ChunkInfo>,
}

/// A reassembled logical message whose type has not been checked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    /// Message type name
    #[serde(rename = "type")]
    pub message_type: String,
    /// Decoded payload
    pub payload: serde_json::Value,
}

#[derive(Debug)]
struct PendingGroup {
    message_type: String,
    count: usize,
    parts: BTreeMap<usize, String>,
    started: Instant,
}

/// Buffers inbound chunk groups and decodes complete messages.
#[derive(Debug)]
pub struct Reassembler {
    groups: HashMap<String, PendingGroup>,
    ttl: Duration,
    max_groups: usize,
    max_count: usize,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_TTL, DEFAULT_MAX_PENDING_GROUPS)
    }
}

impl Reassembler {
    /// Create a reassembler with the given group lifetime and capacity.
    #[must_use]
    pub fn new(ttl: Duration, max_groups: usize) -> Self {
        Self {
            groups: HashMap::new(),
            ttl,
            max_groups: max_groups.max(1),
            max_count: DEFAULT_MAX_CHUNK_COUNT,
        }
    }

    /// Refuse groups declaring more than `max_count` slices.
    #[must_use]
    pub fn with_max_chunk_count(mut self, max_count: usize) -> Self {
        self.max_count = max_count.max(1);
        self
    }

    /// Number of incomplete chunk groups.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.groups.len()
    }

    /// Drop all incomplete chunk groups.
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    /// Accept one raw frame.
    ///
    /// Returns `Ok(None)` while a chunk group is still incomplete.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is malformed, its chunk metadata is
    /// inconsistent, or the decoded message is unknown or invalid.
    pub fn accept(&mut self, frame: &str) -> Result<Option<ServerMessage>, FrameError> {
        self.accept_at(frame, Instant::now())
    }

    /// Accept one raw frame as of `now`.
    ///
    /// # Errors
    ///
    /// See [`Reassembler::accept`].
    pub fn accept_at(
        &mut self,
        frame: &str,
        now: Instant,
    ) -> Result<Option<ServerMessage>, FrameError> {
        let Some(raw) = self.accept_raw_at(frame, now)? else {
            return Ok(None);
        };
        Ok(Some(ServerMessage::from_parts(&raw.message_type, raw.payload)?))
    }

    /// Accept one raw frame without interpreting the message type.
    ///
    /// # Errors
    ///
    /// Returns error if the frame is malformed or its chunk metadata is
    /// inconsistent.
    pub fn accept_raw_at(
        &mut self,
        frame: &str,
        now: Instant,
    ) -> Result<Option<RawMessage>, FrameError> {
        self.evict_expired(now);

        let inbound: InboundFrame =
            serde_json::from_str(frame).map_err(|e| FrameError::Malformed(e.to_string()))?;

        let Some(info) = inbound.chunk_info else {
            return Ok(Some(RawMessage {
                message_type: inbound.message_type,
                payload: decode_payload(inbound.payload)?,
            }));
        };

        let serde_json::Value::String(slice) = inbound.payload else {
            return Err(FrameError::Malformed(
                "chunk payload must be a string".to_string(),
            ));
        };

        let Some(joined) = self.push_chunk(inbound.message_type.clone(), slice, info, now)? else {
            return Ok(None);
        };

        let payload =
            serde_json::from_str(&joined).map_err(|e| FrameError::Malformed(e.to_string()))?;
        Ok(Some(RawMessage {
            message_type: inbound.message_type,
            payload,
        }))
    }

    fn push_chunk(
        &mut self,
        message_type: String,
        slice: String,
        info: ChunkInfo,
        now: Instant,
    ) -> Result<Option<String>, FrameError> {
        if info.count == 0 {
            return Err(FrameError::ZeroCount);
        }
        if info.count > self.max_count {
            return Err(FrameError::CountTooLarge {
                count: info.count,
                max: self.max_count,
            });
        }
        if info.position >= info.count {
            return Err(FrameError::PositionOutOfRange {
                position: info.position,
                count: info.count,
            });
        }

        if !self.groups.contains_key(&info.id) {
            if self.groups.len() >= self.max_groups {
                self.evict_oldest();
            }
            self.groups.insert(
                info.id.clone(),
                PendingGroup {
                    message_type: message_type.clone(),
                    count: info.count,
                    parts: BTreeMap::new(),
                    started: now,
                },
            );
        }

        let Some(group) = self.groups.get_mut(&info.id) else {
            return Ok(None);
        };

        if group.count != info.count {
            let expected = group.count;
            self.groups.remove(&info.id);
            return Err(FrameError::CountMismatch {
                expected,
                received: info.count,
            });
        }
        if group.message_type != message_type {
            let expected = group.message_type.clone();
            self.groups.remove(&info.id);
            return Err(FrameError::TypeMismatch {
                expected,
                received: message_type,
            });
        }

        if group.parts.contains_key(&info.position) {
            tracing::debug!(chunk_id = %info.id, position = info.position, "Duplicate chunk ignored");
            return Ok(None);
        }
        group.parts.insert(info.position, slice);

        if group.parts.len() < group.count {
            return Ok(None);
        }

        let Some(group) = self.groups.remove(&info.id) else {
            return Ok(None);
        };
        Ok(Some(group.parts.into_values().collect()))
    }

    fn evict_expired(&mut self, now: Instant) {
        let ttl = self.ttl;
        self.groups.retain(|id, group| {
            let alive = now.saturating_duration_since(group.started) < ttl;
            if !alive {
                tracing::warn!(chunk_id = %id, received = group.parts.len(), "Dropping expired chunk group");
            }
            alive
        });
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .groups
            .iter()
            .min_by_key(|(_, group)| group.started)
            .map(|(id, _)| id.clone());
        if let Some(id) = oldest {
            tracing::warn!(chunk_id = %id, "Dropping oldest chunk group at capacity");
            self.groups.remove(&id);
        }
    }
}

fn decode_payload(payload: serde_json::Value) -> Result<serde_json::Value, FrameError> {
    match payload {
        serde_json::Value::String(text) => {
            serde_json::from_str(&text).map_err(|e| FrameError::Malformed(e.to_string()))
        }
        other => Ok(other),
    }
}

/// Errors decoding inbound frames.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    /// Not a valid envelope, or the payload is not JSON
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Chunk group declared zero slices
    #[error("chunk count is zero")]
    ZeroCount,
    /// Declared slice count above the configured bound
    #[error("chunk count {count} exceeds limit {max}")]
    CountTooLarge {
        /// Declared count
        count: usize,
        /// Configured bound
        max: usize,
    },
    /// Slice position outside the declared count
    #[error("chunk position {position} out of range for count {count}")]
    PositionOutOfRange {
        /// Position received
        position: usize,
        /// Declared count
        count: usize,
    },
    /// Slices of one group disagree on the count
    #[error("chunk count changed from {expected} to {received}")]
    CountMismatch {
        /// Count from the first slice
        expected: usize,
        /// Count on this slice
        received: usize,
    },
    /// Slices of one group disagree on the message type
    #[error("chunk type changed from {expected} to {received}")]
    TypeMismatch {
        /// Type from the first slice
        expected: String,
        /// Type on this slice
        received: String,
    },
    /// Reassembled payload is not a valid server message
    #[error(transparent)]
    Message(#[from] MessageError),
}
