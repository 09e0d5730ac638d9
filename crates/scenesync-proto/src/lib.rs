//! # scenesync protocol
//!
//! Wire protocol between a scene client and its room server.
//!
//! ## Messages
//!
//! - `relay`: ephemeral element broadcast (client → server)
//! - `pull`: request acknowledged deltas since a version (client → server)
//! - `push`: submit one queued local delta (client → server)
//! - `relayed` / `acknowledged` / `rejected`: server → client
//!
//! ## Framing
//!
//! Frames are JSON envelopes `{"type", "payload", "chunkInfo"?}`; payloads at
//! or above the size limit are split into chunks.
//!
//! ## Rooms
//!
//! A room is reached at `{host}/connect?roomId={room_id}`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod framing;
pub mod messages;
pub mod room;

pub use framing::{
    frame_message, split_payload, ChunkInfo, Envelope, FrameError, RawMessage, Reassembler,
    MAX_MESSAGE_SIZE,
};
pub use messages::{
    Acknowledgement, ClientMessage, MessageError, MessageType, PullRequest, Rejection,
    ServerMessage,
};
pub use room::{AddressError, RoomAddress};
