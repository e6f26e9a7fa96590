//! Parley peer-to-peer chat protocol reference implementation.
//! No I/O: the host owns sockets and timers, passes events in and performs the returned effects.

pub mod call;
pub mod directory;
pub mod media;
pub mod protocol;
pub mod wire;

pub use call::{CallEffect, CallError, CallSession, CallStatus};
pub use directory::{OnlineSet, PeerDirectory, PeerEntry, PresenceDiff};
pub use media::{AudioQuality, FrameQueue, MediaKind, MediaQuality, Pacer, VideoQuality};
pub use protocol::{new_message_id, CallType, MessageType, UserId, WireMessage};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
