//! Parley wire protocol: the typed envelope exchanged between peers.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable user identifier assigned by the directory service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for UserId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Message kinds. Stream kinds go straight to the media pipeline; everything else fans out to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    TextMessage,
    FileTransfer,
    TypingIndicator,
    ReadReceipt,
    CallOffer,
    CallAnswer,
    CallReject,
    CallEnd,
    AudioStream,
    VideoStream,
}

impl MessageType {
    pub fn is_stream(self) -> bool {
        matches!(self, MessageType::AudioStream | MessageType::VideoStream)
    }

    pub fn is_call_signal(self) -> bool {
        matches!(
            self,
            MessageType::CallOffer
                | MessageType::CallAnswer
                | MessageType::CallReject
                | MessageType::CallEnd
        )
    }
}

/// Kind of call. Carried by name in the content of CALL_OFFER.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallType {
    Audio,
    Video,
}

impl CallType {
    pub fn as_str(self) -> &'static str {
        match self {
            CallType::Audio => "AUDIO",
            CallType::Video => "VIDEO",
        }
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = UnknownCallType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AUDIO" => Ok(CallType::Audio),
            "VIDEO" => Ok(CallType::Video),
            _ => Err(UnknownCallType(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown call type: {0}")]
pub struct UnknownCallType(pub String);

/// One peer-to-peer message. Exactly one is carried per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageType,
    /// Opaque unique id. Call signals reuse the call id here.
    pub message_id: String,
    pub sender_id: Option<UserId>,
    pub receiver_id: Option<UserId>,
    /// Text payload; meaning depends on `kind` ("true"/"false" for typing, call type for offers).
    pub content: Option<String>,
    pub file_name: Option<String>,
    /// File bytes or one encoded media frame.
    pub payload: Vec<u8>,
    /// Overwritten by the receiving server with the socket's peer address.
    pub source_ip: Option<IpAddr>,
    /// Sender's own listening port. 0 = unknown, look the peer up in the directory service.
    pub source_port: u16,
    pub timestamp: DateTime<Utc>,
}

impl WireMessage {
    /// New message with a fresh random id and the current time.
    pub fn new(kind: MessageType, sender_id: Option<UserId>, receiver_id: Option<UserId>) -> Self {
        Self {
            kind,
            message_id: new_message_id(),
            sender_id,
            receiver_id,
            content: None,
            file_name: None,
            payload: Vec::new(),
            source_ip: None,
            source_port: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = message_id.into();
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    /// Typing indicator state ("true"/"false" content). None if content is missing or not a bool.
    pub fn typing_state(&self) -> Option<bool> {
        self.content.as_deref()?.trim().parse().ok()
    }
}

/// Random UUID v4 string for message and call ids.
pub fn new_message_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_kinds() {
        assert!(MessageType::AudioStream.is_stream());
        assert!(MessageType::VideoStream.is_stream());
        assert!(!MessageType::TextMessage.is_stream());
        assert!(!MessageType::CallOffer.is_stream());
    }

    #[test]
    fn call_type_names() {
        assert_eq!(CallType::Video.to_string(), "VIDEO");
        assert_eq!("AUDIO".parse::<CallType>().unwrap(), CallType::Audio);
        assert_eq!("video".parse::<CallType>().unwrap(), CallType::Video);
        assert!("HOLOGRAM".parse::<CallType>().is_err());
    }

    #[test]
    fn new_message_defaults() {
        let a = WireMessage::new(MessageType::TextMessage, Some(UserId(1)), Some(UserId(2)));
        let b = WireMessage::new(MessageType::TextMessage, Some(UserId(1)), Some(UserId(2)));
        assert_ne!(a.message_id, b.message_id);
        assert_eq!(a.source_port, 0);
        assert!(a.source_ip.is_none());
        assert!(a.payload.is_empty());
    }

    #[test]
    fn typing_state_parses_bool_content() {
        let msg = WireMessage::new(MessageType::TypingIndicator, None, None).with_content("true");
        assert_eq!(msg.typing_state(), Some(true));
        let msg = msg.with_content("nope");
        assert_eq!(msg.typing_state(), None);
    }
}
