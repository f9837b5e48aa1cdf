use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Events published to an instance's subscribers.
///
/// Serialized as `{"event": <kind>, "data": {...}}`, which is also the record
/// shape SSE consumers receive.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InstanceEvent {
    /// A fresh pairing code; only emitted while the instance has no linked identity.
    Qr { qrcode: String },

    Connected { phone: String },

    Disconnected {},

    Message(NormalizedMessage),
}

impl InstanceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Connected { .. } => "connected",
            Self::Disconnected {} => "disconnected",
            Self::Message(_) => "message",
        }
    }

    pub fn as_message(&self) -> Option<&NormalizedMessage> {
        match self {
            Self::Message(msg) => Some(msg),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Document,
    Unknown,
}

/// Inbound message after classification, in the field layout consumers expect.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMessage {
    /// User part of the chat address (a phone number or a group id).
    pub remote_jid: String,
    pub sender_number: String,
    #[serde(rename = "pushName")]
    pub push_name: String,
    pub is_group: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub message: String,
    /// Present only for audio; empty when transcription was attempted and failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription: Option<String>,
}
