//! Seam to the messaging wire protocol.
//!
//! The gateway never speaks the protocol itself. Each instance opens one
//! [`ProtocolClient`] through a [`ProtocolConnector`], registers a single
//! [`ProtocolEventHandler`], and drives presence, uploads and sends through
//! the client. Pairing codes arrive on a channel handed out before connect.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::ids::InstanceId;

pub const USER_SERVER: &str = "s.whatsapp.net";
pub const GROUP_SERVER: &str = "g.us";
/// Server used for hidden-identity addresses that must be mapped to a phone.
pub const HIDDEN_SERVER: &str = "lid";

/// A protocol address, `user@server`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Jid {
    pub user: String,
    pub server: String,
}

impl Jid {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            server: server.into(),
        }
    }

    /// Address of a regular user account.
    pub fn user(number: impl Into<String>) -> Self {
        Self::new(number, USER_SERVER)
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }

    pub fn is_hidden(&self) -> bool {
        self.server == HIDDEN_SERVER
    }

    /// Drops the agent/device suffix (`user:3@server` -> `user@server`).
    pub fn without_device(&self) -> Self {
        let user = match self.user.split_once(':') {
            Some((user, _device)) => user,
            None => &self.user,
        };
        Self::new(user, self.server.clone())
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user, self.server)
    }
}

impl FromStr for Jid {
    type Err = ProtocolError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((user, server)) if !server.is_empty() => Ok(Self::new(user, server)),
            _ => Err(ProtocolError::InvalidAddress(s.to_owned())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Available,
    Unavailable,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatPresence {
    Composing,
    Paused,
}

/// Flavour of a composing indicator: typing text or recording audio.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChatPresenceMedia {
    Text,
    Audio,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    Image,
    Audio,
    Document,
}

/// Reference to remote media carried by an inbound message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaRef {
    pub direct_path: String,
    pub mime_type: String,
    pub file_length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadedMedia {
    pub url: String,
    pub direct_path: String,
    pub file_length: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OutboundContent {
    Text(String),
    Image {
        media: UploadedMedia,
        mime_type: String,
        caption: Option<String>,
    },
    Audio {
        media: UploadedMedia,
        mime_type: String,
        /// Push-to-talk: rendered as a voice note rather than an audio file.
        ptt: bool,
    },
    Document {
        media: UploadedMedia,
        mime_type: String,
        filename: String,
        caption: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MessagePayload {
    Conversation(String),
    ExtendedText(String),
    Image {
        caption: Option<String>,
        media: MediaRef,
    },
    Audio {
        media: MediaRef,
    },
    Document {
        filename: Option<String>,
        caption: Option<String>,
        media: MediaRef,
    },
    Other,
}

#[derive(Clone, Debug, PartialEq)]
pub struct InboundMessage {
    pub id: String,
    pub chat: Jid,
    pub sender: Jid,
    pub push_name: String,
    pub timestamp: DateTime<Utc>,
    pub is_from_me: bool,
    pub payload: MessagePayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolEvent {
    Connected,
    Disconnected,
    Message(InboundMessage),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingEvent {
    Code(String),
    Success,
    Timeout,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("client is not connected")]
    NotConnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("upload failed: {0}")]
    Upload(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("identity store error: {0}")]
    Identity(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

/// Receives every event a client produces. Called on the client's own task,
/// so implementations must return quickly and hand slow work to a spawned task.
pub trait ProtocolEventHandler: Send + Sync {
    fn on_event(&self, event: ProtocolEvent);
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> Result<(), ProtocolError>;

    /// Idempotent. Never fails; a dead socket is simply dropped.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Identity persisted by a previous pairing, if any.
    fn linked_identity(&self) -> Option<Jid>;

    /// Replaces any previously registered handler.
    fn set_event_handler(&self, handler: Arc<dyn ProtocolEventHandler>);

    /// Pairing code stream. Must be taken before `connect`; `None` once taken.
    fn pairing_codes(&self) -> Option<mpsc::Receiver<PairingEvent>>;

    async fn send_presence(&self, presence: Presence) -> Result<(), ProtocolError>;

    async fn send_chat_presence(
        &self,
        chat: &Jid,
        state: ChatPresence,
        media: ChatPresenceMedia,
    ) -> Result<(), ProtocolError>;

    async fn upload(&self, data: Bytes, category: MediaCategory) -> Result<UploadedMedia, ProtocolError>;

    async fn send_message(&self, to: &Jid, content: OutboundContent) -> Result<SendReceipt, ProtocolError>;

    async fn download(&self, media: &MediaRef) -> Result<Bytes, ProtocolError>;

    /// Maps a hidden-identity address to the phone-number address it stands for.
    fn resolve_phone(&self, hidden: &Jid) -> Option<Jid>;
}

/// Opens protocol clients bound to an instance's persisted identity.
#[async_trait]
pub trait ProtocolConnector: Send + Sync {
    async fn open(&self, instance: &InstanceId) -> Result<Arc<dyn ProtocolClient>, ProtocolError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jid_parses_user_and_server() {
        let jid: Jid = "5511999999999@s.whatsapp.net".parse().unwrap();
        assert_eq!(jid, Jid::user("5511999999999"));
        assert_eq!(jid.to_string(), "5511999999999@s.whatsapp.net");
    }

    #[test]
    fn jid_without_server_is_rejected() {
        assert!(matches!(
            "5511999999999".parse::<Jid>(),
            Err(ProtocolError::InvalidAddress(_))
        ));
        assert!("abc@".parse::<Jid>().is_err());
    }

    #[test]
    fn group_and_hidden_servers() {
        assert!(Jid::new("120363", GROUP_SERVER).is_group());
        assert!(Jid::new("99887766", HIDDEN_SERVER).is_hidden());
        assert!(!Jid::user("1").is_group());
    }

    #[test]
    fn device_suffix_is_dropped() {
        let jid = Jid::new("5511999999999:12", USER_SERVER);
        assert_eq!(jid.without_device(), Jid::user("5511999999999"));
        assert_eq!(Jid::user("42").without_device(), Jid::user("42"));
    }
}
