//! Outbound sends with human-like presence choreography.
//!
//! Every send announces presence, pauses, shows a composing indicator for a
//! random delay, clears it, and only then uploads and sends.

use std::ops::Range;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tracing::debug;

use wagate_core::protocol::{
    ChatPresence, ChatPresenceMedia, Jid, MediaCategory, OutboundContent, Presence, ProtocolClient,
    SendReceipt,
};

use crate::error::InstanceError;

/// Mime type voice notes are sent with, whatever the upload was tagged as.
pub const VOICE_NOTE_MIME: &str = "audio/ogg; codecs=opus";
const AUDIO_EXTENSIONS: [&str; 4] = [".ogg", ".mp3", ".m4a", ".opus"];
const INLINE_IMAGE_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];
const DEFAULT_DOCUMENT_NAME: &str = "file";

#[derive(Clone, Debug)]
pub struct MediaMessage {
    pub data: Bytes,
    pub mime_type: String,
    pub filename: Option<String>,
    pub caption: Option<String>,
    pub is_audio: bool,
}

/// Bounds of the composing delay in milliseconds; the upper bound is exclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingDelay {
    pub min_ms: u32,
    pub max_ms: u32,
}

impl TypingDelay {
    pub fn sample(&self) -> Duration {
        let range: Range<u32> = self.min_ms..self.max_ms;
        let ms = if range.is_empty() {
            self.min_ms
        } else {
            rand::thread_rng().gen_range(range)
        };
        Duration::from_millis(u64::from(ms))
    }
}

/// Strips a leading `+` and all whitespace, then addresses the number as a user.
pub fn recipient_jid(number: &str) -> Result<Jid, InstanceError> {
    let digits: String = number
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if digits.is_empty() {
        return Err(InstanceError::InvalidConfig("recipient number is empty".into()));
    }
    Ok(Jid::user(digits))
}

/// Audio if the request says so, the mime type is audio, or the file name has
/// a known audio extension.
pub fn looks_like_audio(kind: Option<&str>, mime_type: &str, filename: Option<&str>) -> bool {
    if kind.is_some_and(|k| k.eq_ignore_ascii_case("audio")) {
        return true;
    }
    if mime_type.to_ascii_lowercase().contains("audio") {
        return true;
    }
    filename.is_some_and(|name| {
        let lower = name.to_ascii_lowercase();
        AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    })
}

pub fn media_category(mime_type: &str, is_audio: bool) -> MediaCategory {
    if is_audio {
        return MediaCategory::Audio;
    }
    let base = mime_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    if INLINE_IMAGE_TYPES.contains(&base.as_str()) {
        MediaCategory::Image
    } else {
        MediaCategory::Document
    }
}

pub(crate) async fn send_text(
    client: &dyn ProtocolClient,
    to: &Jid,
    text: String,
    typing: TypingDelay,
    presence_pause: Duration,
) -> Result<SendReceipt, InstanceError> {
    simulate_typing(client, to, ChatPresenceMedia::Text, typing, presence_pause).await;
    client
        .send_message(to, OutboundContent::Text(text))
        .await
        .map_err(InstanceError::Delivery)
}

pub(crate) async fn send_media(
    client: &dyn ProtocolClient,
    to: &Jid,
    media: MediaMessage,
    typing: TypingDelay,
    presence_pause: Duration,
) -> Result<SendReceipt, InstanceError> {
    let flavour = if media.is_audio {
        ChatPresenceMedia::Audio
    } else {
        ChatPresenceMedia::Text
    };
    simulate_typing(client, to, flavour, typing, presence_pause).await;

    let category = media_category(&media.mime_type, media.is_audio);
    let uploaded = client
        .upload(media.data, category)
        .await
        .map_err(InstanceError::Delivery)?;

    let content = match category {
        MediaCategory::Audio => OutboundContent::Audio {
            media: uploaded,
            mime_type: VOICE_NOTE_MIME.to_string(),
            ptt: true,
        },
        MediaCategory::Image => OutboundContent::Image {
            media: uploaded,
            mime_type: media.mime_type,
            caption: media.caption,
        },
        MediaCategory::Document => OutboundContent::Document {
            media: uploaded,
            mime_type: media.mime_type,
            filename: media
                .filename
                .filter(|f| !f.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DOCUMENT_NAME.to_string()),
            caption: media.caption,
        },
    };

    client.send_message(to, content).await.map_err(InstanceError::Delivery)
}

/// Presence failures are cosmetic; they are logged and the send continues.
async fn simulate_typing(
    client: &dyn ProtocolClient,
    to: &Jid,
    flavour: ChatPresenceMedia,
    typing: TypingDelay,
    presence_pause: Duration,
) {
    if let Err(e) = client.send_presence(Presence::Available).await {
        debug!(error = %e, "presence update failed");
    }
    tokio::time::sleep(presence_pause).await;

    if let Err(e) = client.send_chat_presence(to, ChatPresence::Composing, flavour).await {
        debug!(error = %e, chat = %to, "composing indicator failed");
    }
    tokio::time::sleep(typing.sample()).await;

    if let Err(e) = client.send_chat_presence(to, ChatPresence::Paused, flavour).await {
        debug!(error = %e, chat = %to, "paused indicator failed");
    }
}
