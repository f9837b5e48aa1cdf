use wagate_core::protocol::{InboundMessage, Jid, MessagePayload, ProtocolClient};
use wagate_core::{MessageKind, NormalizedMessage};

pub const IMAGE_PLACEHOLDER: &str = "[imagem]";
pub const AUDIO_PLACEHOLDER: &str = "[áudio]";
pub const DOCUMENT_PLACEHOLDER: &str = "[documento]";

/// Phone number of the sender. Hidden-identity senders are mapped through the
/// client; when no mapping is known the raw user part is used.
pub fn resolve_sender(sender: &Jid, client: Option<&dyn ProtocolClient>) -> String {
    if sender.is_hidden() {
        if let Some(phone) = client.and_then(|c| c.resolve_phone(sender)) {
            return phone.without_device().user;
        }
    }
    sender.without_device().user
}

/// Classify an inbound message into the consumer record. Audio records carry
/// no transcription yet; the caller fills it in.
pub fn normalize(msg: &InboundMessage, sender_number: String) -> NormalizedMessage {
    let (kind, message) = match &msg.payload {
        MessagePayload::Conversation(text) | MessagePayload::ExtendedText(text) => {
            (MessageKind::Text, text.clone())
        }
        MessagePayload::Image { caption, .. } => (
            MessageKind::Image,
            non_empty(caption.as_deref()).unwrap_or(IMAGE_PLACEHOLDER).to_string(),
        ),
        MessagePayload::Audio { .. } => (MessageKind::Audio, AUDIO_PLACEHOLDER.to_string()),
        MessagePayload::Document { filename, caption, .. } => (
            MessageKind::Document,
            non_empty(caption.as_deref())
                .or_else(|| non_empty(filename.as_deref()))
                .unwrap_or(DOCUMENT_PLACEHOLDER)
                .to_string(),
        ),
        MessagePayload::Other => (MessageKind::Unknown, String::new()),
    };

    NormalizedMessage {
        remote_jid: msg.chat.user.clone(),
        sender_number,
        push_name: msg.push_name.clone(),
        is_group: msg.chat.is_group(),
        timestamp: msg.timestamp,
        message_id: msg.id.clone(),
        kind,
        message,
        transcription: None,
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wagate_core::protocol::{MediaRef, GROUP_SERVER, HIDDEN_SERVER};

    use crate::sandbox::SandboxClient;

    fn inbound(payload: MessagePayload) -> InboundMessage {
        InboundMessage {
            id: "3EB0C0FFEE".into(),
            chat: Jid::user("5511988887777"),
            sender: Jid::user("5511988887777"),
            push_name: "Bia".into(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 8, 15, 0).unwrap(),
            is_from_me: false,
            payload,
        }
    }

    fn media() -> MediaRef {
        MediaRef {
            direct_path: "/v/t62/abc".into(),
            mime_type: "image/jpeg".into(),
            file_length: 1024,
        }
    }

    #[test]
    fn conversation_is_text() {
        let rec = normalize(&inbound(MessagePayload::Conversation("olá".into())), "5511988887777".into());
        assert_eq!(rec.kind, MessageKind::Text);
        assert_eq!(rec.message, "olá");
        assert_eq!(rec.remote_jid, "5511988887777");
        assert_eq!(rec.message_id, "3EB0C0FFEE");
        assert!(!rec.is_group);
        assert!(rec.transcription.is_none());
    }

    #[test]
    fn extended_text_is_text() {
        let rec = normalize(&inbound(MessagePayload::ExtendedText("link https://x.y".into())), "1".into());
        assert_eq!(rec.kind, MessageKind::Text);
        assert_eq!(rec.message, "link https://x.y");
    }

    #[test]
    fn image_uses_caption_or_placeholder() {
        let with_caption = MessagePayload::Image {
            caption: Some("receipt".into()),
            media: media(),
        };
        assert_eq!(normalize(&inbound(with_caption), "1".into()).message, "receipt");

        let blank = MessagePayload::Image {
            caption: Some("  ".into()),
            media: media(),
        };
        let rec = normalize(&inbound(blank), "1".into());
        assert_eq!(rec.kind, MessageKind::Image);
        assert_eq!(rec.message, IMAGE_PLACEHOLDER);
    }

    #[test]
    fn audio_gets_placeholder() {
        let rec = normalize(&inbound(MessagePayload::Audio { media: media() }), "1".into());
        assert_eq!(rec.kind, MessageKind::Audio);
        assert_eq!(rec.message, AUDIO_PLACEHOLDER);
    }

    #[test]
    fn document_prefers_caption_then_filename() {
        let doc = |caption: Option<&str>, filename: Option<&str>| MessagePayload::Document {
            caption: caption.map(String::from),
            filename: filename.map(String::from),
            media: media(),
        };
        assert_eq!(normalize(&inbound(doc(Some("see"), Some("a.pdf"))), "1".into()).message, "see");
        assert_eq!(normalize(&inbound(doc(None, Some("a.pdf"))), "1".into()).message, "a.pdf");
        assert_eq!(normalize(&inbound(doc(None, None)), "1".into()).message, DOCUMENT_PLACEHOLDER);
    }

    #[test]
    fn unknown_payload_is_empty() {
        let rec = normalize(&inbound(MessagePayload::Other), "1".into());
        assert_eq!(rec.kind, MessageKind::Unknown);
        assert_eq!(rec.message, "");
    }

    #[test]
    fn group_chat_flagged() {
        let mut msg = inbound(MessagePayload::Conversation("hi".into()));
        msg.chat = Jid::new("120363025", GROUP_SERVER);
        let rec = normalize(&msg, "5511".into());
        assert!(rec.is_group);
        assert_eq!(rec.remote_jid, "120363025");
    }

    #[test]
    fn sender_device_suffix_stripped() {
        let sender = Jid::new("5511977776666:4", "s.whatsapp.net");
        assert_eq!(resolve_sender(&sender, None), "5511977776666");
    }

    #[test]
    fn hidden_sender_resolved_through_client() {
        let client = SandboxClient::new(None);
        client.map_hidden("88776655", "5511955554444");
        let hidden = Jid::new("88776655", HIDDEN_SERVER);
        assert_eq!(resolve_sender(&hidden, Some(&*client as &dyn ProtocolClient)), "5511955554444");
    }

    #[test]
    fn unresolved_hidden_sender_falls_back_to_user() {
        let client = SandboxClient::new(None);
        let hidden = Jid::new("88776655", HIDDEN_SERVER);
        assert_eq!(resolve_sender(&hidden, Some(&*client as &dyn ProtocolClient)), "88776655");
    }
}
