use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum TranscriptionError {
    #[error("audio conversion failed: {0}")]
    Conversion(String),

    #[error("transcription request failed: {0}")]
    Request(String),

    #[error("transcription service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid transcription response: {0}")]
    InvalidResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// `filename` is a hint for the container format (e.g. `audio.ogg`).
    async fn transcribe(&self, audio: Bytes, filename: &str) -> Result<String, TranscriptionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_error_display() {
        let err = TranscriptionError::Status {
            status: 503,
            body: "busy".into(),
        };
        assert_eq!(err.to_string(), "transcription service returned 503: busy");
    }

    #[test]
    fn io_error_converts() {
        let err: TranscriptionError = std::io::Error::new(std::io::ErrorKind::NotFound, "ffmpeg").into();
        assert!(matches!(err, TranscriptionError::Io(_)));
    }
}
