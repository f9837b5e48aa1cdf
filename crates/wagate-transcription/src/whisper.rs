use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use wagate_core::transcription::{Transcriber, TranscriptionError};

use crate::convert::AudioConverter;

#[derive(Clone, Debug)]
pub struct WhisperConfig {
    /// Server root; requests go to `{base_url}/inference`.
    pub base_url: String,
    pub language: String,
    pub timeout: Duration,
    pub converter: AudioConverter,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9000".into(),
            language: "pt".into(),
            timeout: Duration::from_secs(120),
            converter: AudioConverter::default(),
        }
    }
}

pub struct WhisperClient {
    client: Client,
    config: WhisperConfig,
}

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    text: String,
}

impl WhisperClient {
    pub fn new(config: WhisperConfig) -> Self {
        let client = match Client::builder()
            .timeout(config.timeout)
            .user_agent("wagate/0.1")
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "whisper client build failed; using default client");
                Client::new()
            }
        };
        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/inference", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Transcriber for WhisperClient {
    #[instrument(skip(self, audio), fields(bytes = audio.len()))]
    async fn transcribe(&self, audio: Bytes, filename: &str) -> Result<String, TranscriptionError> {
        let (payload, upload_name) = self.config.converter.to_wav(audio, filename).await?;

        let part = Part::bytes(payload.to_vec())
            .file_name(upload_name)
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;
        let form = Form::new()
            .part("file", part)
            .text("language", self.config.language.clone())
            .text("response_format", "json");

        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.config.timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TranscriptionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: InferenceResponse = response
            .json()
            .await
            .map_err(|e| TranscriptionError::InvalidResponse(e.to_string()))?;
        let text = parsed.text.trim().to_string();
        debug!(chars = text.len(), "transcription complete");
        Ok(text)
    }
}
