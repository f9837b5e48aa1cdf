use std::path::Path;
use std::process::Stdio;

use bytes::Bytes;
use tokio::process::Command;
use wagate_core::transcription::TranscriptionError;

const SAMPLE_RATE: &str = "16000";

#[derive(Clone, Debug)]
pub enum AudioConverter {
    /// Re-encode to 16 kHz mono WAV with the given ffmpeg binary.
    Ffmpeg { program: String },
    /// Upload the audio as received.
    Passthrough,
}

impl Default for AudioConverter {
    fn default() -> Self {
        Self::Ffmpeg {
            program: "ffmpeg".into(),
        }
    }
}

impl AudioConverter {
    /// Returns the bytes to upload and the file name to upload them under.
    pub async fn to_wav(&self, audio: Bytes, filename: &str) -> Result<(Bytes, String), TranscriptionError> {
        match self {
            Self::Passthrough => Ok((audio, filename.to_string())),
            Self::Ffmpeg { program } => {
                let dir = tempfile::tempdir()?;
                let input = dir.path().join(input_name(filename));
                let output = dir.path().join("audio.wav");
                tokio::fs::write(&input, &audio).await?;
                run_ffmpeg(program, &input, &output).await?;
                let wav = tokio::fs::read(&output).await?;
                Ok((Bytes::from(wav), "audio.wav".to_string()))
            }
        }
    }
}

/// Keeps only the file name component so a hint cannot escape the temp dir.
fn input_name(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("audio.ogg")
        .to_string()
}

async fn run_ffmpeg(program: &str, input: &Path, output: &Path) -> Result<(), TranscriptionError> {
    let result = Command::new(program)
        .arg("-y")
        .arg("-i")
        .arg(input)
        .args(["-ar", SAMPLE_RATE, "-ac", "1"])
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| TranscriptionError::Conversion(format!("spawn {program}: {e}")))?;

    if !result.status.success() {
        let stderr = String::from_utf8_lossy(&result.stderr);
        let tail: String = stderr.lines().last().unwrap_or_default().to_string();
        return Err(TranscriptionError::Conversion(format!(
            "{program} exited with {}: {tail}",
            result.status
        )));
    }
    Ok(())
}
