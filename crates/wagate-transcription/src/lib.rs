//! Speech-to-text client for a whisper.cpp-compatible HTTP server.
//!
//! Inbound voice notes are Ogg/Opus; the server wants 16 kHz mono WAV, so
//! audio is converted with ffmpeg before upload.

mod convert;
mod whisper;

pub use convert::AudioConverter;
pub use whisper::{WhisperClient, WhisperConfig};
