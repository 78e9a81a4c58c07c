use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Failures reported by a speech-to-text collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TranscriptionError {
    #[error("transcription failed: {0}")]
    Failed(String),
    #[error("transcription timed out after {0:?}")]
    TimedOut(Duration),
    #[error("transcription returned no text")]
    Empty,
}

/// Contract for any transcription provider (remote service, local model, stub).
///
/// Only success, failure and timeout matter to callers; the provider's internals do not.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Short name used for logging and audit details.
    fn name(&self) -> &'static str;

    /// Turn raw captured audio into text.
    async fn transcribe(&self, raw_audio: &[u8]) -> Result<String, TranscriptionError>;
}

/// Treats the capture bytes as UTF-8 text. Useful for tests and offline smoke runs.
pub struct EchoTranscriber;

#[async_trait]
impl Transcriber for EchoTranscriber {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn transcribe(&self, raw_audio: &[u8]) -> Result<String, TranscriptionError> {
        let text = String::from_utf8(raw_audio.to_vec())
            .map_err(|e| TranscriptionError::Failed(e.to_string()))?;
        if text.trim().is_empty() {
            return Err(TranscriptionError::Empty);
        }
        Ok(text)
    }
}
