//! Decoder adapters.
//!
//! Two shapes of output, kept apart in the type system:
//! - transcription decoders yield a lazy [`SegmentStream`] that the job
//!   runner drains segment by segment, checking for cancellation at every
//!   boundary;
//! - chat decoders either stream text fragments ([`FragmentStream`]) or
//!   return a finished `String`.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use shared::{ChatMessage, Segment, TranscriptionBackend, TranscriptionConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::cancel::CancelSignal;

pub mod chat;
pub mod remote;
pub mod sse;
#[cfg(feature = "whisper")]
pub mod whisper;

pub type SegmentStream = BoxStream<'static, Result<Segment, DecodeError>>;
pub type FragmentStream = BoxStream<'static, Result<String, DecodeError>>;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("backend not configured: {0}")]
    NotConfigured(String),

    #[error("unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait TranscriptionDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn is_loaded(&self) -> bool {
        true
    }

    /// Starts decoding `source`. Segments are produced in order. Raising
    /// `cancel` or dropping the stream asks the backend to stop at the next
    /// segment.
    async fn decode(
        &self,
        source: &Path,
        cancel: CancelSignal,
    ) -> Result<SegmentStream, DecodeError>;

    /// Periodic housekeeping, e.g. unloading an idle model.
    async fn release_idle(&self) {}
}

/// Input for a chat decoder.
#[derive(Debug, Clone, Default)]
pub struct ChatPrompt {
    pub system: Option<String>,
    pub messages: Vec<ChatMessage>,
    /// Audio attached to the first user message.
    pub audio: Option<PathBuf>,
}

impl ChatPrompt {
    pub fn instruct(system: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            system: Some(system.into()),
            messages: vec![ChatMessage::user(text)],
            audio: None,
        }
    }
}

#[async_trait]
pub trait ChatDecoder: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(&self, prompt: ChatPrompt) -> Result<FragmentStream, DecodeError>;

    async fn complete(&self, prompt: ChatPrompt) -> Result<String, DecodeError>;
}

pub fn build_transcriber(config: &TranscriptionConfig) -> Result<Arc<dyn TranscriptionDecoder>> {
    match config.backend {
        TranscriptionBackend::Remote => Ok(Arc::new(remote::RemoteTranscriber::new(config))),
        #[cfg(feature = "whisper")]
        TranscriptionBackend::Local => Ok(Arc::new(whisper::WhisperDecoder::new(config))),
        #[cfg(not(feature = "whisper"))]
        TranscriptionBackend::Local => Err(anyhow::anyhow!(
            "transcription backend 'local' requires building scribe-daemon with the `whisper` feature"
        )),
    }
}
