//! Wire types shared by the daemon's HTTP API and the client.

use serde::{Deserialize, Serialize};

use crate::types::{CancelReason, ChatMessage, Segment};

pub mod paths {
    pub const UPLOAD: &str = "/api/upload";
    pub const STOP_TRANSCRIBE: &str = "/api/stop-transcribe";
    pub const STATUS: &str = "/api/status";
    pub const SUMMARY: &str = "/api/summary";
    pub const DETAIL_SUMMARY: &str = "/api/detailSummary";
    pub const CHAT: &str = "/api/chat";
    pub const MINDMAP: &str = "/api/mindmap";
}

/// Non-standard "client closed request" status returned for interrupted jobs.
pub const STATUS_INTERRUPTED: u16 = 499;

/// Multipart field carrying the uploaded media.
pub const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub transcription: Vec<Segment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterruptedResponse {
    pub status: String,
    pub detail: String,
    pub reason: CancelReason,
    /// Segments produced before the job stopped.
    pub segments: usize,
}

impl InterruptedResponse {
    pub fn new(reason: CancelReason, segments: usize) -> Self {
        Self {
            status: "interrupted".to_string(),
            detail: "Transcription interrupted".to_string(),
            reason,
            segments,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopResponse {
    pub status: String,
}

impl StopResponse {
    pub fn success() -> Self {
        Self {
            status: "success".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    /// Name of a previously uploaded file to attach as audio to the first turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}
