//! Server-sent events parsing for OpenAI-compatible chat streams.
//!
//! ```text
//! : keep-alive
//!
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: [DONE]
//! ```
//!
//! Only `data:` lines carrying a non-empty content delta become fragments;
//! comments, `event:`/`id:`/`retry:` fields and empty deltas are dropped.

use serde::Deserialize;

use super::DecodeError;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, PartialEq, Eq)]
pub enum SseFrame {
    Text(String),
    Done,
    Skip,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    content: Option<String>,
}

pub fn parse_line(line: &str) -> Result<SseFrame, DecodeError> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(':') {
        return Ok(SseFrame::Skip);
    }

    let Some(payload) = line.strip_prefix("data:") else {
        return Ok(SseFrame::Skip);
    };
    let payload = payload.trim_start();
    if payload.is_empty() {
        return Ok(SseFrame::Skip);
    }
    if payload == DONE_SENTINEL {
        return Ok(SseFrame::Done);
    }

    let delta: StreamDelta = serde_json::from_str(payload)
        .map_err(|e| DecodeError::InvalidResponse(format!("failed to parse SSE delta: {e}")))?;

    if let Some(error) = delta.error {
        return Err(DecodeError::InvalidResponse(format!(
            "upstream error in stream: {error}"
        )));
    }

    let text = delta
        .choices
        .into_iter()
        .filter_map(|choice| choice.delta.content)
        .collect::<String>();

    if text.is_empty() {
        Ok(SseFrame::Skip)
    } else {
        Ok(SseFrame::Text(text))
    }
}

/// Splits a byte stream into lines. Bytes are buffered until a newline so a
/// multi-byte character split across network chunks decodes intact.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..line.len() - 1]).into_owned());
        }
        lines
    }

    /// Whatever remains after the stream ended without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}
