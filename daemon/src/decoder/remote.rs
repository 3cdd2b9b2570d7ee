//! Remote OpenAI-compatible `/audio/transcriptions` backend.

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use log::{debug, info};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use shared::{Segment, TranscriptionConfig};
use std::path::Path;

use super::{DecodeError, SegmentStream, TranscriptionDecoder};
use crate::cancel::CancelSignal;

pub struct RemoteTranscriber {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    language: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<RemoteSegment>,
}

#[derive(Debug, Deserialize)]
struct RemoteSegment {
    start: f64,
    end: f64,
    text: String,
}

impl RemoteTranscriber {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.remote.base_url.trim().trim_end_matches('/').to_string(),
            model: config.remote.model.clone(),
            api_key: config.remote.api_key(),
            language: config
                .language
                .clone()
                .filter(|lang| !lang.is_empty() && lang != "auto"),
        }
    }

    async fn request(&self, source: &Path) -> Result<VerboseTranscription, DecodeError> {
        if self.base_url.is_empty() {
            return Err(DecodeError::NotConfigured(
                "remote transcription base URL is empty".to_string(),
            ));
        }

        let bytes = tokio::fs::read(source).await?;
        let file_name = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());

        let mut form = Form::new()
            .part("file", Part::bytes(bytes).file_name(file_name))
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment");
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let url = format!("{}/audio/transcriptions", self.base_url);
        debug!("Sending remote transcription request to: {}", url);

        let mut request = self.http.post(&url).multipart(form);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(DecodeError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| DecodeError::InvalidResponse(format!("transcription response: {e}")))
    }
}

fn into_segments(body: VerboseTranscription) -> Vec<Segment> {
    if body.segments.is_empty() {
        let text = body.text.trim();
        if text.is_empty() {
            return Vec::new();
        }
        return vec![Segment::new(0.0, body.duration.unwrap_or(0.0), text)];
    }

    body.segments
        .into_iter()
        .map(|segment| Segment::new(segment.start, segment.end, segment.text))
        .collect()
}

#[async_trait]
impl TranscriptionDecoder for RemoteTranscriber {
    fn name(&self) -> &str {
        "remote-whisper"
    }

    // The request future is dropped by the runner when the job is stopped.
    async fn decode(
        &self,
        source: &Path,
        _cancel: CancelSignal,
    ) -> Result<SegmentStream, DecodeError> {
        let body = self.request(source).await?;
        let segments = into_segments(body);
        info!(
            "Remote transcription of {:?} returned {} segments",
            source,
            segments.len()
        );
        Ok(stream::iter(segments.into_iter().map(Ok)).boxed())
    }
}
