//! OpenAI-compatible chat completions (DashScope compatible mode by default).

use async_trait::async_trait;
use base64::Engine;
use futures_util::StreamExt;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use shared::{ChatMessage, LlmConfig, Role};
use std::path::Path;

use super::sse::{self, LineBuffer, SseFrame};
use super::{ChatDecoder, ChatPrompt, DecodeError, FragmentStream};

pub struct OpenAiChat {
    http: reqwest::Client,
    base_url: String,
    model: String,
    audio_model: String,
    api_key: Option<String>,
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: WireContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    InputAudio { input_audio: AudioData },
}

#[derive(Debug, Serialize)]
struct AudioData {
    data: String,
    format: String,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: config.base_url.trim().trim_end_matches('/').to_string(),
            model: config.model.clone(),
            audio_model: config.audio_model.clone(),
            api_key: config.api_key(),
            temperature: config.temperature,
        }
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    async fn build_messages(&self, prompt: ChatPrompt) -> Result<Vec<WireMessage>, DecodeError> {
        let mut messages = Vec::with_capacity(prompt.messages.len() + 1);
        if let Some(system) = prompt.system {
            messages.push(WireMessage {
                role: Role::System.as_str(),
                content: WireContent::Text(system),
            });
        }

        let mut audio = match prompt.audio {
            Some(path) => Some(encode_audio(&path).await?),
            None => None,
        };

        for ChatMessage { role, content } in prompt.messages {
            let content = match (role, audio.take()) {
                (Role::User, Some(audio)) => WireContent::Parts(vec![
                    ContentPart::InputAudio { input_audio: audio },
                    ContentPart::Text { text: content },
                ]),
                (_, pending) => {
                    audio = pending;
                    WireContent::Text(content)
                }
            };
            messages.push(WireMessage {
                role: role.as_str(),
                content,
            });
        }

        if audio.is_some() {
            return Err(DecodeError::UnsupportedInput(
                "audio attachment needs a user message".to_string(),
            ));
        }
        Ok(messages)
    }

    async fn send(
        &self,
        prompt: ChatPrompt,
        stream: bool,
    ) -> Result<reqwest::Response, DecodeError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            DecodeError::NotConfigured("no API key for the chat backend".to_string())
        })?;
        let model = if prompt.audio.is_some() {
            self.audio_model.as_str()
        } else {
            self.model.as_str()
        };
        let request = CompletionRequest {
            model,
            messages: self.build_messages(prompt).await?,
            stream,
            temperature: self.temperature,
        };

        debug!(
            "Sending chat completion request (model: {}, messages: {}, stream: {})",
            model,
            request.messages.len(),
            stream
        );

        let mut builder = self.http.post(self.completions_url()).bearer_auth(api_key);
        if stream {
            builder = builder.header(reqwest::header::ACCEPT, "text/event-stream");
        }
        let response = builder.json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            warn!("Chat backend returned {}: {}", status, body);
            return Err(DecodeError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

async fn encode_audio(path: &Path) -> Result<AudioData, DecodeError> {
    let bytes = tokio::fs::read(path).await?;
    let format = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_else(|| "wav".to_string());
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    Ok(AudioData {
        data: format!("data:;base64,{encoded}"),
        format,
    })
}

#[async_trait]
impl ChatDecoder for OpenAiChat {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn stream(&self, prompt: ChatPrompt) -> Result<FragmentStream, DecodeError> {
        let response = self.send(prompt, true).await?;
        let mut body = response.bytes_stream();

        let fragments = async_stream::stream! {
            let mut lines = LineBuffer::default();
            let mut ended = false;

            'read: while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(DecodeError::from(e));
                        ended = true;
                        break 'read;
                    }
                };
                for line in lines.push(&chunk) {
                    match sse::parse_line(&line) {
                        Ok(SseFrame::Text(text)) => yield Ok(text),
                        Ok(SseFrame::Skip) => {}
                        Ok(SseFrame::Done) => {
                            ended = true;
                            break 'read;
                        }
                        Err(e) => {
                            yield Err(e);
                            ended = true;
                            break 'read;
                        }
                    }
                }
            }

            if !ended {
                if let Some(line) = lines.finish() {
                    match sse::parse_line(&line) {
                        Ok(SseFrame::Text(text)) => yield Ok(text),
                        Ok(_) => {}
                        Err(e) => yield Err(e),
                    }
                }
            }
            debug!("Chat stream finished");
        };

        Ok(fragments.boxed())
    }

    async fn complete(&self, prompt: ChatPrompt) -> Result<String, DecodeError> {
        let response = self.send(prompt, false).await?;
        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| DecodeError::InvalidResponse(format!("chat completion: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| DecodeError::InvalidResponse("completion has no content".to_string()))
    }
}
