//! HTTP API.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures_util::{stream, StreamExt};
use log::{debug, error, info, warn};
use shared::api::{
    paths, ChatRequest, ErrorResponse, InterruptedResponse, StopResponse, TextRequest,
    TranscriptionResponse, STATUS_INTERRUPTED, UPLOAD_FIELD,
};
use shared::relay::{relay, ChannelSink};
use shared::{ChatMessage, Config, LlmConfig, Role};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::controller::{JobController, JobError, JobOutcome, StopReport};
use crate::decoder::{ChatDecoder, ChatPrompt, DecodeError};
use crate::mindmap;
use crate::storage::{StorageError, UploadStore};

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<JobController>,
    pub chat: Arc<dyn ChatDecoder>,
    pub store: Arc<UploadStore>,
    pub llm: Arc<LlmConfig>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Busy(String),

    #[error("{0}")]
    BadGateway(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Busy(_) => StatusCode::CONFLICT,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed with {}: {}", status, self);
        } else {
            warn!("Request rejected with {}: {}", status, self);
        }
        (
            status,
            Json(ErrorResponse {
                detail: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::Busy(_) => ApiError::Busy(e.to_string()),
            JobError::Decode(cause) => ApiError::Internal(cause),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidName(_) => ApiError::BadRequest(e.to_string()),
            StorageError::NotFound(_) => ApiError::NotFound(e.to_string()),
            StorageError::Io(_) => ApiError::Internal(e.to_string()),
        }
    }
}

/// A streamed response that could not be started.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("upstream request failed: {0}")]
    Open(DecodeError),

    #[error("upstream failed before the first fragment: {0}")]
    FirstFragment(DecodeError),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError::BadGateway(e.to_string())
    }
}

pub fn router(state: AppState, config: &Config) -> Router {
    Router::new()
        .route(paths::UPLOAD, post(upload))
        .route(paths::STOP_TRANSCRIBE, post(stop_transcribe))
        .route(paths::STATUS, get(status))
        .route(paths::SUMMARY, post(summary))
        .route(paths::DETAIL_SUMMARY, post(detail_summary))
        .route(paths::CHAT, post(chat))
        .route(paths::MINDMAP, post(generate_mindmap))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes()))
        .layer(cors_layer(&config.server.cors_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut staged = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid multipart body: {e}")))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let name = field
            .file_name()
            .map(str::to_string)
            .ok_or_else(|| ApiError::BadRequest("upload has no file name".to_string()))?;
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("failed to read upload: {e}")))?;
        if let Some(earlier) = staged.replace(state.store.stage(&name, &bytes).await?) {
            state.store.discard(earlier).await;
        }
    }

    let staged = staged.ok_or_else(|| ApiError::BadRequest("No file provided".to_string()))?;
    info!("Transcribing upload {}", staged.file_name());

    let result = state.controller.submit(staged.path().to_path_buf()).await;
    if let Err(JobError::Busy(_)) = result {
        state.store.discard(staged).await;
    } else if let Err(e) = state.store.commit(staged).await {
        warn!("Failed to store upload: {}", e);
    }

    match result? {
        JobOutcome::Completed(segments) => Ok(Json(TranscriptionResponse {
            transcription: segments,
        })
        .into_response()),
        JobOutcome::Cancelled(cancellation) => {
            let status =
                StatusCode::from_u16(STATUS_INTERRUPTED).unwrap_or(StatusCode::REQUEST_TIMEOUT);
            Ok((
                status,
                Json(InterruptedResponse::new(
                    cancellation.reason,
                    cancellation.partial.len(),
                )),
            )
                .into_response())
        }
    }
}

async fn stop_transcribe(State(state): State<AppState>) -> Json<StopResponse> {
    match state.controller.stop().await {
        StopReport::Idle => debug!("Nothing to stop"),
        report => info!("Stop finished: {:?}", report),
    }
    Json(StopResponse::success())
}

async fn status(State(state): State<AppState>) -> Json<shared::DaemonStatus> {
    Json(state.controller.status(state.chat.name()).await)
}

async fn summary(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<Response, ApiError> {
    let prompt = ChatPrompt::instruct(state.llm.summary_prompt.clone(), request.text);
    Ok(relay_response(state.chat.as_ref(), prompt).await?)
}

async fn detail_summary(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<Response, ApiError> {
    let prompt = ChatPrompt::instruct(state.llm.detail_prompt.clone(), request.text);
    Ok(relay_response(state.chat.as_ref(), prompt).await?)
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Response, ApiError> {
    let mut messages = request.messages;
    let audio = match request.file.as_deref() {
        Some(name) => Some(state.store.resolve(name)?),
        None => None,
    };

    if audio.is_some() && !messages.iter().any(|m| m.role == Role::User) {
        messages.insert(0, ChatMessage::user(state.llm.audio_prompt.clone()));
    }
    if messages.is_empty() {
        return Err(ApiError::BadRequest("messages must not be empty".to_string()));
    }

    let prompt = ChatPrompt {
        system: None,
        messages,
        audio,
    };
    Ok(relay_response(state.chat.as_ref(), prompt).await?)
}

async fn generate_mindmap(
    State(state): State<AppState>,
    Json(request): Json<TextRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let document = mindmap::generate(state.chat.as_ref(), &request.text)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(document))
}

/// Streams the chat backend's fragments as a chunked `text/plain` body.
///
/// The first fragment is awaited before any header is sent, so an upstream
/// that fails immediately becomes a 502. Later failures cut the body short.
async fn relay_response(
    chat: &dyn ChatDecoder,
    prompt: ChatPrompt,
) -> Result<Response, RelayError> {
    let mut upstream = chat.stream(prompt).await.map_err(RelayError::Open)?;
    let first = match upstream.next().await {
        Some(Ok(fragment)) => Some(fragment),
        Some(Err(e)) => return Err(RelayError::FirstFragment(e)),
        None => None,
    };
    let upstream = stream::iter(first.map(Ok)).chain(upstream);

    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        let mut sink = ChannelSink::new(tx);
        let report = relay(upstream, &mut sink).await;
        info!(
            "Relayed {} fragments ({} bytes): {:?}",
            report.fragments, report.bytes, report.end
        );
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response())
}
