//! Local whisper.cpp backend.
//!
//! The model is loaded lazily on first use and unloaded after
//! `model_timeout_seconds` of inactivity. Inference runs on the blocking
//! pool and hands each segment to the job runner from whisper's segment
//! callback through a capacity-1 channel. whisper.cpp polls the abort
//! callback during inference, so a raised cancel signal or a dropped stream
//! ends the run at the next check.

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info};
use shared::{Segment, TranscriptionConfig};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use whisper_rs::{
    FullParams, SamplingStrategy, SegmentCallbackData, WhisperContext, WhisperContextParameters,
};

use super::{DecodeError, SegmentStream, TranscriptionDecoder};
use crate::cancel::CancelSignal;

const SAMPLE_RATE: u32 = 16_000;

struct LoadedModel {
    ctx: Option<Arc<WhisperContext>>,
    last_used: Option<SystemTime>,
}

pub struct WhisperDecoder {
    model_path: PathBuf,
    model_timeout: Duration,
    language: Option<String>,
    beam_size: i32,
    model: RwLock<LoadedModel>,
    loaded: AtomicBool,
}

impl WhisperDecoder {
    pub fn new(config: &TranscriptionConfig) -> Self {
        Self {
            model_path: config.model_path.clone(),
            model_timeout: Duration::from_secs(config.model_timeout_seconds),
            language: config.language.clone(),
            beam_size: config.beam_size,
            model: RwLock::new(LoadedModel {
                ctx: None,
                last_used: None,
            }),
            loaded: AtomicBool::new(false),
        }
    }

    async fn ensure_loaded(&self) -> Result<Arc<WhisperContext>, DecodeError> {
        let mut model = self.model.write().await;
        model.last_used = Some(SystemTime::now());
        if let Some(ctx) = &model.ctx {
            return Ok(Arc::clone(ctx));
        }

        if !self.model_path.exists() {
            return Err(DecodeError::NotConfigured(format!(
                "Whisper model not found at {:?}. Please download a model file.",
                self.model_path
            )));
        }

        info!("Loading Whisper model from {:?}", self.model_path);
        let model_path = self.model_path.clone();
        let ctx = tokio::task::spawn_blocking(move || {
            let params = WhisperContextParameters::default();
            WhisperContext::new_with_params(&model_path.to_string_lossy(), params)
        })
        .await
        .map_err(|e| DecodeError::Model(format!("model load task failed: {e}")))?
        .map_err(|e| DecodeError::Model(format!("failed to load model: {e:?}")))?;

        let ctx = Arc::new(ctx);
        model.ctx = Some(Arc::clone(&ctx));
        self.loaded.store(true, Ordering::SeqCst);
        info!("Whisper model loaded successfully");
        Ok(ctx)
    }
}

fn full_params<'a>(language: Option<&'a str>, beam_size: i32) -> FullParams<'a, 'a> {
    let strategy = if beam_size > 1 {
        SamplingStrategy::BeamSearch {
            beam_size,
            patience: -1.0,
        }
    } else {
        SamplingStrategy::Greedy { best_of: 1 }
    };
    let mut params = FullParams::new(strategy);
    params.set_language(language);
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params
}

/// Inference stops once the job is stopped or nobody reads its segments.
fn should_abort<T>(cancel: &CancelSignal, segments: &mpsc::Sender<T>) -> bool {
    cancel.observe() || segments.is_closed()
}

/// Callback timestamps are in centiseconds.
fn callback_segment(data: SegmentCallbackData) -> Segment {
    Segment::new(
        data.start_timestamp as f64 / 100.0,
        data.end_timestamp as f64 / 100.0,
        data.text,
    )
}

/// Reads a WAV file as 16 kHz mono f32 samples.
fn read_wav(path: &Path) -> Result<Vec<f32>, DecodeError> {
    let mut reader = hound::WavReader::open(path).map_err(|e| {
        DecodeError::UnsupportedInput(format!("{:?} is not a readable WAV file: {e}", path))
    })?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE {
        return Err(DecodeError::UnsupportedInput(format!(
            "expected {} Hz audio, got {} Hz",
            SAMPLE_RATE, spec.sample_rate
        )));
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .map_err(|e| DecodeError::UnsupportedInput(e.to_string()))?,
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<_, _>>()
                .map_err(|e| DecodeError::UnsupportedInput(e.to_string()))?
        }
    };

    let channels = spec.channels.max(1) as usize;
    if channels == 1 {
        return Ok(samples);
    }
    Ok(samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect())
}

#[async_trait]
impl TranscriptionDecoder for WhisperDecoder {
    fn name(&self) -> &str {
        "whisper-local"
    }

    fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    async fn decode(
        &self,
        source: &Path,
        cancel: CancelSignal,
    ) -> Result<SegmentStream, DecodeError> {
        let ctx = self.ensure_loaded().await?;

        let path = source.to_path_buf();
        let audio = tokio::task::spawn_blocking(move || read_wav(&path))
            .await
            .map_err(|e| DecodeError::Model(format!("audio read task failed: {e}")))??;
        debug!("Decoded {} samples from {:?}", audio.len(), source);

        let (tx, rx) = mpsc::channel::<Result<Segment, DecodeError>>(1);
        let language = self.language.clone();
        let beam_size = self.beam_size;

        tokio::task::spawn_blocking(move || {
            let mut params = full_params(language.as_deref(), beam_size);

            let abort_cancel = cancel.clone();
            let abort_tx = tx.clone();
            params.set_abort_callback_safe(move || should_abort(&abort_cancel, &abort_tx));

            let segment_tx = tx.clone();
            params.set_segment_callback_safe(move |data: SegmentCallbackData| {
                if segment_tx.blocking_send(Ok(callback_segment(data))).is_err() {
                    debug!("Segment receiver dropped, aborting at the next check");
                }
            });

            let result = ctx
                .create_state()
                .and_then(|mut state| state.full(params, &audio));
            match result {
                Ok(_) => debug!("Whisper inference finished"),
                Err(e) if should_abort(&cancel, &tx) => {
                    debug!("Whisper inference aborted: {:?}", e)
                }
                Err(e) => {
                    error!("Whisper inference failed: {:?}", e);
                    let _ = tx.blocking_send(Err(DecodeError::Model(format!("{e:?}"))));
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn release_idle(&self) {
        let mut model = self.model.write().await;
        if let Some(last_used) = model.last_used {
            if model.ctx.is_some()
                && last_used.elapsed().unwrap_or(Duration::ZERO) > self.model_timeout
            {
                info!("Unloading Whisper model due to timeout");
                model.ctx = None;
                model.last_used = None;
                self.loaded.store(false, Ordering::SeqCst);
            }
        }
    }
}
