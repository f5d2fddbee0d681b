//! Local speech-to-text using whisper-rs.
//!
//! Inference is CPU-bound, so it runs on the blocking pool. If the caller
//! gives up, the blocking task finishes and its result is discarded.

use crate::chatbot::audio::{Pcm, Transcriber, TranscriptionError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};
use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

/// Whisper transcription engine.
pub struct Whisper {
    ctx: Arc<WhisperContext>,
    /// `None` lets whisper detect the language (farmers mix Hindi and English).
    language: Option<String>,
}

impl Whisper {
    /// Load a Whisper model from a .bin file.
    pub fn new(model_path: &Path, language: Option<String>) -> Result<Self, String> {
        info!("Loading Whisper model from {:?}", model_path);

        if !model_path.exists() {
            return Err(format!("Model file not found: {:?}", model_path));
        }

        let ctx = WhisperContext::new_with_params(
            model_path.to_str().ok_or("Invalid model path")?,
            WhisperContextParameters::default(),
        )
        .map_err(|e| format!("Failed to load Whisper model: {e}"))?;

        info!("Whisper model loaded successfully");
        Ok(Self { ctx: Arc::new(ctx), language })
    }
}

fn run(ctx: &WhisperContext, language: Option<&str>, samples: &[f32]) -> Result<String, String> {
    let mut state = ctx
        .create_state()
        .map_err(|e| format!("Failed to create Whisper state: {e}"))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_language(language);
    params.set_translate(false);
    params.set_no_timestamps(true);
    params.set_single_segment(false);

    state
        .full(params, samples)
        .map_err(|e| format!("Whisper transcription failed: {e}"))?;

    let mut text = String::new();
    for segment in state.as_iter() {
        if let Ok(s) = segment.to_str() {
            text.push_str(s);
            text.push(' ');
        }
    }
    Ok(text.trim().to_string())
}

#[async_trait]
impl Transcriber for Whisper {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(&self, pcm: &Pcm) -> Result<String, TranscriptionError> {
        debug!("Running whisper on {:?} of audio", pcm.duration());
        let ctx = self.ctx.clone();
        let language = self.language.clone();
        let samples = pcm.to_f32();

        tokio::task::spawn_blocking(move || run(&ctx, language.as_deref(), &samples))
            .await
            .map_err(|e| TranscriptionError::BackendError(format!("whisper task failed: {e}")))?
            .map_err(TranscriptionError::BackendError)
    }
}
