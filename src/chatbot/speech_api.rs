//! HTTP transcription backend speaking the OpenAI-compatible
//! `/audio/transcriptions` protocol.

use crate::chatbot::audio::{Pcm, Transcriber, TranscriptionError};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_MODEL: &str = "whisper-1";

pub struct SpeechApiClient {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    language: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize, Debug)]
struct TranscriptionResponse {
    text: Option<String>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

impl SpeechApiClient {
    /// `endpoint` is the API base, e.g. `https://api.openai.com/v1`.
    pub fn new(endpoint: &str, api_key: Option<String>, model: Option<String>, language: Option<String>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            language,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self) -> String {
        format!("{}/audio/transcriptions", self.endpoint)
    }
}

/// Extract the transcript from a response body.
fn parse_response(body: &str) -> Result<String, TranscriptionError> {
    let parsed: TranscriptionResponse = serde_json::from_str(body)
        .map_err(|e| TranscriptionError::BackendError(format!("failed to parse response: {e}")))?;

    if let Some(error) = parsed.error {
        return Err(TranscriptionError::BackendError(error.message));
    }
    parsed
        .text
        .ok_or_else(|| TranscriptionError::BackendError("response has no text".into()))
}

#[async_trait]
impl Transcriber for SpeechApiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn transcribe(&self, pcm: &Pcm) -> Result<String, TranscriptionError> {
        let file = reqwest::multipart::Part::bytes(pcm.to_wav())
            .file_name("voice.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::BackendError(e.to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "json")
            .part("file", file);
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let mut request = self.client.post(self.url()).multipart(form);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| TranscriptionError::BackendError(format!("HTTP error: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TranscriptionError::BackendError(format!("failed to read response: {e}")))?;

        debug!("Transcription API response status: {status}");

        if !status.is_success() {
            let detail = parse_response(&body).err().map(|e| e.to_string()).unwrap_or(body);
            return Err(TranscriptionError::BackendError(format!("API error {status}: {detail}")));
        }

        parse_response(&body)
    }
}
