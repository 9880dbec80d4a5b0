//! Speech recognition over a local whisper.cpp server.
//!
//! The recogniser uploads the audio container as multipart form data to
//! `/inference` and reads back the transcription text. The server runs on
//! loopback against local weights; reachability is the readiness signal.

use serde::Deserialize;

use super::{ModelError, SpeechToText};

/// Blocking client for a local whisper-server instance.
pub struct WhisperServer {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    text: String,
}

impl WhisperServer {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, ModelError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ModelError::Runtime(format!("HTTP client init: {e}")))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs,
        })
    }

    /// Default local instance at localhost:8180 with a 10-minute timeout
    /// (long consultations on CPU-only hosts are slow).
    pub fn default_local() -> Result<Self, ModelError> {
        Self::new("http://localhost:8180", 600)
    }

    fn map_err(&self, e: reqwest::Error) -> ModelError {
        if e.is_connect() {
            ModelError::NotReady(format!("cannot reach recogniser at {}", self.base_url))
        } else if e.is_timeout() {
            ModelError::Runtime(format!("request timed out after {}s", self.timeout_secs))
        } else {
            ModelError::Runtime(e.to_string())
        }
    }
}

impl SpeechToText for WhisperServer {
    fn transcribe(
        &self,
        audio: &[u8],
        filename: &str,
        language_hint: Option<&str>,
    ) -> Result<String, ModelError> {
        let url = format!("{}/inference", self.base_url);

        let part = reqwest::blocking::multipart::Part::bytes(audio.to_vec())
            .file_name(filename.to_string());
        let mut form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("response_format", "json");
        if let Some(lang) = language_hint {
            form = form.text("language", lang.to_string());
        }

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .map_err(|e| self.map_err(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Runtime(format!(
                "recogniser returned {status}: {body}"
            )));
        }

        let parsed: InferenceResponse = response
            .json()
            .map_err(|e| ModelError::Runtime(format!("response parsing: {e}")))?;

        Ok(parsed.text.trim().to_string())
    }
}
