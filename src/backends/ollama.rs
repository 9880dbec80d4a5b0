//! Ollama HTTP client for local LLM inference.
//!
//! Unary generation posts to `/api/generate` with `stream: false`;
//! streaming reads the NDJSON response line by line and forwards each
//! `response` fragment as a token. Cancellation is checked between chunks;
//! dropping the connection is the abort mechanism Ollama understands.

use std::io::{BufRead, BufReader};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{GenerationParams, ModelError, TextGenerator};

/// Preferred generator models in order of preference.
const PREFERRED_MODELS: &[&str] = &[
    "dental-smartnote",
    "medgemma",
    "medgemma:4b",
    "llama3.1:8b",
    "llama3.1:latest",
];

/// Ollama HTTP client. Blocking by design: every call runs inside a
/// scheduler worker on the blocking pool.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::blocking::Client,
    timeout_secs: u64,
}

impl OllamaClient {
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

    /// Default local instance at localhost:11434 with a 5-minute timeout.
    pub fn default_local() -> Result<Self, ModelError> {
        Self::new("http://localhost:11434", 300)
    }

    /// Find the best available generator model.
    pub fn find_best_model(&self) -> Result<String, ModelError> {
        let available = self.list_models()?;
        for preferred in PREFERRED_MODELS {
            if available.iter().any(|m| m.starts_with(preferred)) {
                return Ok(preferred.to_string());
            }
        }
        Err(ModelError::NotReady(
            "no generator model installed".to_string(),
        ))
    }

    pub fn is_model_available(&self, model: &str) -> Result<bool, ModelError> {
        let models = self.list_models()?;
        Ok(models.iter().any(|m| m.starts_with(model)))
    }

    pub fn list_models(&self) -> Result<Vec<String>, ModelError> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().map_err(|e| self.map_err(e))?;
        let parsed: TagsResponse = Self::parse(response)?;
        Ok(parsed.models.into_iter().map(|m| m.name).collect())
    }

    /// Models currently loaded into memory, with their VRAM allocation.
    /// Consumed by hardware detection.
    pub fn list_running_models(&self) -> Result<Vec<RunningModel>, ModelError> {
        let url = format!("{}/api/ps", self.base_url);
        let response = self.client.get(&url).send().map_err(|e| self.map_err(e))?;
        let parsed: PsResponse = Self::parse(response)?;
        Ok(parsed.models)
    }

    fn parse<T: serde::de::DeserializeOwned>(
        response: reqwest::blocking::Response,
    ) -> Result<T, ModelError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Runtime(format!(
                "runtime returned {status}: {body}"
            )));
        }
        response
            .json()
            .map_err(|e| ModelError::Runtime(format!("response parsing: {e}")))
    }

    fn map_err(&self, e: reqwest::Error) -> ModelError {
        if e.is_connect() {
            ModelError::NotReady(format!("cannot reach runtime at {}", self.base_url))
        } else if e.is_timeout() {
            ModelError::Runtime(format!("request timed out after {}s", self.timeout_secs))
        } else {
            ModelError::Runtime(e.to_string())
        }
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    system: &'a str,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_gpu: Option<u32>,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<TaggedModel>,
}

#[derive(Deserialize)]
struct TaggedModel {
    name: String,
}

#[derive(Deserialize)]
struct PsResponse {
    #[serde(default)]
    models: Vec<RunningModel>,
}

/// One loaded model as reported by `/api/ps`.
#[derive(Debug, Clone, Deserialize)]
pub struct RunningModel {
    pub name: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub size_vram: u64,
    #[serde(default)]
    pub processor: String,
}

/// Generator backend bound to a resolved model name.
pub struct OllamaGenerator {
    client: OllamaClient,
    model: String,
    /// GPU layer offload hint from the hardware profile, when pinned.
    offload_layers: Option<u32>,
}

impl OllamaGenerator {
    pub fn new(client: OllamaClient, model: String, offload_layers: Option<u32>) -> Self {
        Self {
            client,
            model,
            offload_layers,
        }
    }

    /// Resolve the best installed model and bind a generator to it.
    /// Returns `NotReady` when the runtime is down or no model is installed.
    pub fn resolve(client: OllamaClient, offload_layers: Option<u32>) -> Result<Self, ModelError> {
        let model = client.find_best_model()?;
        tracing::info!(model = %model, "Generator model resolved");
        Ok(Self::new(client, model, offload_layers))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body<'a>(
        &'a self,
        system: &'a str,
        prompt: &'a str,
        params: &GenerationParams,
        stream: bool,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.model,
            prompt,
            system,
            stream,
            options: GenerateOptions {
                num_predict: params.max_tokens,
                temperature: params.temperature,
                num_gpu: self.offload_layers,
            },
        }
    }
}

impl TextGenerator for OllamaGenerator {
    fn generate(
        &self,
        system: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.client.base_url);
        let body = self.request_body(system, prompt, params, false);

        let response = self
            .client
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.client.map_err(e))?;

        let parsed: GenerateResponse = OllamaClient::parse(response)?;
        Ok(parsed.response)
    }

    fn generate_streaming(
        &self,
        system: &str,
        prompt: &str,
        params: &GenerationParams,
        token_tx: std::sync::mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.client.base_url);
        let body = self.request_body(system, prompt, params, true);

        let response = self
            .client
            .client
            .post(&url)
            .json(&body)
            .send()
            .map_err(|e| self.client.map_err(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(ModelError::Runtime(format!(
                "runtime returned {status}: {body}"
            )));
        }

        let mut full = String::new();
        let reader = BufReader::new(response);
        for line in reader.lines() {
            if cancel.is_cancelled() {
                // Dropping the reader tears down the connection; Ollama
                // stops generating when the client goes away.
                tracing::debug!(model = %self.model, "Streaming generation cancelled");
                return Ok(full);
            }
            let line = line.map_err(|e| ModelError::Runtime(format!("stream read: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let chunk: GenerateResponse = serde_json::from_str(&line)
                .map_err(|e| ModelError::Runtime(format!("stream parsing: {e}")))?;
            if !chunk.response.is_empty() {
                full.push_str(&chunk.response);
                // Receiver gone means the consumer hung up; stop producing.
                if token_tx.send(chunk.response).is_err() {
                    return Ok(full);
                }
            }
            if chunk.done {
                break;
            }
        }

        Ok(full)
    }
}
