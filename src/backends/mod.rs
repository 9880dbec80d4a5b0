//! Model capability ports.
//!
//! Three narrow interfaces the core consumes: speech recognition, text
//! generation, and sentence embedding. Concrete backends are selected once
//! at process start. All backends are assumed thread-hostile: the
//! scheduler guarantees at-most-one active call per recogniser and per
//! generator; an embedder may opt into parallel use via `parallel_safe`.

pub mod embedder;
pub mod ollama;
pub mod whisper;

use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Weights are absent or the local runtime is unreachable.
    #[error("model not ready: {0}")]
    NotReady(String),
    /// A required companion file or library is missing.
    #[error("model dependency missing: {0}")]
    DependencyMissing(String),
    /// The backend raised during inference.
    #[error("model runtime error: {0}")]
    Runtime(String),
}

/// Generation tuning passed through to the generator backend.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.2,
        }
    }
}

/// Speech recogniser port.
pub trait SpeechToText: Send + Sync {
    /// Transcribe an audio payload. `filename` carries the container
    /// extension; `language_hint` is passed through when present.
    fn transcribe(
        &self,
        audio: &[u8],
        filename: &str,
        language_hint: Option<&str>,
    ) -> Result<String, ModelError>;
}

/// Generative model port.
pub trait TextGenerator: Send + Sync {
    /// Unary generation. A cancelled call may still run to completion on
    /// the backend; the scheduler discards the result.
    fn generate(
        &self,
        system: &str,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<String, ModelError>;

    /// Streaming generation. Token-sized chunks are pushed into `token_tx`;
    /// the full text is returned on completion. Implementations check
    /// `cancel` between chunks and halt token production promptly.
    fn generate_streaming(
        &self,
        system: &str,
        prompt: &str,
        params: &GenerationParams,
        token_tx: std::sync::mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> Result<String, ModelError>;
}

/// Sentence embedder port. Vectors are fixed-dim and L2-normalised so the
/// index can rank by dot product.
pub trait EmbeddingModel: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, ModelError>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ModelError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    fn dimension(&self) -> usize;

    /// Whether the backend tolerates concurrent calls. When false the
    /// scheduler serialises access like the other ports.
    fn parallel_safe(&self) -> bool {
        false
    }
}
