//! SmartNote orchestration.
//!
//! Coordinates the user-visible work: audio → text through the speech
//! queue (single-flighted per upload digest), text → note through the
//! generate queue, plain or grounded in retrieved knowledge passages.
//! Completed notes are journaled and indexed; a failed save never fails the
//! user-visible operation.

use std::collections::HashMap;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditAction, AuditLog, AuditOutcome};
use crate::backends::{GenerationParams, SpeechToText, TextGenerator};
use crate::journal::ConsultationRecord;
use crate::metrics::{self, Metrics};
use crate::rag::{Passage, RagStore};
use crate::scheduler::{InferenceError, Scheduler};

use super::prompt::{build_plain_prompt, build_rag_prompt, SMARTNOTE_SYSTEM_PROMPT};
use super::sanitize::sanitize_text;
use super::stream_guard::{DegenerationPattern, StreamGuard, StreamGuardConfig};

/// Passages prepended to a RAG-augmented prompt.
const RAG_TOP_K: usize = 4;
/// Dentist recorded for pipeline-composed notes; the explicit save endpoint
/// carries the real name.
const AUTO_DENTIST: &str = "unspecified";

/// Result of a unary summarisation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SmartNote {
    pub summary: String,
    pub rag_enhanced: bool,
}

/// Events flowing to an SSE client.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Meta { rag_enhanced: bool },
    Chunk(String),
    Error { code: String, message: String },
    Done,
}

/// Cloneable error snapshot for single-flight followers.
#[derive(Debug, Clone)]
enum FlightError {
    Busy(u64),
    Cancelled,
    NotReady(String),
    Runtime(String),
    Invalid(String),
}

impl From<&InferenceError> for FlightError {
    fn from(err: &InferenceError) -> Self {
        match err {
            InferenceError::Busy { retry_after_secs } => Self::Busy(*retry_after_secs),
            InferenceError::Cancelled => Self::Cancelled,
            InferenceError::NotReady(m) => Self::NotReady(m.clone()),
            InferenceError::Runtime(m) => Self::Runtime(m.clone()),
            InferenceError::InvalidInput(m) => Self::Invalid(m.clone()),
        }
    }
}

impl From<FlightError> for InferenceError {
    fn from(err: FlightError) -> Self {
        match err {
            FlightError::Busy(retry_after_secs) => Self::Busy { retry_after_secs },
            FlightError::Cancelled => Self::Cancelled,
            FlightError::NotReady(m) => Self::NotReady(m),
            FlightError::Runtime(m) => Self::Runtime(m),
            FlightError::Invalid(m) => Self::InvalidInput(m),
        }
    }
}

type FlightCell = Arc<OnceCell<Result<String, FlightError>>>;

pub struct SmartNotePipeline {
    scheduler: Arc<Scheduler>,
    speech: Arc<dyn SpeechToText>,
    generator: Arc<dyn TextGenerator>,
    rag: Arc<RagStore>,
    audit: Arc<AuditLog>,
    metrics: Arc<Metrics>,
    max_text_chars: usize,
    guard_config: StreamGuardConfig,
    /// Best-effort single-flight over in-flight transcriptions, keyed by
    /// `(audio digest, language hint)`.
    inflight: tokio::sync::Mutex<HashMap<String, FlightCell>>,
}

impl SmartNotePipeline {
    pub fn new(
        scheduler: Arc<Scheduler>,
        speech: Arc<dyn SpeechToText>,
        generator: Arc<dyn TextGenerator>,
        rag: Arc<RagStore>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
        max_text_chars: usize,
    ) -> Self {
        Self {
            scheduler,
            speech,
            generator,
            rag,
            audit,
            metrics,
            max_text_chars,
            guard_config: StreamGuardConfig::default(),
            inflight: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn rag(&self) -> &Arc<RagStore> {
        &self.rag
    }

    // ── Audio → text ─────────────────────────────────────────

    /// Transcribe an upload through the speech queue.
    ///
    /// Identical uploads dispatched while the first is in flight share one
    /// backend call; the entry is dropped afterwards so later retries run
    /// fresh.
    pub async fn transcribe(
        &self,
        audio: Vec<u8>,
        filename: String,
        language_hint: Option<String>,
        cancel: CancellationToken,
    ) -> Result<String, InferenceError> {
        let key = flight_key(&audio, language_hint.as_deref());

        let cell = {
            let mut inflight = self.inflight.lock().await;
            Arc::clone(inflight.entry(key.clone()).or_default())
        };

        let outcome = cell
            .get_or_init(|| async {
                let speech = Arc::clone(&self.speech);
                let result = self
                    .scheduler
                    .speech
                    .submit(cancel, move |_| {
                        speech.transcribe(&audio, &filename, language_hint.as_deref())
                    })
                    .await;
                result.map_err(|e| FlightError::from(&e))
            })
            .await
            .clone();

        self.inflight.lock().await.remove(&key);

        outcome.map_err(InferenceError::from)
    }

    // ── Text → note, unary ───────────────────────────────────

    /// Generate a SmartNote. `use_rag` asks for knowledge grounding; when
    /// retrieval is not ready, fails, or finds nothing, the plain path runs
    /// and `rag_enhanced` comes back false.
    pub async fn summarize(
        &self,
        text: &str,
        use_rag: bool,
        correlation_id: &str,
        cancel: CancellationToken,
    ) -> Result<SmartNote, InferenceError> {
        let (system, prompt, rag_enhanced) = self.prepare_prompt(text, use_rag).await?;

        let generator = Arc::clone(&self.generator);
        let params = GenerationParams::default();
        let summary = self
            .scheduler
            .generate
            .submit(cancel, move |_| {
                generator.generate(&system, &prompt, &params)
            })
            .await?;

        if summary.trim().is_empty() {
            return Err(InferenceError::Runtime(
                "generator returned an empty note".to_string(),
            ));
        }

        self.persist_note(text, &summary, correlation_id).await;

        Ok(SmartNote {
            summary,
            rag_enhanced,
        })
    }

    // ── Text → note, streaming ───────────────────────────────

    /// Generate a SmartNote as a token stream.
    ///
    /// The first event declares `rag_enhanced`; tokens follow as chunks; a
    /// terminal event is always one of `Done` or `Error`. Client disconnect
    /// (receiver dropped) cancels the generation and the note is not
    /// persisted, since it was never delivered. Exactly one audit entry is
    /// written, at stream termination, with the true outcome.
    pub async fn summarize_stream(
        self: &Arc<Self>,
        text: String,
        use_rag: bool,
        correlation_id: String,
        resource: String,
        cancel: CancellationToken,
    ) -> tokio::sync::mpsc::Receiver<StreamEvent> {
        let (event_tx, event_rx) = tokio::sync::mpsc::channel::<StreamEvent>(64);
        let pipeline = Arc::clone(self);

        tokio::spawn(async move {
            let outcome = pipeline
                .drive_stream(&text, use_rag, &correlation_id, &event_tx, &cancel)
                .await;

            let (audit_outcome, detail) = match outcome {
                StreamOutcome::Completed => (AuditOutcome::Success, None),
                StreamOutcome::Cancelled => (AuditOutcome::Failure, Some("cancelled".to_string())),
                StreamOutcome::Failed(detail) => (AuditOutcome::Failure, Some(detail)),
            };
            if let Err(e) = pipeline.audit.record(
                AuditAction::SummarizeStream,
                "api",
                &resource,
                &correlation_id,
                audit_outcome,
                detail.as_deref(),
            ) {
                tracing::warn!(error = %e, "Audit write failed");
                pipeline.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
            }
        });

        event_rx
    }

    async fn drive_stream(
        &self,
        text: &str,
        use_rag: bool,
        correlation_id: &str,
        event_tx: &tokio::sync::mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let (system, prompt, rag_enhanced) = match self.prepare_prompt(text, use_rag).await {
            Ok(prepared) => prepared,
            Err(e) => {
                let _ = event_tx
                    .send(StreamEvent::Error {
                        code: stream_error_code(&e).to_string(),
                        message: e.to_string(),
                    })
                    .await;
                return StreamOutcome::Failed(e.to_string());
            }
        };

        if event_tx
            .send(StreamEvent::Meta { rag_enhanced })
            .await
            .is_err()
        {
            cancel.cancel();
            return StreamOutcome::Cancelled;
        }

        // Bridge the blocking generator into the event channel. A forwarder
        // thread applies the degeneration guard per token; on client
        // disconnect it cancels the submission token, the same token the
        // backend polls between chunks, so generation halts even on a run
        // of empty heartbeat lines.
        let generator = Arc::clone(&self.generator);
        let params = GenerationParams::default();
        let guard_config = self.guard_config.clone();
        let chunk_tx = event_tx.clone();
        let disconnect_cancel = cancel.clone();

        let submission = self.scheduler.generate.submit(cancel.clone(), move |work_cancel| {
            let (token_tx, token_rx) = std::sync::mpsc::channel::<String>();
            let forwarder = std::thread::spawn(move || -> Option<DegenerationPattern> {
                let mut guard = StreamGuard::new(guard_config);
                for token in token_rx {
                    if let Some(pattern) = guard.observe(&token) {
                        return Some(pattern);
                    }
                    if chunk_tx.blocking_send(StreamEvent::Chunk(token)).is_err() {
                        disconnect_cancel.cancel();
                        return None;
                    }
                }
                None
            });

            let result = generator.generate_streaming(
                &system,
                &prompt,
                &params,
                token_tx,
                work_cancel,
            );
            let degeneration = forwarder.join().unwrap_or(None);

            match (result, degeneration) {
                (_, Some(pattern)) => Err(crate::backends::ModelError::Runtime(format!(
                    "stream degeneration: {pattern}"
                ))),
                (Ok(full), None) => Ok(full),
                (Err(e), None) => Err(e),
            }
        });

        let full_text = match submission.await {
            Ok(full) => full,
            Err(InferenceError::Cancelled) => return StreamOutcome::Cancelled,
            Err(e) => {
                let _ = event_tx
                    .send(StreamEvent::Error {
                        code: stream_error_code(&e).to_string(),
                        message: e.to_string(),
                    })
                    .await;
                return StreamOutcome::Failed(e.to_string());
            }
        };

        if cancel.is_cancelled() {
            // The client went away mid-stream; nothing was delivered whole.
            return StreamOutcome::Cancelled;
        }

        if full_text.trim().is_empty() {
            let _ = event_tx
                .send(StreamEvent::Error {
                    code: "inference/stream".to_string(),
                    message: "generator produced no output".to_string(),
                })
                .await;
            return StreamOutcome::Failed("empty stream".to_string());
        }

        self.persist_note(text, &full_text, correlation_id).await;

        let _ = event_tx.send(StreamEvent::Done).await;
        StreamOutcome::Completed
    }

    // ── Shared steps ─────────────────────────────────────────

    async fn prepare_prompt(
        &self,
        text: &str,
        use_rag: bool,
    ) -> Result<(String, String, bool), InferenceError> {
        let sanitized = sanitize_text(text, self.max_text_chars);
        if sanitized.text.is_empty() {
            return Err(InferenceError::InvalidInput(
                "text is empty after sanitisation".to_string(),
            ));
        }

        let (passages, rag_enhanced) = if use_rag {
            self.retrieve_passages(&sanitized.text).await
        } else {
            (Vec::new(), false)
        };

        let prompt = if rag_enhanced {
            build_rag_prompt(&sanitized.text, &passages)
        } else {
            build_plain_prompt(&sanitized.text)
        };

        Ok((SMARTNOTE_SYSTEM_PROMPT.to_string(), prompt, rag_enhanced))
    }

    /// Retrieval is strictly best-effort: not ready, empty, or failing all
    /// degrade to the plain path.
    async fn retrieve_passages(&self, text: &str) -> (Vec<Passage>, bool) {
        let status = self.rag.status();
        if !status.ready || status.knowledge_count == 0 {
            return (Vec::new(), false);
        }
        match self.rag.retrieve_context(text, RAG_TOP_K).await {
            Ok(passages) if !passages.is_empty() => (passages, true),
            Ok(_) => (Vec::new(), false),
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed, falling back to plain prompt");
                (Vec::new(), false)
            }
        }
    }

    /// Journal + index the completed note. Failure is audited and counted,
    /// never surfaced to the client whose note already generated.
    async fn persist_note(&self, transcription: &str, note: &str, correlation_id: &str) {
        let record = ConsultationRecord::new(
            correlation_id,
            None,
            AUTO_DENTIST,
            "smartnote",
            transcription,
            note,
        );
        if let Err(e) = self.rag.save_consultation(&record).await {
            tracing::error!(error = %e, "Post-generation save failed");
            self.metrics.inc_counter(metrics::SAVE_FAILURES);
            if let Err(audit_err) = self.audit.record(
                AuditAction::ConsultationSave,
                "pipeline",
                &format!("consultation:{}", record.digest),
                correlation_id,
                AuditOutcome::Failure,
                Some(&e.to_string()),
            ) {
                tracing::warn!(error = %audit_err, "Audit write failed");
                self.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
            }
        }
    }
}

enum StreamOutcome {
    Completed,
    Cancelled,
    Failed(String),
}

fn stream_error_code(err: &InferenceError) -> &'static str {
    match err {
        InferenceError::Busy { .. } => "inference/busy",
        InferenceError::Cancelled => "inference/cancelled",
        InferenceError::NotReady(_) => "model/not_ready",
        InferenceError::Runtime(_) => "inference/runtime",
        InferenceError::InvalidInput(_) => "input/empty",
    }
}

/// Single-flight key: audio digest plus language hint.
fn flight_key(audio: &[u8], language_hint: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(audio);
    let digest = hasher.finalize();
    use base64::Engine;
    format!(
        "{}:{}",
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest),
        language_hint.unwrap_or("")
    )
}
