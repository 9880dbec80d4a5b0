//! Model acquisition contract for the download collaborator.
//!
//! The core only tracks one download at a time and reports progress; the
//! desktop shell drives the actual fetch UI. Files land under `models/` via
//! a `.part` scratch path and a final rename.

use std::path::PathBuf;
use std::sync::Mutex;

use axum::extract::State;
use axum::Extension;
use axum::Json;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiFailure};
use crate::api::types::{ApiContext, CorrelationId};
use crate::audit::{AuditAction, AuditOutcome};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadPhase {
    Idle,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DownloadState {
    pub status: DownloadPhase,
    /// 0.0..=1.0 when the server reports a content length, else 0.
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Single-download tracker behind a mutex.
pub struct DownloadTracker {
    state: Mutex<DownloadState>,
}

impl DownloadTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DownloadState {
                status: DownloadPhase::Idle,
                progress: 0.0,
                file_name: None,
                error: None,
            }),
        }
    }

    /// Claim the tracker for a new download.
    fn begin(&self, file_name: &str) -> Result<(), ApiError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ApiError::Internal("download lock".into()))?;
        if state.status == DownloadPhase::InProgress {
            return Err(ApiError::DownloadInProgress);
        }
        *state = DownloadState {
            status: DownloadPhase::InProgress,
            progress: 0.0,
            file_name: Some(file_name.to_string()),
            error: None,
        };
        Ok(())
    }

    fn set_progress(&self, progress: f32) {
        if let Ok(mut state) = self.state.lock() {
            state.progress = progress.clamp(0.0, 1.0);
        }
    }

    fn complete(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.status = DownloadPhase::Completed;
            state.progress = 1.0;
        }
    }

    fn fail(&self, error: String) {
        if let Ok(mut state) = self.state.lock() {
            state.status = DownloadPhase::Failed;
            state.error = Some(error);
        }
    }

    pub fn snapshot(&self) -> DownloadState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(DownloadState {
                status: DownloadPhase::Failed,
                progress: 0.0,
                file_name: None,
                error: Some("download lock poisoned".to_string()),
            })
    }
}

impl Default for DownloadTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
pub struct DownloadRequest {
    pub url: String,
    pub file_name: String,
}

#[derive(Serialize)]
pub struct DownloadAccepted {
    pub accepted: bool,
    pub file_name: String,
}

/// `POST /setup/download`: start fetching one model file.
pub async fn start_download(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Json<DownloadAccepted>, ApiFailure> {
    let correlation_id = correlation.0;
    let result = start_download_inner(&ctx, &body).await;

    let (outcome, detail) = match &result {
        Ok(_) => (AuditOutcome::Success, None),
        Err(e) => (AuditOutcome::Failure, Some(e.error_code().to_string())),
    };
    if let Err(audit_err) = ctx.audit.record(
        AuditAction::ModelDownload,
        "api",
        "/setup/download",
        &correlation_id,
        outcome,
        detail.as_deref(),
    ) {
        tracing::warn!(error = %audit_err, "Audit write failed");
        ctx.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
    }

    result
        .map(|file_name| {
            Json(DownloadAccepted {
                accepted: true,
                file_name,
            })
        })
        .map_err(|e| e.with_id(&correlation_id))
}

async fn start_download_inner(ctx: &ApiContext, body: &[u8]) -> Result<String, ApiError> {
    let request: DownloadRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InputHeader(format!("invalid JSON body: {e}")))?;

    let file_name = sanitize_file_name(&request.file_name)?;
    ctx.downloads.begin(&file_name)?;

    let tracker = std::sync::Arc::clone(&ctx.downloads);
    let target = ctx.config.models_dir().join(&file_name);
    let url = request.url;
    let name = file_name.clone();

    tokio::spawn(async move {
        match fetch_to_file(&url, &target, &tracker).await {
            Ok(()) => {
                tracing::info!(file = %name, "Model download complete");
                tracker.complete();
            }
            Err(e) => {
                tracing::error!(file = %name, error = %e, "Model download failed");
                tracker.fail(e);
            }
        }
    });

    Ok(file_name)
}

/// `GET /setup/progress`
pub async fn progress(State(ctx): State<ApiContext>) -> Json<DownloadState> {
    Json(ctx.downloads.snapshot())
}

/// Reject path traversal in caller-supplied file names.
fn sanitize_file_name(raw: &str) -> Result<String, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::InputEmpty("file_name must not be empty".into()));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ApiError::InputHeader(
            "file_name must be a bare file name".into(),
        ));
    }
    Ok(name.to_string())
}

async fn fetch_to_file(
    url: &str,
    target: &PathBuf,
    tracker: &DownloadTracker,
) -> Result<(), String> {
    let response = reqwest::get(url).await.map_err(|e| e.to_string())?;
    if !response.status().is_success() {
        return Err(format!("server returned {}", response.status()));
    }

    let total = response.content_length();
    let part_path = target.with_extension("part");
    let mut file = tokio::fs::File::create(&part_path)
        .await
        .map_err(|e| e.to_string())?;

    let mut downloaded: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        tokio::io::AsyncWriteExt::write_all(&mut file, &chunk)
            .await
            .map_err(|e| e.to_string())?;
        downloaded += chunk.len() as u64;
        if let Some(total) = total {
            if total > 0 {
                tracker.set_progress(downloaded as f32 / total as f32);
            }
        }
    }

    tokio::io::AsyncWriteExt::flush(&mut file)
        .await
        .map_err(|e| e.to_string())?;
    drop(file);
    tokio::fs::rename(&part_path, target)
        .await
        .map_err(|e| e.to_string())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_starts_idle() {
        let tracker = DownloadTracker::new();
        assert_eq!(tracker.snapshot().status, DownloadPhase::Idle);
    }

    #[test]
    fn begin_twice_is_in_progress_error() {
        let tracker = DownloadTracker::new();
        tracker.begin("model.gguf").unwrap();
        let err = tracker.begin("other.gguf").unwrap_err();
        assert_eq!(err.error_code(), "download/in_progress");
    }

    #[test]
    fn completed_tracker_accepts_new_download() {
        let tracker = DownloadTracker::new();
        tracker.begin("model.gguf").unwrap();
        tracker.complete();
        assert!(tracker.begin("next.gguf").is_ok());
    }

    #[test]
    fn failure_is_reported_in_snapshot() {
        let tracker = DownloadTracker::new();
        tracker.begin("model.gguf").unwrap();
        tracker.fail("connection reset".into());
        let state = tracker.snapshot();
        assert_eq!(state.status, DownloadPhase::Failed);
        assert_eq!(state.error.as_deref(), Some("connection reset"));
    }

    #[test]
    fn file_names_with_traversal_are_rejected() {
        assert!(sanitize_file_name("model.gguf").is_ok());
        assert!(sanitize_file_name("../etc/passwd").is_err());
        assert!(sanitize_file_name("a/b.gguf").is_err());
        assert!(sanitize_file_name("  ").is_err());
    }

    #[test]
    fn progress_clamps_to_unit_interval() {
        let tracker = DownloadTracker::new();
        tracker.begin("m.gguf").unwrap();
        tracker.set_progress(1.7);
        assert_eq!(tracker.snapshot().progress, 1.0);
    }
}
