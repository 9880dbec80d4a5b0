//! Audio upload → transcription.

use axum::extract::{Multipart, State};
use axum::http::HeaderMap;
use axum::Extension;
use axum::Json;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::api::error::{ApiError, ApiFailure};
use crate::api::types::{ApiContext, CorrelationId};
use crate::audit::{AuditAction, AuditOutcome};
use crate::config::AUDIO_EXTENSIONS;
use crate::metrics;

#[derive(Serialize)]
pub struct TranscribeResponse {
    pub text: String,
}

/// `POST /transcribe`: multipart with `file`, optional `language`.
///
/// Validation happens before any scheduler contact: an oversized or
/// malformed upload never claims a worker.
pub async fn transcribe(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<TranscribeResponse>, ApiFailure> {
    let correlation_id = correlation.0;

    let result = transcribe_inner(&ctx, &correlation_id, &headers, multipart).await;

    let (outcome, detail) = match &result {
        Ok(_) => (AuditOutcome::Success, None),
        Err(e) => (AuditOutcome::Failure, Some(e.error_code().to_string())),
    };
    if let Err(audit_err) = ctx.audit.record(
        AuditAction::Transcribe,
        "api",
        "/transcribe",
        &correlation_id,
        outcome,
        detail.as_deref(),
    ) {
        tracing::warn!(error = %audit_err, "Audit write failed");
        ctx.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
    }

    result
        .map(|text| Json(TranscribeResponse { text }))
        .map_err(|e| e.with_id(&correlation_id))
}

async fn transcribe_inner(
    ctx: &ApiContext,
    _correlation_id: &str,
    headers: &HeaderMap,
    mut multipart: Multipart,
) -> Result<String, ApiError> {
    // Fast reject on the declared size before reading anything.
    if let Some(len) = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if len > ctx.config.max_upload_bytes {
            return Err(ApiError::InputTooLarge);
        }
    }

    // Shed at the edge while any queue is saturated.
    if ctx.scheduler.status().overloaded() {
        return Err(ApiError::Busy {
            retry_after_secs: 10,
        });
    }

    let mut audio: Option<(Vec<u8>, String)> = None;
    let mut language: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::InputHeader(e.to_string()))?
    {
        let name = field.name().map(String::from);
        match name.as_deref() {
            Some("file") => {
                let filename = field
                    .file_name()
                    .map(String::from)
                    .ok_or(ApiError::InputFilenameMissing)?;
                let extension = filename
                    .rsplit('.')
                    .next()
                    .map(str::to_lowercase)
                    .filter(|ext| !ext.is_empty() && ext != &filename.to_lowercase());
                match extension {
                    Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => {}
                    other => {
                        return Err(ApiError::InputExtension(
                            other.unwrap_or_else(|| "none".to_string()),
                        ))
                    }
                }
                let bytes = field.bytes().await.map_err(|e| {
                    // The body-limit layer surfaces its 413 through the
                    // multipart read; everything else is a malformed or
                    // interrupted upload, not a size problem.
                    if e.status() == axum::http::StatusCode::PAYLOAD_TOO_LARGE {
                        ApiError::InputTooLarge
                    } else {
                        ApiError::InputHeader(format!("upload read failed: {e}"))
                    }
                })?;
                audio = Some((bytes.to_vec(), filename));
            }
            Some("language") => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| ApiError::InputHeader(e.to_string()))?;
                if !value.trim().is_empty() {
                    language = Some(value.trim().to_string());
                }
            }
            _ => {}
        }
    }

    let (audio, filename) = audio.ok_or(ApiError::InputFilenameMissing)?;
    if audio.is_empty() {
        return Err(ApiError::InputEmpty("uploaded file is empty".into()));
    }
    if audio.len() > ctx.config.max_upload_bytes {
        return Err(ApiError::InputTooLarge);
    }

    let text = ctx
        .pipeline
        .transcribe(audio, filename, language, CancellationToken::new())
        .await?;
    Ok(text)
}
