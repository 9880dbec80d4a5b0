//! Consultation persistence, search, and export.

use axum::extract::State;
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::{ApiError, ApiFailure};
use crate::api::types::{ApiContext, CorrelationId};
use crate::audit::{AuditAction, AuditOutcome};
use crate::journal::ConsultationRecord;
use crate::metrics;
use crate::rag::ConsultationHit;

/// `top_k` clipping bounds.
const TOP_K_MIN: usize = 1;
const TOP_K_MAX: usize = 50;
const TOP_K_DEFAULT: usize = 5;

fn audit_completed(
    ctx: &ApiContext,
    action: AuditAction,
    resource: &str,
    correlation_id: &str,
    result: &Result<impl Sized, ApiError>,
) {
    let (outcome, detail) = match result {
        Ok(_) => (AuditOutcome::Success, None),
        Err(e) => (AuditOutcome::Failure, Some(e.error_code().to_string())),
    };
    if let Err(audit_err) = ctx.audit.record(
        action,
        "api",
        resource,
        correlation_id,
        outcome,
        detail.as_deref(),
    ) {
        tracing::warn!(error = %audit_err, "Audit write failed");
        ctx.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
    }
}

// ── Save ─────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SaveRequest {
    pub smartnote: String,
    pub transcription: Option<String>,
    pub dentist_name: Option<String>,
    pub consultation_type: Option<String>,
    pub patient_id: Option<String>,
}

#[derive(Serialize)]
pub struct SaveResponse {
    pub digest: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// `POST /consultations/save`
pub async fn save(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Json<SaveResponse>, ApiFailure> {
    let correlation_id = correlation.0;
    let result = save_inner(&ctx, &correlation_id, &body).await;
    audit_completed(
        &ctx,
        AuditAction::ConsultationSave,
        "/consultations/save",
        &correlation_id,
        &result,
    );
    result
        .map(Json)
        .map_err(|e| e.with_id(&correlation_id))
}

async fn save_inner(
    ctx: &ApiContext,
    correlation_id: &str,
    body: &[u8],
) -> Result<SaveResponse, ApiError> {
    let request: SaveRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InputHeader(format!("invalid JSON body: {e}")))?;

    if request.smartnote.trim().is_empty() {
        return Err(ApiError::InputEmpty("smartnote must not be empty".into()));
    }

    let record = ConsultationRecord::new(
        correlation_id,
        request.patient_id,
        request.dentist_name.as_deref().unwrap_or("unspecified"),
        request.consultation_type.as_deref().unwrap_or("general"),
        request.transcription.as_deref().unwrap_or(""),
        request.smartnote.trim(),
    );
    let digest = record.digest.clone();
    let created_at = record.created_at;

    ctx.rag.save_consultation(&record).await?;

    Ok(SaveResponse { digest, created_at })
}

// ── Search ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: Option<usize>,
}

#[derive(Serialize)]
pub struct SearchResponse {
    pub results: Vec<ConsultationHit>,
}

/// `POST /consultations/search`
pub async fn search(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Json<SearchResponse>, ApiFailure> {
    let correlation_id = correlation.0;
    let result = search_inner(&ctx, &body).await;
    audit_completed(
        &ctx,
        AuditAction::ConsultationSearch,
        "/consultations/search",
        &correlation_id,
        &result,
    );
    result
        .map(|results| Json(SearchResponse { results }))
        .map_err(|e| e.with_id(&correlation_id))
}

async fn search_inner(ctx: &ApiContext, body: &[u8]) -> Result<Vec<ConsultationHit>, ApiError> {
    let request: SearchRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InputHeader(format!("invalid JSON body: {e}")))?;

    let query = request.query.trim();
    if query.is_empty() {
        return Err(ApiError::InputEmpty("query must not be empty".into()));
    }
    let top_k = request
        .top_k
        .unwrap_or(TOP_K_DEFAULT)
        .clamp(TOP_K_MIN, TOP_K_MAX);

    Ok(ctx.rag.search_consultations(query, top_k).await?)
}

// ── Export ───────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ExportResponse {
    pub consultations: Vec<ConsultationRecord>,
}

/// `GET /consultations/export`: full dump, insertion order.
pub async fn export(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
) -> Result<Json<ExportResponse>, ApiFailure> {
    let correlation_id = correlation.0;
    let result = ctx.rag.export().map_err(ApiError::from);
    audit_completed(
        &ctx,
        AuditAction::ConsultationExport,
        "/consultations/export",
        &correlation_id,
        &result,
    );
    result
        .map(|consultations| Json(ExportResponse { consultations }))
        .map_err(|e| e.with_id(&correlation_id))
}
