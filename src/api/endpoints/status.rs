//! Diagnostic surfaces: queue snapshots, metrics, audit tail, RAG state.

use axum::extract::{Query, State};
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiFailure;
use crate::api::types::{ApiContext, CorrelationId};
use crate::audit::AuditEntry;
use crate::metrics::MetricsSnapshot;
use crate::rag::coordinator::RagStatus;
use crate::scheduler::{QueueStatus, SchedulerStatus};

/// Hard ceiling on `/audit/recent?n=`.
const AUDIT_RECENT_MAX: usize = 500;

#[derive(Serialize)]
pub struct LlmStatusResponse {
    #[serde(flatten)]
    pub queue: QueueStatus,
}

/// `GET /llm/status`: generate-queue snapshot.
pub async fn llm_status(State(ctx): State<ApiContext>) -> Json<LlmStatusResponse> {
    Json(LlmStatusResponse {
        queue: ctx.scheduler.generate.status(),
    })
}

#[derive(Serialize)]
pub struct WorkersStatusResponse {
    #[serde(flatten)]
    pub queues: SchedulerStatus,
    pub overloaded: bool,
}

/// `GET /workers/status`: all queues.
pub async fn workers_status(State(ctx): State<ApiContext>) -> Json<WorkersStatusResponse> {
    let queues = ctx.scheduler.status();
    let overloaded = queues.overloaded();
    Json(WorkersStatusResponse { queues, overloaded })
}

/// `GET /metrics`: counters, percentiles, recent errors.
pub async fn metrics(State(ctx): State<ApiContext>) -> Json<MetricsSnapshot> {
    Json(ctx.metrics.snapshot())
}

#[derive(Deserialize)]
pub struct AuditRecentParams {
    pub n: Option<usize>,
}

#[derive(Serialize)]
pub struct AuditRecentResponse {
    pub entries: Vec<AuditEntry>,
}

/// `GET /audit/recent?n=`: last *n* audit entries, newest first.
pub async fn audit_recent(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    Query(params): Query<AuditRecentParams>,
) -> Result<Json<AuditRecentResponse>, ApiFailure> {
    let n = params.n.unwrap_or(50).clamp(1, AUDIT_RECENT_MAX);
    let entries = ctx
        .audit
        .recent(n)
        .map_err(|e| {
            crate::api::error::ApiError::Internal(e.to_string()).with_id(&correlation.0)
        })?;
    Ok(Json(AuditRecentResponse { entries }))
}

/// `GET /rag/status`: ready flag + counts.
pub async fn rag_status(State(ctx): State<ApiContext>) -> Json<RagStatus> {
    Json(ctx.rag.status())
}
