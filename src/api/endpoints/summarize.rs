//! Text → SmartNote, unary and SSE, plain and RAG-augmented.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Extension;
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::api::error::{ApiError, ApiFailure};
use crate::api::types::{ApiContext, CorrelationId};
use crate::audit::{AuditAction, AuditOutcome};
use crate::metrics;
use crate::pipeline::StreamEvent;

#[derive(Deserialize)]
pub struct SummarizeRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct SummarizeResponse {
    pub summary: String,
    pub rag_enhanced: bool,
}

/// `POST /summarize`
pub async fn summarize(
    state: State<ApiContext>,
    correlation: Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Json<SummarizeResponse>, ApiFailure> {
    summarize_unary(state, correlation, body, false).await
}

/// `POST /summarize-rag`
pub async fn summarize_rag(
    state: State<ApiContext>,
    correlation: Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Json<SummarizeResponse>, ApiFailure> {
    summarize_unary(state, correlation, body, true).await
}

async fn summarize_unary(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    body: axum::body::Bytes,
    use_rag: bool,
) -> Result<Json<SummarizeResponse>, ApiFailure> {
    let correlation_id = correlation.0;
    let result = summarize_unary_inner(&ctx, &correlation_id, &body, use_rag).await;

    let (outcome, detail) = match &result {
        Ok(_) => (AuditOutcome::Success, None),
        Err(e) => (AuditOutcome::Failure, Some(e.error_code().to_string())),
    };
    if let Err(audit_err) = ctx.audit.record(
        AuditAction::Summarize,
        "api",
        if use_rag { "/summarize-rag" } else { "/summarize" },
        &correlation_id,
        outcome,
        detail.as_deref(),
    ) {
        tracing::warn!(error = %audit_err, "Audit write failed");
        ctx.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
    }

    result
        .map(|note| {
            Json(SummarizeResponse {
                summary: note.summary,
                rag_enhanced: note.rag_enhanced,
            })
        })
        .map_err(|e| e.with_id(&correlation_id))
}

async fn summarize_unary_inner(
    ctx: &ApiContext,
    correlation_id: &str,
    body: &[u8],
    use_rag: bool,
) -> Result<crate::pipeline::SmartNote, ApiError> {
    let text = parse_text_body(body)?;

    if ctx.scheduler.status().overloaded() {
        return Err(ApiError::Busy {
            retry_after_secs: 10,
        });
    }

    Ok(ctx
        .pipeline
        .summarize(&text, use_rag, correlation_id, CancellationToken::new())
        .await?)
}

/// `POST /summarize-stream`
pub async fn summarize_stream(
    state: State<ApiContext>,
    correlation: Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Response, ApiFailure> {
    summarize_streaming(state, correlation, body, false).await
}

/// `POST /summarize-stream-rag`
pub async fn summarize_stream_rag(
    state: State<ApiContext>,
    correlation: Extension<CorrelationId>,
    body: axum::body::Bytes,
) -> Result<Response, ApiFailure> {
    summarize_streaming(state, correlation, body, true).await
}

/// Streaming variant. The pipeline owns the terminal audit entry (written
/// at stream end with the true outcome, after the 200 status has gone out);
/// errors that occur mid-stream are framed as a terminal SSE event rather
/// than a status change.
async fn summarize_streaming(
    State(ctx): State<ApiContext>,
    Extension(correlation): Extension<CorrelationId>,
    body: axum::body::Bytes,
    use_rag: bool,
) -> Result<Response, ApiFailure> {
    let correlation_id = correlation.0;
    let resource = if use_rag {
        "/summarize-stream-rag"
    } else {
        "/summarize-stream"
    };

    let text = match parse_text_body(&body) {
        Ok(text) => text,
        Err(e) => return Err(audit_stream_refusal(&ctx, resource, &correlation_id, e)),
    };
    if ctx.scheduler.status().overloaded() {
        let busy = ApiError::Busy {
            retry_after_secs: 10,
        };
        return Err(audit_stream_refusal(&ctx, resource, &correlation_id, busy));
    }

    let cancel = CancellationToken::new();
    let rx = ctx
        .pipeline
        .summarize_stream(
            text,
            use_rag,
            correlation_id.clone(),
            resource.to_string(),
            cancel,
        )
        .await;

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv()
            .await
            .map(|event| (Ok::<Event, Infallible>(to_sse_event(event)), rx))
    });

    let mut response = Sse::new(stream).into_response();
    let headers = response.headers_mut();
    headers.insert(
        "Cache-Control",
        axum::http::HeaderValue::from_static("no-cache"),
    );
    // Disable proxy buffering so each event flushes to the client.
    headers.insert(
        "X-Accel-Buffering",
        axum::http::HeaderValue::from_static("no"),
    );
    Ok(response)
}

/// A stream request refused before any event went out still produces its
/// one completed audit entry here.
fn audit_stream_refusal(
    ctx: &ApiContext,
    resource: &str,
    correlation_id: &str,
    error: ApiError,
) -> ApiFailure {
    if let Err(audit_err) = ctx.audit.record(
        AuditAction::SummarizeStream,
        "api",
        resource,
        correlation_id,
        AuditOutcome::Failure,
        Some(error.error_code()),
    ) {
        tracing::warn!(error = %audit_err, "Audit write failed");
        ctx.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
    }
    error.with_id(correlation_id)
}

fn to_sse_event(event: StreamEvent) -> Event {
    match event {
        StreamEvent::Meta { rag_enhanced } => {
            Event::default().data(serde_json::json!({ "rag_enhanced": rag_enhanced }).to_string())
        }
        StreamEvent::Chunk(chunk) => {
            Event::default().data(serde_json::json!({ "chunk": chunk }).to_string())
        }
        StreamEvent::Error { code, message } => Event::default().data(
            serde_json::json!({ "error_code": code, "message": message }).to_string(),
        ),
        StreamEvent::Done => Event::default().data("[DONE]"),
    }
}

/// Parse `{"text": ...}`, producing envelope errors for malformed bodies.
fn parse_text_body(body: &[u8]) -> Result<String, ApiError> {
    let request: SummarizeRequest = serde_json::from_slice(body)
        .map_err(|e| ApiError::InputHeader(format!("invalid JSON body: {e}")))?;
    let text = request.text.trim().to_string();
    if text.is_empty() {
        return Err(ApiError::InputEmpty("text must not be empty".into()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_body_parses() {
        let text = parse_text_body(br#"{"text":"Douleur molaire 36."}"#).unwrap();
        assert_eq!(text, "Douleur molaire 36.");
    }

    #[test]
    fn empty_text_is_input_empty() {
        let err = parse_text_body(br#"{"text":"   "}"#).unwrap_err();
        assert_eq!(err.error_code(), "input/empty");
    }

    #[test]
    fn malformed_json_is_input_header() {
        let err = parse_text_body(b"{not json").unwrap_err();
        assert_eq!(err.error_code(), "input/header");
    }

    #[test]
    fn done_event_is_literal_sentinel() {
        let event = to_sse_event(StreamEvent::Done);
        let framed = format!("{:?}", event);
        assert!(framed.contains("[DONE]"));
    }
}
