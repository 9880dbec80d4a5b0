//! Outermost tracking middleware.
//!
//! Issues the correlation id, injects it into request extensions for
//! handlers and audit, echoes it as `X-Request-Id`, and feeds the metrics
//! store with per-endpoint latency and error kinds.

use std::time::Instant;

use axum::http::{HeaderValue, Request};
use axum::middleware::Next;
use axum::response::Response;

use crate::api::error::ErrorCodeTag;
use crate::api::types::{ApiContext, CorrelationId};

pub async fn observe(mut req: Request<axum::body::Body>, next: Next) -> Response {
    let ctx = req.extensions().get::<ApiContext>().cloned();
    let endpoint = req.uri().path().to_string();

    let correlation_id = uuid::Uuid::new_v4().to_string();
    req.extensions_mut()
        .insert(CorrelationId(correlation_id.clone()));

    let start = Instant::now();
    let mut response = next.run(req).await;
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    if let Some(ctx) = ctx {
        let error_code = response
            .extensions()
            .get::<ErrorCodeTag>()
            .map(|tag| tag.0);
        ctx.metrics
            .record_request(&endpoint, latency_ms, error_code);
        if let Some(code) = error_code {
            ctx.metrics.record_error(
                &endpoint,
                code,
                response.status().as_str(),
                &correlation_id,
            );
        }
    }

    if let Ok(val) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert("X-Request-Id", val);
    }
    response
}
