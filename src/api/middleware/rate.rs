//! Per-client rate limiting.
//!
//! One token bucket per `(client host, endpoint group)`. Exceeding the
//! configured rate returns 429 with a Retry-After hint; other clients'
//! buckets are untouched.

use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, CorrelationId};

/// Endpoint group the bucket is keyed by.
pub fn endpoint_group(path: &str) -> &'static str {
    if path.starts_with("/transcribe") || path.starts_with("/summarize") {
        "inference"
    } else if path.starts_with("/consultations") {
        "consultations"
    } else if path.starts_with("/setup") {
        "setup"
    } else {
        "status"
    }
}

pub async fn limit(req: Request<axum::body::Body>, next: Next) -> Response {
    let Some(ctx) = req.extensions().get::<ApiContext>().cloned() else {
        return ApiError::Internal("missing API context".into())
            .with_id("unknown")
            .into_response();
    };
    let correlation_id = req
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let host = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "local".to_string());
    let group = endpoint_group(req.uri().path());

    // MutexGuard must drop before the await below.
    let verdict = {
        match ctx.rate_limiter.lock() {
            Ok(mut limiter) => limiter.check(&host, group),
            Err(_) => {
                return ApiError::Internal("rate limiter lock".into())
                    .with_id(&correlation_id)
                    .into_response()
            }
        }
    };

    match verdict {
        Ok(()) => next.run(req).await,
        Err(retry_after_secs) => {
            tracing::debug!(host = %host, group, "Rate limit exceeded");
            ApiError::RateLimited { retry_after_secs }
                .with_id(&correlation_id)
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_map_to_groups() {
        assert_eq!(endpoint_group("/transcribe"), "inference");
        assert_eq!(endpoint_group("/summarize-stream-rag"), "inference");
        assert_eq!(endpoint_group("/consultations/search"), "consultations");
        assert_eq!(endpoint_group("/setup/progress"), "setup");
        assert_eq!(endpoint_group("/health"), "status");
        assert_eq!(endpoint_group("/metrics"), "status");
    }
}
