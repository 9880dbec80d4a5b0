//! API-key authentication.
//!
//! Every endpoint except the liveness probe requires `X-API-Key`. The
//! comparison is constant-time. In development mode with no key configured
//! the check is waived; production refuses to start without one, so a
//! missing key here can only mean misconfiguration.

use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, CorrelationId};
use crate::audit::{AuditAction, AuditOutcome};
use crate::config::{Config, RuntimeMode};
use crate::metrics;

pub async fn require_api_key(req: Request<axum::body::Body>, next: Next) -> Response {
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

    match validate_key(&ctx.config, req.headers()) {
        Ok(()) => next.run(req).await,
        Err(err) => {
            let path = req.uri().path().to_string();
            if let Err(audit_err) = ctx.audit.record(
                AuditAction::Auth,
                "api",
                &path,
                &correlation_id,
                AuditOutcome::Failure,
                Some(err.error_code()),
            ) {
                tracing::warn!(error = %audit_err, "Audit write failed");
                ctx.metrics.inc_counter(metrics::AUDIT_WRITE_FAILURES);
            }
            err.with_id(&correlation_id).into_response()
        }
    }
}

fn validate_key(config: &Config, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = config.api_key.as_deref() else {
        return match config.mode {
            // Startup enforces a key in production; reaching this state
            // means the configuration changed underneath us.
            RuntimeMode::Production => Err(ApiError::AuthMisconfigured),
            RuntimeMode::Development => Ok(()),
        };
    };

    let provided = headers
        .get("X-API-Key")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::AuthMissing)?;

    if provided.as_bytes().ct_eq(expected.as_bytes()).into() {
        Ok(())
    } else {
        Err(ApiError::AuthInvalid)
    }
}
