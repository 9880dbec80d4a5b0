//! API error kinds with the structured JSON envelope.
//!
//! Every non-2xx response body is `{error_code, message, detail?,
//! request_id}`; `error_code` is the machine-readable kind the UI maps to
//! localised guidance.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::rag::RagError;
use crate::scheduler::InferenceError;

/// Longest error detail forwarded to clients or logs. Longer strings may
/// contain transcription fragments.
const MAX_DETAIL_LEN: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API key required")]
    AuthMissing,
    #[error("API key invalid")]
    AuthInvalid,
    #[error("server credentials misconfigured")]
    AuthMisconfigured,
    #[error("{0}")]
    InputEmpty(String),
    #[error("upload filename missing")]
    InputFilenameMissing,
    #[error("unsupported file extension: {0}")]
    InputExtension(String),
    #[error("request body exceeds the upload limit")]
    InputTooLarge,
    #[error("malformed request: {0}")]
    InputHeader(String),
    #[error("model not ready: {0}")]
    ModelNotReady(String),
    #[error("model dependency missing: {0}")]
    ModelDependencyMissing(String),
    #[error("inference capacity exhausted")]
    Busy { retry_after_secs: u64 },
    #[error("request cancelled")]
    Cancelled,
    #[error("inference failed")]
    InferenceRuntime(String),
    #[error("stream failed")]
    Stream(String),
    #[error("persistence failed")]
    StoragePersist(String),
    #[error("a download is already in progress")]
    DownloadInProgress,
    #[error("download failed: {0}")]
    DownloadFailed(String),
    #[error("server is not ready")]
    SystemNotReady(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AuthMissing => "auth/missing",
            Self::AuthInvalid => "auth/invalid",
            Self::AuthMisconfigured => "auth/misconfigured",
            Self::InputEmpty(_) => "input/empty",
            Self::InputFilenameMissing => "input/filename_missing",
            Self::InputExtension(_) => "input/extension",
            Self::InputTooLarge => "input/too_large",
            Self::InputHeader(_) => "input/header",
            Self::ModelNotReady(_) => "model/not_ready",
            Self::ModelDependencyMissing(_) => "model/dependency_missing",
            Self::Busy { .. } => "inference/busy",
            Self::Cancelled => "inference/cancelled",
            Self::InferenceRuntime(_) => "inference/runtime",
            Self::Stream(_) => "inference/stream",
            Self::StoragePersist(_) => "storage/persist",
            Self::DownloadInProgress => "download/in_progress",
            Self::DownloadFailed(_) => "download/failed",
            Self::SystemNotReady(_) => "system/not_ready",
            Self::RateLimited { .. } => "system/rate_limited",
            Self::Internal(_) => "system/internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::AuthMissing | Self::AuthInvalid | Self::AuthMisconfigured => {
                StatusCode::FORBIDDEN
            }
            Self::InputEmpty(_)
            | Self::InputFilenameMissing
            | Self::InputExtension(_)
            | Self::InputHeader(_) => StatusCode::BAD_REQUEST,
            Self::InputTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ModelNotReady(_)
            | Self::ModelDependencyMissing(_)
            | Self::Busy { .. }
            | Self::DownloadInProgress
            | Self::SystemNotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Cancelled
            | Self::InferenceRuntime(_)
            | Self::Stream(_)
            | Self::StoragePersist(_)
            | Self::DownloadFailed(_)
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> Option<String> {
        let raw = match self {
            Self::ModelNotReady(d)
            | Self::ModelDependencyMissing(d)
            | Self::InferenceRuntime(d)
            | Self::Stream(d)
            | Self::StoragePersist(d)
            | Self::DownloadFailed(d)
            | Self::SystemNotReady(d)
            | Self::InputExtension(d)
            | Self::InputHeader(d) => d.as_str(),
            Self::Busy { retry_after_secs } | Self::RateLimited { retry_after_secs } => {
                return Some(format!("retry after {retry_after_secs}s"));
            }
            _ => return None,
        };
        Some(clip_detail(raw))
    }

    fn retry_after(&self) -> Option<u64> {
        match self {
            Self::Busy { retry_after_secs } | Self::RateLimited { retry_after_secs } => {
                Some(*retry_after_secs)
            }
            _ => None,
        }
    }

    /// Attach the request's correlation id, producing a responder.
    pub fn with_id(self, request_id: &str) -> ApiFailure {
        ApiFailure {
            error: self,
            request_id: request_id.to_string(),
        }
    }
}

/// Truncate free-form detail so backend messages never leak transcription
/// fragments wholesale.
fn clip_detail(detail: &str) -> String {
    let mut out = detail.to_string();
    if out.len() > MAX_DETAIL_LEN {
        let mut end = MAX_DETAIL_LEN;
        while !out.is_char_boundary(end) {
            end -= 1;
        }
        out.truncate(end);
        out.push('…');
    }
    out
}

impl From<InferenceError> for ApiError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Busy { retry_after_secs } => Self::Busy { retry_after_secs },
            InferenceError::Cancelled => Self::Cancelled,
            InferenceError::NotReady(m) => Self::ModelNotReady(m),
            InferenceError::Runtime(m) => Self::InferenceRuntime(m),
            InferenceError::InvalidInput(m) => Self::InputEmpty(m),
        }
    }
}

impl From<RagError> for ApiError {
    fn from(err: RagError) -> Self {
        match err {
            RagError::Journal(e) => Self::StoragePersist(e.to_string()),
            RagError::Index(e) => Self::StoragePersist(e.to_string()),
            RagError::Embedding(m) => Self::InferenceRuntime(m),
        }
    }
}

/// The wire envelope.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub request_id: String,
}

/// An `ApiError` bound to its request id, ready to respond with.
#[derive(Debug)]
pub struct ApiFailure {
    pub error: ApiError,
    pub request_id: String,
}

/// Response extension the metrics middleware reads to attribute the error
/// kind without re-parsing the body.
#[derive(Debug, Clone)]
pub struct ErrorCodeTag(pub &'static str);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let code = self.error.error_code();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(
                error_code = code,
                request_id = %self.request_id,
                detail = %clip_detail(&self.error.to_string()),
                "API internal error"
            );
        }

        let envelope = ErrorEnvelope {
            error_code: code.to_string(),
            message: self.error.to_string(),
            detail: self.error.detail(),
            request_id: self.request_id.clone(),
        };

        let retry_after = self.error.retry_after();
        let mut response = (status, Json(envelope)).into_response();
        response.extensions_mut().insert(ErrorCodeTag(code));
        if let Some(secs) = retry_after {
            if let Ok(val) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("Retry-After", val);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn missing_key_is_403_with_code() {
        let response = ApiError::AuthMissing.with_id("req-1").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error_code"], "auth/missing");
        assert_eq!(json["request_id"], "req-1");
    }

    #[tokio::test]
    async fn too_large_is_413() {
        let response = ApiError::InputTooLarge.with_id("req-2").into_response();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error_code"], "input/too_large");
    }

    #[tokio::test]
    async fn busy_is_503_with_retry_after() {
        let response = ApiError::Busy {
            retry_after_secs: 15,
        }
        .with_id("req-3")
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "15");
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error_code"], "inference/busy");
        assert!(json["detail"].as_str().unwrap().contains("retry after"));
    }

    #[tokio::test]
    async fn rate_limited_is_429() {
        let response = ApiError::RateLimited {
            retry_after_secs: 60,
        }
        .with_id("req-4")
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("Retry-After").unwrap(), "60");
    }

    #[tokio::test]
    async fn internal_hides_detail_from_client() {
        let response = ApiError::Internal("lock poisoned at row 42".into())
            .with_id("req-5")
            .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), 4096).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error_code"], "system/internal");
        assert!(json.get("detail").is_none());
        assert_eq!(json["message"], "internal error");
    }

    #[test]
    fn inference_errors_map_to_kinds() {
        let api: ApiError = InferenceError::Busy {
            retry_after_secs: 5,
        }
        .into();
        assert_eq!(api.error_code(), "inference/busy");

        let api: ApiError = InferenceError::NotReady("no weights".into()).into();
        assert_eq!(api.error_code(), "model/not_ready");
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn long_detail_is_clipped() {
        let api = ApiError::InferenceRuntime("x".repeat(500));
        let detail = api.detail().unwrap();
        assert!(detail.len() <= MAX_DETAIL_LEN + "…".len());
    }
}
