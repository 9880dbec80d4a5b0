//! Route table and middleware layering.
//!
//! Middleware stack (outermost → innermost):
//! 1. CORS → 2. Extension(ApiContext) → 3. tracking (correlation id +
//! metrics) → 4. rate limiter → 5. API-key auth (everything but `/health`)
//! → handler.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::endpoints::{consultations, health, setup, status, summarize, transcribe};
use super::middleware;
use super::types::ApiContext;

pub fn api_router(ctx: ApiContext) -> Router {
    // Liveness probe: rate-limited and tracked, never authenticated.
    let public = Router::new()
        .route("/health", get(health::check))
        .with_state(ctx.clone());

    let protected = Router::new()
        .route("/llm/status", get(status::llm_status))
        .route("/metrics", get(status::metrics))
        .route("/workers/status", get(status::workers_status))
        .route("/audit/recent", get(status::audit_recent))
        .route("/rag/status", get(status::rag_status))
        .route(
            "/transcribe",
            post(transcribe::transcribe)
                .layer(DefaultBodyLimit::max(ctx.config.max_upload_bytes)),
        )
        .route("/summarize", post(summarize::summarize))
        .route("/summarize-stream", post(summarize::summarize_stream))
        .route("/summarize-rag", post(summarize::summarize_rag))
        .route(
            "/summarize-stream-rag",
            post(summarize::summarize_stream_rag),
        )
        .route("/consultations/save", post(consultations::save))
        .route("/consultations/search", post(consultations::search))
        .route("/consultations/export", get(consultations::export))
        .route("/setup/download", post(setup::start_download))
        .route("/setup/progress", get(setup::progress))
        .with_state(ctx.clone())
        .layer(axum::middleware::from_fn(
            middleware::auth::require_api_key,
        ));

    Router::new()
        .merge(public)
        .merge(protected)
        // Layers apply bottom-to-top: rate sits inside tracking, which sits
        // inside the context Extension all middleware reads.
        .layer(axum::middleware::from_fn(middleware::rate::limit))
        .layer(axum::middleware::from_fn(middleware::track::observe))
        .layer(axum::Extension(ctx))
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;
    use tokio_util::sync::CancellationToken;

    use crate::audit::{AuditAction, AuditLog, AuditOutcome};
    use crate::backends::embedder::HashEmbedder;
    use crate::backends::{GenerationParams, ModelError, SpeechToText, TextGenerator};
    use crate::config::Config;
    use crate::journal::JournalStore;
    use crate::metrics::Metrics;
    use crate::pipeline::SmartNotePipeline;
    use crate::rag::RagStore;
    use crate::scheduler::{Scheduler, SchedulerConfig};

    const TEST_KEY: &str = "test-key";

    struct StubSpeech;

    impl SpeechToText for StubSpeech {
        fn transcribe(
            &self,
            _audio: &[u8],
            _filename: &str,
            _language_hint: Option<&str>,
        ) -> Result<String, ModelError> {
            Ok("douleur molaire 36".to_string())
        }
    }

    struct StubGenerator {
        delay: Duration,
    }

    impl TextGenerator for StubGenerator {
        fn generate(
            &self,
            _system: &str,
            _prompt: &str,
            _params: &GenerationParams,
        ) -> Result<String, ModelError> {
            std::thread::sleep(self.delay);
            Ok("## Motif de consultation\nDouleur molaire 36.".to_string())
        }

        fn generate_streaming(
            &self,
            _system: &str,
            _prompt: &str,
            _params: &GenerationParams,
            token_tx: std::sync::mpsc::Sender<String>,
            cancel: &CancellationToken,
        ) -> Result<String, ModelError> {
            let mut full = String::new();
            for word in ["## Motif ", "de ", "consultation\n", "Douleur ", "molaire 36."] {
                if cancel.is_cancelled() {
                    break;
                }
                std::thread::sleep(self.delay);
                full.push_str(word);
                if token_tx.send(word.to_string()).is_err() {
                    break;
                }
            }
            Ok(full)
        }
    }

    struct TestApp {
        _dir: tempfile::TempDir,
        ctx: ApiContext,
        audit_path: std::path::PathBuf,
    }

    impl TestApp {
        fn router(&self) -> Router {
            api_router(self.ctx.clone())
        }

        fn audit_entries(&self) -> Vec<crate::audit::AuditEntry> {
            AuditLog::open(&self.audit_path).unwrap().recent(100).unwrap()
        }
    }

    fn test_app_with(scheduler_config: SchedulerConfig, generator_delay: Duration) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config::for_data_dir(dir.path()).unwrap());
        let audit_path = config.audit_path();

        let journal = Arc::new(JournalStore::open(&config.journal_path()).unwrap());
        let audit = Arc::new(AuditLog::open(&audit_path).unwrap());
        let metrics = Arc::new(Metrics::new());
        let scheduler = Arc::new(Scheduler::new(scheduler_config));
        let rag = Arc::new(
            RagStore::open(
                &config.rag_data_dir(),
                journal,
                Arc::new(HashEmbedder::new()),
                Arc::clone(&scheduler.embed),
                Arc::clone(&audit),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let pipeline = Arc::new(SmartNotePipeline::new(
            Arc::clone(&scheduler),
            Arc::new(StubSpeech),
            Arc::new(StubGenerator {
                delay: generator_delay,
            }),
            Arc::clone(&rag),
            Arc::clone(&audit),
            Arc::clone(&metrics),
            config.max_text_chars,
        ));

        let ctx = ApiContext::new(config, pipeline, rag, scheduler, audit, metrics);
        TestApp {
            _dir: dir,
            ctx,
            audit_path,
        }
    }

    fn test_app() -> TestApp {
        test_app_with(SchedulerConfig::default(), Duration::from_millis(1))
    }

    fn request(method: &str, uri: &str, key: Option<&str>, body: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(k) = key {
            builder = builder.header("X-API-Key", k);
        }
        if body.is_some() {
            builder = builder.header("Content-Type", "application/json");
        }
        builder
            .body(body.map(|b| Body::from(b.to_string())).unwrap_or_default())
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 10 * 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn health_needs_no_key() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request("GET", "/health", None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn missing_key_is_403_and_audited() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request(
                "POST",
                "/summarize",
                None,
                Some(r#"{"text":"Douleur molaire 36 depuis 3 jours."}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(response.headers().contains_key("X-Request-Id"));
        let json = json_body(response).await;
        assert_eq!(json["error_code"], "auth/missing");

        let entries = app.audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Failure);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn wrong_key_is_403_invalid() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request("GET", "/metrics", Some("nope"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let json = json_body(response).await;
        assert_eq!(json["error_code"], "auth/invalid");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn summarize_returns_note_with_one_audit_entry() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request(
                "POST",
                "/summarize",
                Some(TEST_KEY),
                Some(r#"{"text":"Douleur molaire 36 depuis 3 jours."}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let request_id = response
            .headers()
            .get("X-Request-Id")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        let json = json_body(response).await;
        assert!(!json["summary"].as_str().unwrap().is_empty());
        assert_eq!(json["rag_enhanced"], false);

        let summarize_entries: Vec<_> = app
            .audit_entries()
            .into_iter()
            .filter(|e| e.action == AuditAction::Summarize)
            .collect();
        assert_eq!(summarize_entries.len(), 1);
        assert_eq!(summarize_entries[0].outcome, AuditOutcome::Success);
        assert_eq!(summarize_entries[0].correlation_id, request_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn empty_text_is_400() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request(
                "POST",
                "/summarize",
                Some(TEST_KEY),
                Some(r#"{"text":"  "}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error_code"], "input/empty");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn oversize_declared_upload_is_413_before_any_submission() {
        let app = test_app();
        let boundary = "------------------------abcdef";
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/transcribe")
                    .header("X-API-Key", TEST_KEY)
                    .header(
                        "Content-Type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .header("Content-Length", (150 * 1024 * 1024).to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let json = json_body(response).await;
        assert_eq!(json["error_code"], "input/too_large");

        // The speech queue never saw a submission.
        assert_eq!(app.ctx.scheduler.speech.status().running, 0);
        assert_eq!(app.ctx.scheduler.speech.status().waiting, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transcribe_rejects_unknown_extension() {
        let app = test_app();
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"notes.pdf\"\r\nContent-Type: application/pdf\r\n\r\nbinary\r\n--{boundary}--\r\n"
        );
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/transcribe")
                    .header("X-API-Key", TEST_KEY)
                    .header(
                        "Content-Type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert_eq!(json["error_code"], "input/extension");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transcribe_accepts_wav_upload() {
        let app = test_app();
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"consult.wav\"\r\nContent-Type: audio/wav\r\n\r\nRIFFfakeaudio\r\n--{boundary}--\r\n"
        );
        let response = app
            .router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/transcribe")
                    .header("X-API-Key", TEST_KEY)
                    .header(
                        "Content-Type",
                        format!("multipart/form-data; boundary={boundary}"),
                    )
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["text"], "douleur molaire 36");

        let entries: Vec<_> = app
            .audit_entries()
            .into_iter()
            .filter(|e| e.action == AuditAction::Transcribe)
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].outcome, AuditOutcome::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn saturated_generator_sheds_second_stream_with_busy() {
        let app = test_app_with(
            SchedulerConfig {
                wait_cap: 0,
                ..SchedulerConfig::default()
            },
            Duration::from_millis(50),
        );

        let router = app.router();
        let first = {
            let router = router.clone();
            tokio::spawn(async move {
                router
                    .oneshot(request(
                        "POST",
                        "/summarize-stream",
                        Some(TEST_KEY),
                        Some(r#"{"text":"Douleur molaire 36."}"#),
                    ))
                    .await
                    .unwrap()
            })
        };
        // Let the first stream claim the generator.
        tokio::time::sleep(Duration::from_millis(60)).await;

        let second = router
            .oneshot(request(
                "POST",
                "/summarize-stream",
                Some(TEST_KEY),
                Some(r#"{"text":"Douleur molaire 36."}"#),
            ))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = json_body(second).await;
        assert_eq!(json["error_code"], "inference/busy");

        let first = first.await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let body = to_bytes(first.into_body(), 1024 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("[DONE]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stream_rag_without_knowledge_declares_fallback_first() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request(
                "POST",
                "/summarize-stream-rag",
                Some(TEST_KEY),
                Some(r#"{"text":"Douleur molaire 36."}"#),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/event-stream"
        );

        let body = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let first_event = text
            .split("\n\n")
            .next()
            .expect("at least one SSE event");
        assert_eq!(first_event, r#"data: {"rag_enhanced":false}"#);
        assert!(text.trim_end().ends_with("data: [DONE]"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn save_then_search_and_export_round_trip() {
        let app = test_app();
        let router = app.router();

        let save = router
            .clone()
            .oneshot(request(
                "POST",
                "/consultations/save",
                Some(TEST_KEY),
                Some(
                    r#"{"smartnote":"Extraction dent 48 sous anesthésie locale.","dentist_name":"Dr. Moreau","consultation_type":"surgery"}"#,
                ),
            ))
            .await
            .unwrap();
        assert_eq!(save.status(), StatusCode::OK);
        let saved = json_body(save).await;
        assert_eq!(saved["digest"].as_str().unwrap().len(), 64);

        let search = router
            .clone()
            .oneshot(request(
                "POST",
                "/consultations/search",
                Some(TEST_KEY),
                Some(r#"{"query":"extraction dent 48","top_k":3}"#),
            ))
            .await
            .unwrap();
        assert_eq!(search.status(), StatusCode::OK);
        let results = json_body(search).await;
        let hits = results["results"].as_array().unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0]["note"].as_str().unwrap().contains("dent 48"));
        let score = hits[0]["score"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&score));

        let export = router
            .oneshot(request("GET", "/consultations/export", Some(TEST_KEY), None))
            .await
            .unwrap();
        assert_eq!(export.status(), StatusCode::OK);
        let exported = json_body(export).await;
        assert_eq!(exported["consultations"].as_array().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_surfaces_respond() {
        let app = test_app();
        let router = app.router();

        for uri in ["/llm/status", "/workers/status", "/rag/status", "/metrics"] {
            let response = router
                .clone()
                .oneshot(request("GET", uri, Some(TEST_KEY), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK, "{uri}");
        }

        let response = router
            .oneshot(request("GET", "/audit/recent?n=5", Some(TEST_KEY), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limit_returns_429_with_code() {
        let app = test_app();
        {
            let mut limiter = app.ctx.rate_limiter.lock().unwrap();
            *limiter = crate::api::types::RateLimiter::new(2, 64);
        }
        let router = app.router();

        for _ in 0..2 {
            let ok = router
                .clone()
                .oneshot(request("GET", "/metrics", Some(TEST_KEY), None))
                .await
                .unwrap();
            assert_eq!(ok.status(), StatusCode::OK);
        }
        let limited = router
            .oneshot(request("GET", "/metrics", Some(TEST_KEY), None))
            .await
            .unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().contains_key("Retry-After"));
        let json = json_body(limited).await;
        assert_eq!(json["error_code"], "system/rate_limited");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_route_is_404() {
        let app = test_app();
        let response = app
            .router()
            .oneshot(request("GET", "/nonexistent", Some(TEST_KEY), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn metrics_track_requests_and_errors() {
        let app = test_app();
        let router = app.router();

        let _ = router
            .clone()
            .oneshot(request("GET", "/rag/status", Some(TEST_KEY), None))
            .await
            .unwrap();
        let _ = router
            .clone()
            .oneshot(request(
                "POST",
                "/summarize",
                Some(TEST_KEY),
                Some(r#"{"text":""}"#),
            ))
            .await
            .unwrap();

        let snapshot = app.ctx.metrics.snapshot();
        let rag_status = snapshot
            .endpoints
            .iter()
            .find(|e| e.endpoint == "/rag/status")
            .unwrap();
        assert_eq!(rag_status.count, 1);

        let summarize = snapshot
            .endpoints
            .iter()
            .find(|e| e.endpoint == "/summarize")
            .unwrap();
        assert_eq!(summarize.errors.get("input/empty"), Some(&1));
        assert!(!snapshot.recent_errors.is_empty());
    }
}
