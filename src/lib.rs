pub mod api;
pub mod audit;
pub mod backends;
pub mod config;
pub mod hardware;
pub mod journal;
pub mod metrics;
pub mod pipeline;
pub mod rag;
pub mod scheduler;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::api::ApiContext;
use crate::audit::AuditLog;
use crate::backends::embedder::HashEmbedder;
use crate::backends::ollama::{OllamaClient, OllamaGenerator};
use crate::backends::whisper::WhisperServer;
use crate::backends::EmbeddingModel;
use crate::config::Config;
use crate::journal::JournalStore;
use crate::metrics::Metrics;
use crate::pipeline::SmartNotePipeline;
use crate::rag::RagStore;
use crate::scheduler::{Scheduler, SchedulerConfig};

/// Fallback generator model when the runtime cannot be queried at startup;
/// readiness errors then surface per call instead of blocking boot.
const DEFAULT_GENERATOR_MODEL: &str = "medgemma";

/// Build everything, bind the server, and run until ctrl-c.
pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config::default_log_filter())),
        )
        .init();

    tracing::info!("Chairside starting v{}", config::APP_VERSION);

    let config = Arc::new(Config::from_env()?);
    let audit = Arc::new(AuditLog::open(&config.audit_path())?);
    let journal = Arc::new(JournalStore::open(&config.journal_path())?);
    let metrics = Arc::new(Metrics::new());

    // Backend clients are blocking by design; building and probing them
    // happens off the async threads.
    type Backends = (hardware::HardwareProfile, OllamaGenerator, WhisperServer);
    let (profile, generator, speech) = tokio::task::spawn_blocking(
        || -> Result<Backends, crate::backends::ModelError> {
            let probe_client = OllamaClient::default_local()?;
            let profile = hardware::detect_profile(&probe_client);

            let generator =
                match OllamaGenerator::resolve(probe_client, profile.offload_layers()) {
                    Ok(generator) => generator,
                    Err(e) => {
                        tracing::warn!(error = %e, "Generator unresolved at startup, deferring readiness");
                        OllamaGenerator::new(
                            OllamaClient::default_local()?,
                            DEFAULT_GENERATOR_MODEL.to_string(),
                            profile.offload_layers(),
                        )
                    }
                };
            let speech = WhisperServer::default_local()?;
            Ok((profile, generator, speech))
        },
    )
    .await??;
    tracing::info!(%profile, "Hardware profile");

    let embedder = select_embedder(&config);
    let scheduler = Arc::new(Scheduler::new(SchedulerConfig::for_profile(
        profile,
        embedder.parallel_safe(),
    )));

    let rag = Arc::new(RagStore::open(
        &config.rag_data_dir(),
        journal,
        Arc::clone(&embedder),
        Arc::clone(&scheduler.embed),
        Arc::clone(&audit),
        Arc::clone(&metrics),
    )?);
    if let Err(e) = rag.seed_knowledge_if_empty(&config.knowledge_dir()).await {
        tracing::warn!(error = %e, "Knowledge seeding failed; continuing without");
    }
    rag.start();

    let pipeline = Arc::new(SmartNotePipeline::new(
        Arc::clone(&scheduler),
        Arc::new(speech),
        Arc::new(generator),
        Arc::clone(&rag),
        Arc::clone(&audit),
        Arc::clone(&metrics),
        config.max_text_chars,
    ));

    let ctx = ApiContext::new(config, pipeline, rag, scheduler, audit, metrics);
    let mut server = api::server::start(ctx).await?;
    tracing::info!(addr = %server.addr, "Ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");
    // Wait for the listener to close and running inferences to finish
    // their bounded drain before the runtime is torn down.
    server.shutdown_and_drain().await;
    Ok(())
}

/// ONNX embedder when the feature is on and weights are present, else the
/// deterministic fallback.
fn select_embedder(config: &Config) -> Arc<dyn EmbeddingModel> {
    #[cfg(feature = "onnx-embeddings")]
    {
        let model_dir = config.models_dir().join("all-MiniLM-L6-v2");
        match backends::embedder::OnnxEmbedder::load(&model_dir) {
            Ok(embedder) => return Arc::new(embedder),
            Err(e) => {
                tracing::warn!(error = %e, "ONNX embedder unavailable, using fallback");
            }
        }
    }
    let _ = config;
    Arc::new(HashEmbedder::new())
}
