//! Inference scheduler.
//!
//! Manages the scarce model backends behind three logical queues (speech,
//! generate, embed), each with a bounded worker pool and a bounded FIFO
//! waiting list. Backends are strictly owned by the scheduler: nothing else
//! in the process ever calls them, and the per-queue worker cap is the only
//! parallelism over them.

mod queue;

pub use queue::{Queue, QueueStatus};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backends::ModelError;
use crate::hardware::HardwareProfile;

/// Failure taxonomy surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Queue full or overloaded; includes a suggested retry delay.
    #[error("inference capacity exhausted, retry in {retry_after_secs}s")]
    Busy { retry_after_secs: u64 },
    /// Explicit cancellation or deadline expiry.
    #[error("inference cancelled")]
    Cancelled,
    #[error("model not ready: {0}")]
    NotReady(String),
    #[error("inference runtime error: {0}")]
    Runtime(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl From<ModelError> for InferenceError {
    fn from(err: ModelError) -> Self {
        match err {
            ModelError::NotReady(msg) => Self::NotReady(msg),
            ModelError::DependencyMissing(msg) => Self::NotReady(msg),
            ModelError::Runtime(msg) => Self::Runtime(msg),
        }
    }
}

/// Per-queue pool sizing. Defaults are deliberately tight: every worker is
/// a full model instance in memory.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub speech_workers: usize,
    pub generate_workers: usize,
    pub embed_workers: usize,
    /// Waiting-list cap applied to each queue.
    pub wait_cap: usize,
    /// Longest a submission may wait for a worker before `busy`.
    pub wait_budget: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            speech_workers: 1,
            generate_workers: 1,
            embed_workers: 1,
            wait_cap: 16,
            wait_budget: Duration::from_secs(30),
        }
    }
}

impl SchedulerConfig {
    /// Derive sizing from the hardware profile. Advisory: only `high_vram`
    /// changes anything, raising the generate pool to 2.
    pub fn for_profile(profile: HardwareProfile, embedder_parallel_safe: bool) -> Self {
        Self {
            generate_workers: profile.generate_workers(),
            embed_workers: if embedder_parallel_safe { 2 } else { 1 },
            ..Self::default()
        }
    }
}

/// The three logical work-streams.
pub struct Scheduler {
    pub speech: Arc<Queue>,
    pub generate: Arc<Queue>,
    pub embed: Arc<Queue>,
}

/// Snapshot of all queues, served by `/workers/status`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStatus {
    pub speech: QueueStatus,
    pub generate: QueueStatus,
    pub embed: QueueStatus,
}

impl SchedulerStatus {
    /// True when any queue's waiting list is at capacity. The HTTP layer
    /// sheds new inference submissions at the edge while this holds.
    pub fn overloaded(&self) -> bool {
        self.speech.overloaded || self.generate.overloaded || self.embed.overloaded
    }
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            speech: Arc::new(Queue::new(
                "speech",
                config.speech_workers,
                config.wait_cap,
                config.wait_budget,
            )),
            generate: Arc::new(Queue::new(
                "generate",
                config.generate_workers,
                config.wait_cap,
                config.wait_budget,
            )),
            embed: Arc::new(Queue::new(
                "embed",
                config.embed_workers,
                config.wait_cap,
                config.wait_budget,
            )),
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            speech: self.speech.status(),
            generate: self.generate.status(),
            embed: self.embed.status(),
        }
    }

    /// Graceful shutdown: stop intake, cancel waiting submissions, then
    /// give running work a bounded drain period.
    pub async fn shutdown(&self, drain: Duration) {
        self.speech.close();
        self.generate.close();
        self.embed.close();

        let deadline = tokio::time::Instant::now() + drain;
        for queue in [&self.speech, &self.generate, &self.embed] {
            queue.drain_until(deadline).await;
        }
        tracing::info!("Scheduler drained");
    }

    /// Cancellation token wired to both an explicit caller signal and an
    /// optional deadline; expiry behaves exactly like caller cancellation.
    pub fn deadline_token(parent: &CancellationToken, deadline: Option<Duration>) -> CancellationToken {
        let token = parent.child_token();
        if let Some(limit) = deadline {
            let armed = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(limit) => armed.cancel(),
                    _ = armed.cancelled() => {}
                }
            });
        }
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pools_are_single_worker() {
        let config = SchedulerConfig::default();
        assert_eq!(config.speech_workers, 1);
        assert_eq!(config.generate_workers, 1);
        assert_eq!(config.embed_workers, 1);
        assert_eq!(config.wait_cap, 16);
    }

    #[test]
    fn high_vram_profile_doubles_generate_pool() {
        let config = SchedulerConfig::for_profile(HardwareProfile::HighVram, false);
        assert_eq!(config.generate_workers, 2);
        assert_eq!(config.speech_workers, 1);

        let config = SchedulerConfig::for_profile(HardwareProfile::CpuOnly, false);
        assert_eq!(config.generate_workers, 1);
    }

    #[test]
    fn parallel_safe_embedder_widens_embed_pool() {
        let config = SchedulerConfig::for_profile(HardwareProfile::LowVram, true);
        assert_eq!(config.embed_workers, 2);
    }

    #[test]
    fn model_error_maps_into_taxonomy() {
        let err: InferenceError = ModelError::NotReady("weights absent".into()).into();
        assert!(matches!(err, InferenceError::NotReady(_)));

        let err: InferenceError = ModelError::Runtime("boom".into()).into();
        assert!(matches!(err, InferenceError::Runtime(_)));
    }

    #[tokio::test]
    async fn deadline_token_fires_after_limit() {
        let parent = CancellationToken::new();
        let token = Scheduler::deadline_token(&parent, Some(Duration::from_millis(20)));
        assert!(!token.is_cancelled());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(token.is_cancelled());
        // Parent is untouched by the child's deadline.
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_token_follows_parent_cancel() {
        let parent = CancellationToken::new();
        let token = Scheduler::deadline_token(&parent, None);
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
