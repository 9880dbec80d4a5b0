//! Shared state and in-memory stores for the API layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::audit::AuditLog;
use crate::config::Config;
use crate::metrics::Metrics;
use crate::pipeline::SmartNotePipeline;
use crate::rag::RagStore;
use crate::scheduler::Scheduler;

use super::endpoints::setup::DownloadTracker;

/// Shared context for all routes and middleware.
#[derive(Clone)]
pub struct ApiContext {
    pub config: Arc<Config>,
    pub pipeline: Arc<SmartNotePipeline>,
    pub rag: Arc<RagStore>,
    pub scheduler: Arc<Scheduler>,
    pub audit: Arc<AuditLog>,
    pub metrics: Arc<Metrics>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub downloads: Arc<DownloadTracker>,
}

impl ApiContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        pipeline: Arc<SmartNotePipeline>,
        rag: Arc<RagStore>,
        scheduler: Arc<Scheduler>,
        audit: Arc<AuditLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(
            config.rate_limit_per_minute,
            config.rate_limit_max_buckets,
        );
        Self {
            config,
            pipeline,
            rag,
            scheduler,
            audit,
            metrics,
            rate_limiter: Arc::new(Mutex::new(rate_limiter)),
            downloads: Arc::new(DownloadTracker::new()),
        }
    }
}

/// Correlation id injected into request extensions by the tracking
/// middleware and echoed as `X-Request-Id`.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

// ═══════════════════════════════════════════════════════════
// Rate limiter: token bucket per (client host, endpoint group)
// ═══════════════════════════════════════════════════════════

struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

/// Token-bucket limiter. The map lives behind a mutex; when its cardinality
/// exceeds the cap, the bucket with the oldest `last_seen` is evicted one
/// at a time, never the whole store.
pub struct RateLimiter {
    buckets: HashMap<(String, &'static str), Bucket>,
    capacity: f64,
    refill_per_sec: f64,
    max_buckets: usize,
}

impl RateLimiter {
    pub fn new(per_minute: u32, max_buckets: usize) -> Self {
        Self {
            buckets: HashMap::new(),
            capacity: per_minute as f64,
            refill_per_sec: per_minute as f64 / 60.0,
            max_buckets: max_buckets.max(1),
        }
    }

    /// Take one token for `(host, group)`. `Err(retry_after_secs)` when the
    /// bucket is dry.
    pub fn check(&mut self, host: &str, group: &'static str) -> Result<(), u64> {
        let now = Instant::now();
        self.evict_if_needed(&(host.to_string(), group), now);

        let bucket = self
            .buckets
            .entry((host.to_string(), group))
            .or_insert(Bucket {
                tokens: self.capacity,
                last_refill: now,
                last_seen: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            Err((deficit / self.refill_per_sec).ceil() as u64)
        }
    }

    /// Evict the oldest idle bucket while over the cap, unless the key is
    /// already resident.
    fn evict_if_needed(&mut self, key: &(String, &'static str), _now: Instant) {
        while self.buckets.len() >= self.max_buckets && !self.buckets.contains_key(key) {
            let oldest = self
                .buckets
                .iter()
                .min_by_key(|(_, b)| b.last_seen)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    self.buckets.remove(&k);
                }
                None => break,
            }
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
