//! In-process metrics.
//!
//! Per-endpoint counters, error counts by kind, reservoir-sampled latency
//! percentiles, a ring buffer of recent errors for the bug-report surface,
//! and named counters for internal events (journal lines skipped, audit
//! write failures, deferred index upserts).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use rand::Rng;
use serde::Serialize;

/// Retained latency samples per endpoint.
const RESERVOIR_CAP: usize = 512;
/// Retained recent errors.
const ERROR_RING_CAP: usize = 100;

/// Named internal counters.
pub const JOURNAL_SKIPPED_LINES: &str = "journal_skipped_lines";
pub const AUDIT_WRITE_FAILURES: &str = "audit_write_failures";
pub const INDEX_DEFERRALS: &str = "index_deferrals";
pub const SAVE_FAILURES: &str = "save_failures";

/// Uniform reservoir sample of request latencies.
struct Reservoir {
    samples: Vec<f64>,
    seen: u64,
}

impl Reservoir {
    fn new() -> Self {
        Self {
            samples: Vec::new(),
            seen: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        self.seen += 1;
        if self.samples.len() < RESERVOIR_CAP {
            self.samples.push(value);
        } else {
            let slot = rand::thread_rng().gen_range(0..self.seen);
            if (slot as usize) < RESERVOIR_CAP {
                self.samples[slot as usize] = value;
            }
        }
    }

    fn percentile(&self, p: f64) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let rank = ((p / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

struct EndpointStats {
    count: u64,
    errors: HashMap<String, u64>,
    latencies: Reservoir,
}

impl EndpointStats {
    fn new() -> Self {
        Self {
            count: 0,
            errors: HashMap::new(),
            latencies: Reservoir::new(),
        }
    }
}

/// One retained error, newest at the front of the ring.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub ts: String,
    pub endpoint: String,
    pub error_code: String,
    pub message: String,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub endpoint: String,
    pub count: u64,
    pub errors: HashMap<String, u64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub endpoints: Vec<EndpointSnapshot>,
    pub counters: HashMap<String, u64>,
    pub recent_errors: Vec<ErrorEvent>,
}

pub struct Metrics {
    endpoints: Mutex<HashMap<String, EndpointStats>>,
    counters: Mutex<HashMap<&'static str, u64>>,
    recent_errors: Mutex<VecDeque<ErrorEvent>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            recent_errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Record one completed request.
    pub fn record_request(&self, endpoint: &str, latency_ms: f64, error_code: Option<&str>) {
        let Ok(mut endpoints) = self.endpoints.lock() else {
            return;
        };
        let stats = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(EndpointStats::new);
        stats.count += 1;
        stats.latencies.observe(latency_ms);
        if let Some(code) = error_code {
            *stats.errors.entry(code.to_string()).or_insert(0) += 1;
        }
    }

    /// Retain an error for the bug-report surface.
    pub fn record_error(&self, endpoint: &str, error_code: &str, message: &str, correlation_id: &str) {
        let Ok(mut ring) = self.recent_errors.lock() else {
            return;
        };
        if ring.len() >= ERROR_RING_CAP {
            ring.pop_back();
        }
        ring.push_front(ErrorEvent {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            endpoint: endpoint.to_string(),
            error_code: error_code.to_string(),
            message: message.to_string(),
            correlation_id: correlation_id.to_string(),
        });
    }

    pub fn inc_counter(&self, name: &'static str) {
        self.add_counter(name, 1);
    }

    pub fn add_counter(&self, name: &'static str, amount: u64) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += amount;
        }
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(name).copied())
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let endpoints = self
            .endpoints
            .lock()
            .map(|map| {
                let mut list: Vec<EndpointSnapshot> = map
                    .iter()
                    .map(|(endpoint, stats)| EndpointSnapshot {
                        endpoint: endpoint.clone(),
                        count: stats.count,
                        errors: stats.errors.clone(),
                        p50_ms: stats.latencies.percentile(50.0),
                        p95_ms: stats.latencies.percentile(95.0),
                        p99_ms: stats.latencies.percentile(99.0),
                    })
                    .collect();
                list.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
                list
            })
            .unwrap_or_default();

        let counters = self
            .counters
            .lock()
            .map(|c| c.iter().map(|(k, v)| (k.to_string(), *v)).collect())
            .unwrap_or_default();

        let recent_errors = self
            .recent_errors
            .lock()
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default();

        MetricsSnapshot {
            endpoints,
            counters,
            recent_errors,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
