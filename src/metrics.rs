//! Rolling performance counters consumed by the `get_metrics` client message
//! and (per §6) by an external HTTP admin surface this crate does not itself
//! expose.
//!
//! Grounded directly on `original_source/backend/app/manager.py:
//! PerformanceMetrics` (bounded deques, 60-second sliding throughput/error
//! windows, p95/p99 with a current-max fallback below the sample threshold),
//! reshaped into the teacher's `performance_monitoring.rs` idiom: a struct
//! owning `Arc<RwLock<..>>` fields rather than free-standing globals.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

const SAMPLE_WINDOW: usize = 1000;
const THROUGHPUT_WINDOW_SECS: u64 = 60;
const P95_MIN_SAMPLES: usize = 20;
const P99_MIN_SAMPLES: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p95: f64,
    pub p99: f64,
    pub samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ThroughputStats {
    pub operations_per_second: u64,
    pub messages_per_second: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectionStats {
    pub active: u64,
    pub total: u64,
    pub errors: u64,
    pub reconnections: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ErrorStats {
    pub total_errors: u64,
    pub error_rate_per_minute: u64,
    pub error_breakdown: HashMap<String, u64>,
}

/// A point-in-time view of every counter the aggregator tracks, the shape
/// sent back on `get_metrics` and consulted by the (out-of-scope) HTTP
/// admin surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsSnapshot {
    pub latency: LatencyStats,
    pub operation_processing: LatencyStats,
    pub throughput: ThroughputStats,
    pub connections: ConnectionStats,
    pub errors: ErrorStats,
    pub sessions_active: usize,
}

struct Windows {
    latency_ms: VecDeque<f64>,
    operation_processing_ms: VecDeque<f64>,
    operation_timestamps: VecDeque<Instant>,
    message_timestamps: VecDeque<Instant>,
    error_timestamps: VecDeque<Instant>,
    error_breakdown: HashMap<String, u64>,
}

impl Windows {
    fn new() -> Self {
        Self {
            latency_ms: VecDeque::with_capacity(SAMPLE_WINDOW),
            operation_processing_ms: VecDeque::with_capacity(SAMPLE_WINDOW),
            operation_timestamps: VecDeque::new(),
            message_timestamps: VecDeque::new(),
            error_timestamps: VecDeque::new(),
            error_breakdown: HashMap::new(),
        }
    }

    fn push_bounded(deque: &mut VecDeque<f64>, value: f64) {
        if deque.len() == SAMPLE_WINDOW {
            deque.pop_front();
        }
        deque.push_back(value);
    }

    fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window_secs: u64) {
        while let Some(&front) = deque.front() {
            if now.duration_since(front).as_secs() >= window_secs {
                deque.pop_front();
            } else {
                break;
            }
        }
    }
}

fn latency_stats(samples: &VecDeque<f64>) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("latency samples are never NaN"));

    let sum: f64 = sorted.iter().sum();
    let avg = sum / sorted.len() as f64;
    let min = sorted[0];
    let max = *sorted.last().expect("checked non-empty above");

    let p95 = if sorted.len() >= P95_MIN_SAMPLES {
        percentile(&sorted, 0.95)
    } else {
        max
    };
    let p99 = if sorted.len() >= P99_MIN_SAMPLES {
        percentile(&sorted, 0.99)
    } else {
        max
    };

    LatencyStats {
        avg,
        min,
        max,
        p95,
        p99,
        samples: sorted.len(),
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let rank = ((sorted.len() as f64) * p).floor() as usize;
    sorted[rank.min(sorted.len() - 1)]
}

/// Monotonic connection/error counters plus the rolling windows above, all
/// guarded independently so a metrics read never contends with the
/// coordinator's hot path any longer than it has to.
pub struct MetricsAggregator {
    windows: Arc<RwLock<Windows>>,
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    connection_errors: AtomicU64,
    reconnection_attempts: AtomicU64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self {
            windows: Arc::new(RwLock::new(Windows::new())),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            reconnection_attempts: AtomicU64::new(0),
        }
    }

    pub async fn record_latency(&self, latency_ms: f64) {
        let mut windows = self.windows.write().await;
        Windows::push_bounded(&mut windows.latency_ms, latency_ms);
    }

    pub async fn record_operation_processing_time(&self, processing_ms: f64) {
        let mut windows = self.windows.write().await;
        Windows::push_bounded(&mut windows.operation_processing_ms, processing_ms);
    }

    pub async fn increment_operation_count(&self) {
        let mut windows = self.windows.write().await;
        windows.operation_timestamps.push_back(Instant::now());
    }

    pub async fn increment_message_count(&self) {
        let mut windows = self.windows.write().await;
        windows.message_timestamps.push_back(Instant::now());
    }

    pub async fn record_error(&self, kind: &str) {
        let mut windows = self.windows.write().await;
        let now = Instant::now();
        windows.error_timestamps.push_back(now);
        *windows.error_breakdown.entry(kind.to_string()).or_insert(0) += 1;
    }

    pub fn record_connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection_attempt(&self) {
        self.reconnection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self, sessions_active: usize) -> MetricsSnapshot {
        let mut windows = self.windows.write().await;
        let now = Instant::now();

        Windows::prune_window(&mut windows.operation_timestamps, now, THROUGHPUT_WINDOW_SECS);
        Windows::prune_window(&mut windows.message_timestamps, now, THROUGHPUT_WINDOW_SECS);
        Windows::prune_window(&mut windows.error_timestamps, now, THROUGHPUT_WINDOW_SECS);

        let throughput = ThroughputStats {
            operations_per_second: windows.operation_timestamps.len() as u64,
            messages_per_second: windows.message_timestamps.len() as u64,
        };

        let errors = ErrorStats {
            total_errors: windows.error_breakdown.values().sum(),
            error_rate_per_minute: windows.error_timestamps.len() as u64,
            error_breakdown: windows.error_breakdown.clone(),
        };

        MetricsSnapshot {
            latency: latency_stats(&windows.latency_ms),
            operation_processing: latency_stats(&windows.operation_processing_ms),
            throughput,
            connections: ConnectionStats {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
                errors: self.connection_errors.load(Ordering::Relaxed),
                reconnections: self.reconnection_attempts.load(Ordering::Relaxed),
            },
            errors,
            sessions_active,
        }
    }
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new()
    }
}
