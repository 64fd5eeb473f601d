//! Metrics for queue observability
//!
//! A pluggable [`MetricsBackend`] with an in-memory [`LocalMetrics`] default.
//! [`QueueMetrics`] records token lifecycle counts, per-office queue gauges and
//! recalculation latency on top of any backend.

use crate::snapshot::QueueSummary;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A pluggable metrics backend trait.
///
/// Implement this to forward queue metrics to Prometheus, OpenTelemetry or a
/// custom monitoring system.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Increment a counter metric by the given value
    async fn increment_counter(&self, name: &str, value: u64);

    /// Set a gauge metric to the given value
    async fn set_gauge(&self, name: &str, value: f64);

    /// Record a histogram observation
    async fn record_histogram(&self, name: &str, value: f64);

    async fn get_counter(&self, name: &str) -> Option<u64>;

    async fn get_gauge(&self, name: &str) -> Option<f64>;

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats>;

    /// Reset all metrics (useful for testing)
    async fn reset(&self);

    /// Export all metrics as a snapshot
    async fn snapshot(&self) -> MetricsSnapshot;
}

/// Summary statistics for a histogram metric
#[derive(Debug, Clone, PartialEq)]
pub struct HistogramStats {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

impl Default for HistogramStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::MAX,
            max: f64::MIN,
            mean: 0.0,
        }
    }
}

impl HistogramStats {
    fn record(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.mean = self.sum / self.count as f64;
    }
}

/// Snapshot of all metrics at a point in time
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramStats>,
}

/// Local in-memory metrics implementation
#[derive(Default)]
pub struct LocalMetrics {
    counters: RwLock<HashMap<String, u64>>,
    gauges: RwLock<HashMap<String, f64>>,
    histograms: RwLock<HashMap<String, HistogramStats>>,
}

impl LocalMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricsBackend for LocalMetrics {
    async fn increment_counter(&self, name: &str, value: u64) {
        let mut counters = self.counters.write().await;
        *counters.entry(name.to_string()).or_insert(0) += value;
    }

    async fn set_gauge(&self, name: &str, value: f64) {
        let mut gauges = self.gauges.write().await;
        gauges.insert(name.to_string(), value);
    }

    async fn record_histogram(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write().await;
        histograms
            .entry(name.to_string())
            .or_default()
            .record(value);
    }

    async fn get_counter(&self, name: &str) -> Option<u64> {
        self.counters.read().await.get(name).copied()
    }

    async fn get_gauge(&self, name: &str) -> Option<f64> {
        self.gauges.read().await.get(name).copied()
    }

    async fn get_histogram_stats(&self, name: &str) -> Option<HistogramStats> {
        self.histograms.read().await.get(name).cloned()
    }

    async fn reset(&self) {
        self.counters.write().await.clear();
        self.gauges.write().await.clear();
        self.histograms.write().await.clear();
    }

    async fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.read().await.clone(),
            gauges: self.gauges.read().await.clone(),
            histograms: self.histograms.read().await.clone(),
        }
    }
}

/// Predefined metric names
pub mod metric_names {
    /// Counter: tokens booked
    pub const TOKENS_BOOKED: &str = "queue.tokens.booked";
    /// Counter: WAIT -> ALLOCATED promotions
    pub const TOKENS_PROMOTED: &str = "queue.tokens.promoted";
    /// Counter: tokens called to a counter
    pub const TOKENS_CALLED: &str = "queue.tokens.called";
    /// Counter: tokens completed
    pub const TOKENS_COMPLETED: &str = "queue.tokens.completed";
    /// Counter: tokens cancelled
    pub const TOKENS_CANCELLED: &str = "queue.tokens.cancelled";
    /// Counter: tokens marked no-show
    pub const TOKENS_NO_SHOW: &str = "queue.tokens.no_show";
    /// Counter: no-show tokens re-queued
    pub const TOKENS_REQUEUED: &str = "queue.tokens.requeued";
    /// Counter: recalculation passes that failed
    pub const RECALCULATION_FAILURES: &str = "queue.recalculation.failures";

    /// Gauge: WAIT tokens per office
    pub const QUEUE_WAITING: &str = "queue.office.waiting";
    /// Gauge: ALLOCATED + CALLED tokens per office
    pub const QUEUE_ENGAGED: &str = "queue.office.engaged";

    /// Histogram: recalculation pass latency (ms)
    pub const RECALCULATION_LATENCY: &str = "queue.recalculation.latency_ms";
    /// Histogram: minutes from booking to call
    pub const CALL_WAIT_MINUTES: &str = "queue.token.wait_minutes";
}

/// Queue metrics collector that wraps a metrics backend
#[derive(Clone)]
pub struct QueueMetrics {
    backend: Arc<dyn MetricsBackend>,
}

impl QueueMetrics {
    pub fn new(backend: Arc<dyn MetricsBackend>) -> Self {
        Self { backend }
    }

    /// Collector with a local in-memory backend
    pub fn local() -> Self {
        Self::new(Arc::new(LocalMetrics::new()))
    }

    pub fn backend(&self) -> &Arc<dyn MetricsBackend> {
        &self.backend
    }

    /// Increment `name` globally and for one office
    pub async fn count(&self, name: &str, office_id: &str, value: u64) {
        self.backend.increment_counter(name, value).await;
        self.backend
            .increment_counter(&format!("{}.{}", name, office_id), value)
            .await;
    }

    /// Record the outcome of a recalculation pass
    pub async fn record_recalculation(
        &self,
        office_id: &str,
        summary: &QueueSummary,
        promoted: usize,
        latency_ms: f64,
    ) {
        if promoted > 0 {
            self.count(metric_names::TOKENS_PROMOTED, office_id, promoted as u64)
                .await;
        }
        self.backend
            .set_gauge(
                &format!("{}.{}", metric_names::QUEUE_WAITING, office_id),
                summary.wait as f64,
            )
            .await;
        self.backend
            .set_gauge(
                &format!("{}.{}", metric_names::QUEUE_ENGAGED, office_id),
                summary.engaged() as f64,
            )
            .await;
        self.backend
            .record_histogram(metric_names::RECALCULATION_LATENCY, latency_ms)
            .await;
    }

    /// Record how long a token waited between booking and its call
    pub async fn record_call_wait(&self, office_id: &str, wait_minutes: f64) {
        self.count(metric_names::TOKENS_CALLED, office_id, 1).await;
        self.backend
            .record_histogram(metric_names::CALL_WAIT_MINUTES, wait_minutes)
            .await;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.backend.snapshot().await
    }

    pub async fn reset(&self) {
        self.backend.reset().await;
    }
}
