//! Performance monitoring: bounded metric buffer, threshold alerts, and
//! trend comparison between a recent window and a longer baseline.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::RoutePath;

/// Buffer bound; oldest metrics drop first.
pub const MAX_BUFFERED_METRICS: usize = 10_000;
/// Metrics older than this are pruned regardless of buffer occupancy.
pub const METRIC_MAX_AGE_HOURS: i64 = 24;
/// Latency at which a single request alerts.
pub const SLOW_REQUEST_SECS: f64 = 15.0;
/// Minimum gap between two alerts of the same kind.
pub const ALERT_COOLDOWN: Duration = Duration::seconds(300);

const TREND_RECENT: Duration = Duration::minutes(5);
const TREND_BASELINE: Duration = Duration::minutes(30);
const LATENCY_DELTA_SECS: f64 = 2.0;
const ERROR_RATE_DELTA: f64 = 0.02;

const P95_LATENCY_MAX: f64 = 10.0;
const ERROR_RATE_MAX: f64 = 0.05;
const SUCCESS_RATE_MIN: f64 = 0.95;
const CACHE_HIT_RATE_MIN: f64 = 0.30;

/// One completed invocation, as seen by the monitor.
#[derive(Clone, Debug)]
pub struct PerformanceMetric {
    pub thread_id: String,
    pub path: Option<RoutePath>,
    pub phase: String,
    pub success: bool,
    pub latency_secs: f64,
    pub llm_calls: u32,
    pub tools_used: Vec<String>,
    pub cache_hit: bool,
    pub error_kind: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AlertKind {
    SlowRequest,
    RequestFailure,
    LatencyDegradation,
    ErrorRateDegradation,
}

#[derive(Clone, Debug, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub when: DateTime<Utc>,
}

/// Aggregates over a time window.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MonitorStats {
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub success_rate: f64,
    pub avg_latency: f64,
    pub median_latency: f64,
    pub p95_latency: f64,
    pub p99_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub path_breakdown: FxHashMap<String, u64>,
    pub phase_breakdown: FxHashMap<String, u64>,
    pub tool_usage: FxHashMap<String, u64>,
    pub error_kinds: FxHashMap<String, u64>,
    pub cache_hit_rate: f64,
    /// Average latency over the most recent 100 requests in the window.
    pub recent_avg_latency: f64,
}

struct MonitorInner {
    metrics: VecDeque<PerformanceMetric>,
    cooldowns: FxHashMap<AlertKind, DateTime<Utc>>,
}

/// Shared monitor; cheap to clone behind an [`Arc`].
pub struct PerformanceMonitor {
    inner: Mutex<MonitorInner>,
    alert_tx: Option<flume::Sender<Alert>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PerformanceMonitor {
    pub fn new(alert_tx: Option<flume::Sender<Alert>>) -> Self {
        Self {
            inner: Mutex::new(MonitorInner {
                metrics: VecDeque::new(),
                cooldowns: FxHashMap::default(),
            }),
            alert_tx,
        }
    }

    /// Record a completed invocation and raise immediate alerts.
    pub fn record(&self, metric: PerformanceMetric) {
        let mut alerts = Vec::new();
        {
            let mut inner = self.inner.lock();
            Self::prune(&mut inner.metrics);

            if metric.latency_secs >= SLOW_REQUEST_SECS {
                if let Some(alert) = Self::raise(
                    &mut inner.cooldowns,
                    AlertKind::SlowRequest,
                    format!(
                        "slow request on {}: {:.1}s",
                        metric.thread_id, metric.latency_secs
                    ),
                ) {
                    alerts.push(alert);
                }
            }
            if !metric.success {
                if let Some(alert) = Self::raise(
                    &mut inner.cooldowns,
                    AlertKind::RequestFailure,
                    format!(
                        "request failed on {}: {}",
                        metric.thread_id,
                        metric.error_kind.as_deref().unwrap_or("unknown")
                    ),
                ) {
                    alerts.push(alert);
                }
            }

            inner.metrics.push_back(metric);
            while inner.metrics.len() > MAX_BUFFERED_METRICS {
                inner.metrics.pop_front();
            }
        }
        self.dispatch(alerts);
    }

    fn prune(metrics: &mut VecDeque<PerformanceMetric>) {
        let cutoff = Utc::now() - Duration::hours(METRIC_MAX_AGE_HOURS);
        while metrics.front().is_some_and(|m| m.recorded_at < cutoff) {
            metrics.pop_front();
        }
    }

    fn raise(
        cooldowns: &mut FxHashMap<AlertKind, DateTime<Utc>>,
        kind: AlertKind,
        message: String,
    ) -> Option<Alert> {
        let now = Utc::now();
        if let Some(last) = cooldowns.get(&kind) {
            if now - *last < ALERT_COOLDOWN {
                return None;
            }
        }
        cooldowns.insert(kind, now);
        warn!(kind = ?kind, %message, "performance alert");
        Some(Alert {
            kind,
            message,
            when: now,
        })
    }

    fn dispatch(&self, alerts: Vec<Alert>) {
        let Some(tx) = &self.alert_tx else { return };
        for alert in alerts {
            if tx.send(alert).is_err() {
                debug!("alert channel closed; dropping alert");
            }
        }
    }

    /// Aggregate stats over metrics no older than `window`.
    pub fn stats(&self, window: Duration) -> MonitorStats {
        let inner = self.inner.lock();
        let cutoff = Utc::now() - window;
        let sample: Vec<&PerformanceMetric> = inner
            .metrics
            .iter()
            .filter(|m| m.recorded_at >= cutoff)
            .collect();
        Self::aggregate(&sample)
    }

    fn aggregate(sample: &[&PerformanceMetric]) -> MonitorStats {
        if sample.is_empty() {
            return MonitorStats::default();
        }

        let mut latencies: Vec<f64> = sample.iter().map(|m| m.latency_secs).collect();
        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let total = sample.len() as u64;
        let successes = sample.iter().filter(|m| m.success).count() as u64;
        let cache_hits = sample.iter().filter(|m| m.cache_hit).count() as u64;

        let mut path_breakdown = FxHashMap::default();
        let mut phase_breakdown = FxHashMap::default();
        let mut tool_usage = FxHashMap::default();
        let mut error_kinds = FxHashMap::default();
        for metric in sample {
            if let Some(path) = metric.path {
                *path_breakdown.entry(path.to_string()).or_insert(0) += 1;
            }
            *phase_breakdown.entry(metric.phase.clone()).or_insert(0) += 1;
            for tool in &metric.tools_used {
                *tool_usage.entry(tool.clone()).or_insert(0) += 1;
            }
            if let Some(kind) = &metric.error_kind {
                *error_kinds.entry(kind.clone()).or_insert(0) += 1;
            }
        }

        let recent = &sample[sample.len().saturating_sub(100)..];
        let recent_avg_latency =
            recent.iter().map(|m| m.latency_secs).sum::<f64>() / recent.len() as f64;

        MonitorStats {
            total_requests: total,
            successes,
            failures: total - successes,
            success_rate: successes as f64 / total as f64,
            avg_latency: latencies.iter().sum::<f64>() / latencies.len() as f64,
            median_latency: percentile(&latencies, 50.0),
            p95_latency: percentile(&latencies, 95.0),
            p99_latency: percentile(&latencies, 99.0),
            min_latency: latencies[0],
            max_latency: latencies[latencies.len() - 1],
            path_breakdown,
            phase_breakdown,
            tool_usage,
            error_kinds,
            cache_hit_rate: cache_hits as f64 / total as f64,
            recent_avg_latency,
        }
    }

    /// Operational suggestions derived from the last 24 hours.
    pub fn recommendations(&self) -> Vec<String> {
        let stats = self.stats(Duration::hours(METRIC_MAX_AGE_HOURS));
        if stats.total_requests == 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        if stats.p95_latency > P95_LATENCY_MAX {
            out.push(format!(
                "p95 latency is {:.1}s; investigate slow tools or model calls",
                stats.p95_latency
            ));
        }
        if stats.failures as f64 / stats.total_requests as f64 > ERROR_RATE_MAX {
            out.push(format!(
                "error rate is {:.1}%; check backend and model availability",
                100.0 * stats.failures as f64 / stats.total_requests as f64
            ));
        }
        if stats.success_rate < SUCCESS_RATE_MIN {
            out.push(format!(
                "success rate dropped to {:.1}%",
                stats.success_rate * 100.0
            ));
        }
        if stats.cache_hit_rate < CACHE_HIT_RATE_MIN {
            out.push(format!(
                "cache hit rate is {:.1}%; review key composition or TTL",
                stats.cache_hit_rate * 100.0
            ));
        }
        out
    }

    /// Compare the recent window against the longer baseline and alert on
    /// latency or error-rate regressions.
    pub fn check_trends(&self) -> Vec<Alert> {
        let recent = self.stats(TREND_RECENT);
        let baseline = self.stats(TREND_BASELINE);
        if recent.total_requests == 0 || baseline.total_requests == 0 {
            return Vec::new();
        }

        let mut alerts = Vec::new();
        let mut inner = self.inner.lock();
        if recent.avg_latency > baseline.avg_latency + LATENCY_DELTA_SECS {
            if let Some(alert) = Self::raise(
                &mut inner.cooldowns,
                AlertKind::LatencyDegradation,
                format!(
                    "avg latency rose from {:.1}s to {:.1}s",
                    baseline.avg_latency, recent.avg_latency
                ),
            ) {
                alerts.push(alert);
            }
        }
        let recent_err = 1.0 - recent.success_rate;
        let baseline_err = 1.0 - baseline.success_rate;
        if recent_err > baseline_err + ERROR_RATE_DELTA {
            if let Some(alert) = Self::raise(
                &mut inner.cooldowns,
                AlertKind::ErrorRateDegradation,
                format!(
                    "error rate rose from {:.1}% to {:.1}%",
                    baseline_err * 100.0,
                    recent_err * 100.0
                ),
            ) {
                alerts.push(alert);
            }
        }
        drop(inner);

        self.dispatch(alerts.clone());
        alerts
    }

    /// Spawn the periodic trend checker. Ends when the monitor is dropped by
    /// all other holders.
    pub fn spawn_trend_task(
        self: &Arc<Self>,
        interval: StdDuration,
    ) -> tokio::task::JoinHandle<()> {
        let monitor = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else { break };
                monitor.check_trends();
            }
        })
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
