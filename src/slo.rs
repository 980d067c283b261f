//! Service-level-objective tracking over streaming request samples.
//!
//! The monitor wraps handler execution: every completed request appends a
//! [`MetricSample`] to a bounded ring buffer (oldest dropped at capacity)
//! and is evaluated against the configured thresholds. Breaches are
//! surfaced two ways: a fire-and-forget alert at detection time, and a
//! [`SloBreach`] entry included in subsequent reports until it ages out of
//! the reporting window.
//!
//! # Percentiles
//!
//! `pN` is the value at rank `ceil(N/100 × n) − 1` over samples sorted
//! ascending, clamped to valid indices. For 100 samples with durations
//! 1..=100 ms this makes p95 exactly 95 ms.
//!
//! # Concurrency
//!
//! Appends take a short write lock; ordering under contention is
//! approximate, which is acceptable - the contract is boundedness and
//! recency, not strict linearization. [`SloMonitor::report`] is a pure
//! read and safe to call concurrently with writers.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::alert::{Alert, AlertDispatcher};

/// Reporting window for percentile and rate computations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SloWindow {
    Hour,
    Day,
    Week,
}

impl SloWindow {
    /// Parse the wire form used by the report endpoint.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "1h" => Some(SloWindow::Hour),
            "24h" => Some(SloWindow::Day),
            "7d" => Some(SloWindow::Week),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            SloWindow::Hour => Duration::from_secs(3600),
            SloWindow::Day => Duration::from_secs(24 * 3600),
            SloWindow::Week => Duration::from_secs(7 * 24 * 3600),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SloWindow::Hour => "1h",
            SloWindow::Day => "24h",
            SloWindow::Week => "7d",
        }
    }
}

/// One recorded request outcome.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub endpoint: String,
    pub method: String,
    pub duration_ms: u64,
    pub status_code: u16,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MetricSample {
    /// Read-path samples get the tighter latency threshold.
    fn is_read(&self) -> bool {
        matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
    }

    /// Server-side failure, for error-rate and availability purposes.
    fn is_error(&self) -> bool {
        self.status_code >= 500
    }
}

/// Kind of objective that was violated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachKind {
    Latency,
    ErrorRate,
    Availability,
}

impl BreachKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreachKind::Latency => "latency",
            BreachKind::ErrorRate => "error_rate",
            BreachKind::Availability => "availability",
        }
    }
}

/// A detected threshold violation. Derived, not persisted: breaches age out
/// of the in-memory list once older than the longest reporting window.
#[derive(Debug, Clone, Serialize)]
pub struct SloBreach {
    pub kind: BreachKind,
    pub threshold: f64,
    pub actual: f64,
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
}

/// Configurable objective thresholds.
#[derive(Debug, Clone)]
pub struct SloThresholds {
    /// p95 ceiling for read-path requests, milliseconds.
    pub read_p95_ms: u64,
    /// p95 ceiling for write-path requests, milliseconds.
    pub write_p95_ms: u64,
    /// Maximum tolerated error rate (fraction, e.g. 0.01 = 1%).
    pub max_error_rate: f64,
    /// Minimum required availability (fraction, e.g. 0.999 = 99.9%).
    pub min_availability: f64,
}

impl Default for SloThresholds {
    fn default() -> Self {
        Self {
            read_p95_ms: 250,
            write_p95_ms: 500,
            max_error_rate: 0.01,
            min_availability: 0.999,
        }
    }
}

/// Point-in-time report for an endpoint over a window.
#[derive(Debug, Clone, Serialize)]
pub struct SloReport {
    pub endpoint: String,
    pub window: SloWindow,
    pub request_count: usize,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub error_rate: f64,
    pub availability: f64,
    pub breaches: Vec<SloBreach>,
    pub generated_at: DateTime<Utc>,
}

/// Minimum samples in the rolling window before rate-based objectives are
/// evaluated. Prevents a single early failure from tripping the 1% bound.
const MIN_SAMPLES_FOR_RATES: usize = 20;

/// Streaming SLO monitor with a bounded sample buffer.
#[derive(Clone)]
pub struct SloMonitor {
    samples: Arc<RwLock<VecDeque<MetricSample>>>,
    breaches: Arc<RwLock<Vec<SloBreach>>>,
    capacity: usize,
    thresholds: SloThresholds,
    dispatcher: AlertDispatcher,
}

impl SloMonitor {
    pub fn new(capacity: usize, thresholds: SloThresholds, dispatcher: AlertDispatcher) -> Self {
        Self {
            samples: Arc::new(RwLock::new(VecDeque::with_capacity(capacity.max(1)))),
            breaches: Arc::new(RwLock::new(Vec::new())),
            capacity: capacity.max(1),
            thresholds,
            dispatcher,
        }
    }

    /// Record one completed request and evaluate thresholds.
    pub async fn record(&self, sample: MetricSample) {
        let latency_threshold = if sample.is_read() {
            self.thresholds.read_p95_ms
        } else {
            self.thresholds.write_p95_ms
        };

        // Per-sample latency check happens before the buffer mutation so a
        // slow request alerts even if it is immediately evicted.
        if sample.duration_ms > latency_threshold {
            self.raise_breach(SloBreach {
                kind: BreachKind::Latency,
                threshold: latency_threshold as f64,
                actual: sample.duration_ms as f64,
                timestamp: sample.timestamp,
                endpoint: sample.endpoint.clone(),
            })
            .await;
        }

        crate::metrics::record_request_duration(
            &sample.endpoint,
            &sample.method,
            sample.status_code,
            sample.duration_ms as f64 / 1000.0,
        );

        {
            let mut samples = self.samples.write().await;
            if samples.len() >= self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample.clone());
        }

        self.evaluate_rates(&sample.endpoint).await;
    }

    /// Evaluate rolling error-rate and availability over the last hour.
    async fn evaluate_rates(&self, endpoint: &str) {
        let cutoff = Utc::now() - window_delta(SloWindow::Hour);

        let (total, errors) = {
            let samples = self.samples.read().await;
            let mut total = 0usize;
            let mut errors = 0usize;
            for s in samples.iter().filter(|s| s.timestamp >= cutoff) {
                total += 1;
                if s.is_error() {
                    errors += 1;
                }
            }
            (total, errors)
        };

        if total < MIN_SAMPLES_FOR_RATES {
            return;
        }

        let error_rate = errors as f64 / total as f64;
        let availability = 1.0 - error_rate;

        if error_rate >= self.thresholds.max_error_rate {
            self.raise_breach(SloBreach {
                kind: BreachKind::ErrorRate,
                threshold: self.thresholds.max_error_rate,
                actual: error_rate,
                timestamp: Utc::now(),
                endpoint: endpoint.to_string(),
            })
            .await;
        } else if availability <= self.thresholds.min_availability {
            self.raise_breach(SloBreach {
                kind: BreachKind::Availability,
                threshold: self.thresholds.min_availability,
                actual: availability,
                timestamp: Utc::now(),
                endpoint: endpoint.to_string(),
            })
            .await;
        }
    }

    /// Record a breach and emit the detached alert.
    async fn raise_breach(&self, breach: SloBreach) {
        warn!(
            kind = breach.kind.as_str(),
            endpoint = %breach.endpoint,
            threshold = breach.threshold,
            actual = breach.actual,
            "SLO breach detected"
        );
        crate::metrics::record_slo_breach(breach.kind.as_str());

        self.dispatcher.dispatch(Alert {
            text: format!(
                "SLO breach: {} on {} (threshold {}, actual {})",
                breach.kind.as_str(),
                breach.endpoint,
                breach.threshold,
                breach.actual
            ),
            details: serde_json::json!({
                "kind": breach.kind.as_str(),
                "endpoint": breach.endpoint,
                "threshold": breach.threshold,
                "actual": breach.actual,
                "timestamp": breach.timestamp.to_rfc3339(),
            }),
        });

        self.breaches.write().await.push(breach);
    }

    /// Generate a report for `endpoint` over `window`.
    ///
    /// Pure read of the current buffer: no side effects, safe to call
    /// concurrently with writers. Zero samples produce a zeroed report.
    pub async fn report(&self, endpoint: &str, window: SloWindow) -> SloReport {
        let cutoff = Utc::now() - window_delta(window);

        let mut durations: Vec<u64> = Vec::new();
        let mut total = 0usize;
        let mut errors = 0usize;
        {
            let samples = self.samples.read().await;
            for s in samples
                .iter()
                .filter(|s| s.endpoint == endpoint && s.timestamp >= cutoff)
            {
                durations.push(s.duration_ms);
                total += 1;
                if s.is_error() {
                    errors += 1;
                }
            }
        }
        durations.sort_unstable();

        let breaches = {
            let breaches = self.breaches.read().await;
            breaches
                .iter()
                .filter(|b| b.endpoint == endpoint && b.timestamp >= cutoff)
                .cloned()
                .collect()
        };

        let (error_rate, availability) = if total == 0 {
            (0.0, 1.0)
        } else {
            let rate = errors as f64 / total as f64;
            (rate, 1.0 - rate)
        };

        debug!(endpoint, window = window.as_str(), total, "Generated SLO report");

        SloReport {
            endpoint: endpoint.to_string(),
            window,
            request_count: total,
            p50_ms: percentile(&durations, 50.0),
            p95_ms: percentile(&durations, 95.0),
            p99_ms: percentile(&durations, 99.0),
            error_rate,
            availability,
            breaches,
            generated_at: Utc::now(),
        }
    }

    /// Drop breaches older than the longest reporting window.
    ///
    /// Run from the application's background sweep task.
    pub async fn prune_breaches(&self) {
        let cutoff = Utc::now() - window_delta(SloWindow::Week);
        let mut breaches = self.breaches.write().await;
        breaches.retain(|b| b.timestamp >= cutoff);
    }

    /// Current number of buffered samples. Never exceeds the capacity cap.
    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }
}

fn window_delta(window: SloWindow) -> chrono::Duration {
    chrono::Duration::from_std(window.as_duration()).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Order-statistic percentile: rank `ceil(p/100 × n) − 1`, clamped.
///
/// `sorted` must be ascending. Returns 0 for an empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let n = sorted.len();
    let rank = ((p / 100.0) * n as f64).ceil() as usize;
    let index = rank.saturating_sub(1).min(n - 1);
    sorted.get(index).copied().unwrap_or(0)
}
