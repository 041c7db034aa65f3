use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::global;
use opentelemetry::metrics::{Counter as OtelCounter, Histogram as OtelHistogram};

/// Metrics recorded by the tracker. Includes lightweight atomics for tests
/// and OpenTelemetry handles for production.
#[derive(Clone)]
pub struct TrackerMetrics {
    pub admitted_total: Arc<AtomicU64>,
    pub replayed_total: Arc<AtomicU64>,
    pub conflicts_total: Arc<AtomicU64>,
    pub mismatches_total: Arc<AtomicU64>,
    pub interrupted_total: Arc<AtomicU64>,
    admission_hist: Option<OtelHistogram<f64>>,
    admitted_counter: Option<OtelCounter<f64>>,
    replayed_counter: Option<OtelCounter<f64>>,
    conflicts_counter: Option<OtelCounter<f64>>,
    mismatches_counter: Option<OtelCounter<f64>>,
    interrupted_counter: Option<OtelCounter<f64>>,
}

impl TrackerMetrics {
    pub fn new() -> Self {
        let meter = global::meter("idemgate");
        Self {
            admitted_total: Arc::new(AtomicU64::new(0)),
            replayed_total: Arc::new(AtomicU64::new(0)),
            conflicts_total: Arc::new(AtomicU64::new(0)),
            mismatches_total: Arc::new(AtomicU64::new(0)),
            interrupted_total: Arc::new(AtomicU64::new(0)),
            admission_hist: Some(meter.f64_histogram("admission_latency_ms").build()),
            admitted_counter: Some(meter.f64_counter("requests_admitted_total").build()),
            replayed_counter: Some(meter.f64_counter("requests_replayed_total").build()),
            conflicts_counter: Some(meter.f64_counter("requests_conflicted_total").build()),
            mismatches_counter: Some(meter.f64_counter("requests_mismatched_total").build()),
            interrupted_counter: Some(meter.f64_counter("requests_interrupted_total").build()),
        }
    }

    pub fn record_admitted(&self, latency: Duration) {
        self.admitted_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.admitted_counter {
            counter.add(1.0, &[]);
        }
        if let Some(hist) = &self.admission_hist {
            hist.record(latency.as_secs_f64() * 1000.0, &[]);
        }
    }

    pub fn record_replayed(&self) {
        self.replayed_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.replayed_counter {
            counter.add(1.0, &[]);
        }
    }

    pub fn record_conflict(&self) {
        self.conflicts_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.conflicts_counter {
            counter.add(1.0, &[]);
        }
    }

    pub fn record_mismatch(&self) {
        self.mismatches_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.mismatches_counter {
            counter.add(1.0, &[]);
        }
    }

    pub fn record_interrupted(&self) {
        self.interrupted_total.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = &self.interrupted_counter {
            counter.add(1.0, &[]);
        }
    }
}

impl Default for TrackerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
