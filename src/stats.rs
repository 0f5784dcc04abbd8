//! Feed statistics: independent atomic counters updated by every completed
//! operation and readable at any time, including while operations are in
//! flight.
//!
//! Each field is updated with a single atomic operation; a snapshot may
//! therefore combine counters from slightly different instants. Once the
//! dispatcher has drained, `requests == responses + transport_errors`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

#[derive(Debug, Default)]
pub struct Stats {
    requests: AtomicU64,
    responses: AtomicU64,
    transport_errors: AtomicU64,
    ok: AtomicU64,
    failed: AtomicU64,
    inflight: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    latency_min_ms: AtomicU64,
    latency_max_ms: AtomicU64,
    latency_sum_ms: AtomicU64,
    status_counts: Mutex<BTreeMap<u16, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            latency_min_ms: AtomicU64::new(u64::MAX),
            ..Default::default()
        }
    }

    /// A request is about to be issued.
    pub fn record_dispatch(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    /// An HTTP response was received (any status).
    pub fn record_response(&self, status: u16, bytes_sent: u64, bytes_received: u64, latency: Duration) {
        self.responses.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes_received, Ordering::Relaxed);
        if (200..300).contains(&status) {
            self.ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let millis = latency.as_millis() as u64;
        self.latency_min_ms.fetch_min(millis, Ordering::Relaxed);
        self.latency_max_ms.fetch_max(millis, Ordering::Relaxed);
        self.latency_sum_ms.fetch_add(millis, Ordering::Relaxed);
        *self.status_counts.lock().entry(status).or_insert(0) += 1;
    }

    /// The request failed before an HTTP response arrived.
    pub fn record_transport_error(&self, bytes_sent: u64) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.inflight.fetch_sub(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes_sent, Ordering::Relaxed);
    }

    /// Point-in-time snapshot. Safe to call while operations are in flight.
    pub fn snapshot(&self) -> StatsSnapshot {
        let responses = self.responses.load(Ordering::Relaxed);
        let min = self.latency_min_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            responses,
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            inflight: self.inflight.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            latency_min_ms: if min == u64::MAX { 0 } else { min },
            latency_max_ms: self.latency_max_ms.load(Ordering::Relaxed),
            latency_avg_ms: if responses == 0 {
                0
            } else {
                self.latency_sum_ms.load(Ordering::Relaxed) / responses
            },
            status_counts: self.status_counts.lock().clone(),
        }
    }
}

/// A point-in-time view of the counters, plus summary rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub responses: u64,
    pub transport_errors: u64,
    pub ok: u64,
    pub failed: u64,
    pub inflight: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub latency_min_ms: u64,
    pub latency_avg_ms: u64,
    pub latency_max_ms: u64,
    pub status_counts: BTreeMap<u16, u64>,
}

impl StatsSnapshot {
    /// Render the feed summary object for reporting.
    pub fn summary(&self, elapsed: Duration) -> serde_json::Value {
        let seconds = elapsed.as_secs_f64();
        let rate = |count: u64| {
            if seconds > 0.0 {
                round3(count as f64 / seconds)
            } else {
                0.0
            }
        };
        let mbps = |bytes: u64| {
            if seconds > 0.0 {
                round3(bytes as f64 / seconds / 1_000_000.0)
            } else {
                0.0
            }
        };
        let response_errors: u64 = self
            .status_counts
            .iter()
            .filter(|(status, _)| **status >= 400)
            .map(|(_, count)| count)
            .sum();
        let code_counts: serde_json::Map<String, serde_json::Value> = self
            .status_counts
            .iter()
            .map(|(status, count)| (status.to_string(), json!(count)))
            .collect();

        json!({
            "feeder.seconds": round3(seconds),
            "feeder.ok.count": self.ok,
            "feeder.ok.rate": rate(self.ok),
            "feeder.error.count": self.failed,
            "feeder.inflight.count": self.inflight,
            "http.request.count": self.requests,
            "http.request.bytes": self.bytes_sent,
            "http.request.MBps": mbps(self.bytes_sent),
            "http.response.count": self.responses,
            "http.response.bytes": self.bytes_received,
            "http.response.MBps": mbps(self.bytes_received),
            "http.response.error.count": response_errors,
            "http.response.latency.millis.min": self.latency_min_ms,
            "http.response.latency.millis.avg": self.latency_avg_ms,
            "http.response.latency.millis.max": self.latency_max_ms,
            "http.response.code.counts": code_counts,
        })
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
