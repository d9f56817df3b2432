// src/metrics/mod.rs

// Dispatch metrics
// Process-local counters, owned by whoever builds the QueryProcessor and
// shared with the HTTP layer for exposition.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct DispatchMetrics {
    requests_total: AtomicU64,
    requests_failed_total: AtomicU64,
    splits_total: AtomicU64,
    worker_failures_total: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_failed_total: u64,
    pub splits_total: u64,
    pub worker_failures_total: u64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.requests_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Count the sub-queries generated for one request.
    pub fn record_splits(&self, n: usize) {
        self.splits_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Count failed worker responses, whether or not the request survived them.
    pub fn record_worker_failures(&self, n: usize) {
        if n > 0 {
            self.worker_failures_total.fetch_add(n as u64, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed_total: self.requests_failed_total.load(Ordering::Relaxed),
            splits_total: self.splits_total.load(Ordering::Relaxed),
            worker_failures_total: self.worker_failures_total.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition of every counter.
    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let counters = [
            ("dispatcher_requests_total", "All /query requests", snapshot.requests_total),
            (
                "dispatcher_requests_failed_total",
                "Requests that returned an error",
                snapshot.requests_failed_total,
            ),
            ("dispatcher_splits_total", "Number of sub-queries created", snapshot.splits_total),
            (
                "dispatcher_worker_failures_total",
                "Failed or timed-out worker calls",
                snapshot.worker_failures_total,
            ),
        ];

        let mut body = String::new();
        for (name, help, value) in counters {
            let _ = writeln!(body, "# HELP {} {}", name, help);
            let _ = writeln!(body, "# TYPE {} counter", name);
            let _ = writeln!(body, "{} {}", name, value);
        }
        body
    }
}
