//! Metrics collection for relay.
//!
//! Per-queue dispatch counters, read by the server's `/metrics` endpoint.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters for a single queue.
#[derive(Debug, Default)]
pub struct QueueMetrics {
    /// Tasks accepted by `enqueue`.
    pub enqueued: AtomicU64,
    /// Handler invocations started.
    pub dispatched: AtomicU64,
    /// Tasks completed successfully.
    pub succeeded: AtomicU64,
    /// Failures that were scheduled for another attempt.
    pub retried: AtomicU64,
    /// Tasks that reached the terminal failed state.
    pub failed: AtomicU64,
    /// Tasks cancelled by a caller.
    pub cancelled: AtomicU64,
    /// Handler invocations that hit the timeout.
    pub timeouts: AtomicU64,
    /// Scheduling passes that found no rate token.
    pub rate_limited: AtomicU64,
    /// Scheduling passes that found every permit taken.
    pub busy: AtomicU64,
    /// Handler invocations currently running.
    pub in_flight: AtomicU64,
}

impl QueueMetrics {
    /// Record a task submission.
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the start of a handler invocation.
    pub fn start_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the end of a handler invocation.
    pub fn end_dispatch(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a successful task.
    pub fn record_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retry.
    pub fn record_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a terminal failure.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cancellation.
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a handler timeout.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pass blocked by the rate limiter.
    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pass blocked by the concurrency gate.
    pub fn record_busy(&self) {
        self.busy.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of this queue's counters.
    #[must_use]
    pub fn snapshot(&self, queue: &str) -> QueueMetricsSnapshot {
        QueueMetricsSnapshot {
            queue: queue.to_string(),
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            busy: self.busy.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of one queue's counters at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetricsSnapshot {
    pub queue: String,
    pub enqueued: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    pub busy: u64,
    pub in_flight: u64,
}

/// Application metrics collector, one [`QueueMetrics`] per registered queue.
#[derive(Debug, Default)]
pub struct Metrics {
    queues: BTreeMap<String, Arc<QueueMetrics>>,
}

impl Metrics {
    /// Create counters for the given queue names.
    pub fn new<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            queues: queues
                .into_iter()
                .map(|name| (name.into(), Arc::new(QueueMetrics::default())))
                .collect(),
        }
    }

    /// Counters for `queue`, if it is registered.
    #[must_use]
    pub fn queue(&self, queue: &str) -> Option<Arc<QueueMetrics>> {
        self.queues.get(queue).cloned()
    }

    /// Get a snapshot of all queues.
    #[must_use]
    pub fn snapshot(&self) -> Vec<QueueMetricsSnapshot> {
        self.queues
            .iter()
            .map(|(name, metrics)| metrics.snapshot(name))
            .collect()
    }

    /// Export metrics in Prometheus format.
    #[must_use]
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let series: [(&str, &str, &str, fn(&QueueMetricsSnapshot) -> u64); 10] = [
            ("enqueued", "counter", "Tasks enqueued", |s| s.enqueued),
            ("dispatched", "counter", "Handler invocations started", |s| s.dispatched),
            ("succeeded", "counter", "Tasks completed", |s| s.succeeded),
            ("retried", "counter", "Failures scheduled for retry", |s| s.retried),
            ("failed", "counter", "Tasks terminally failed", |s| s.failed),
            ("cancelled", "counter", "Tasks cancelled", |s| s.cancelled),
            ("timeouts", "counter", "Handler timeouts", |s| s.timeouts),
            ("rate_limited", "counter", "Passes blocked by rate limit", |s| s.rate_limited),
            ("busy", "counter", "Passes blocked by concurrency cap", |s| s.busy),
            ("in_flight", "gauge", "Handler invocations running", |s| s.in_flight),
        ];

        for (name, kind, help, value) in series {
            output.push_str(&format!("# HELP relay_tasks_{name} {help}\n"));
            output.push_str(&format!("# TYPE relay_tasks_{name} {kind}\n"));
            for queue in &snapshot {
                output.push_str(&format!(
                    "relay_tasks_{name}{{queue=\"{}\"}} {}\n",
                    queue.queue,
                    value(queue)
                ));
            }
        }

        output
    }
}
