use crate::models::report::MetricsSnapshot;
use crate::models::trace::RequestTrace;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub struct ReuseMetrics {
    issued: AtomicU64,
    failed: AtomicU64,
    reused: AtomicU64,
    idle_reused: AtomicU64,
    fresh: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
}

impl ReuseMetrics {
    pub fn new() -> Self {
        Self {
            issued: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            idle_reused: AtomicU64::new(0),
            fresh: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
        }
    }

    pub fn record_success(&self, trace: &RequestTrace) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.record_trace(trace);
    }

    /// A failed request. Body-read failures still carry a trace and count
    /// towards the reuse figures.
    pub fn record_failure(&self, trace: Option<&RequestTrace>) {
        self.issued.fetch_add(1, Ordering::Relaxed);
        self.failed.fetch_add(1, Ordering::Relaxed);
        if let Some(trace) = trace {
            self.record_trace(trace);
        }
    }

    fn record_trace(&self, trace: &RequestTrace) {
        if trace.is_conn_reused {
            self.reused.fetch_add(1, Ordering::Relaxed);
            if trace.is_conn_was_idle {
                self.idle_reused.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.fresh.fetch_add(1, Ordering::Relaxed);
        }

        let micros = u64::try_from(trace.total_time.as_micros()).unwrap_or(u64::MAX);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
    }

    pub fn get_issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn get_failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn get_reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            issued: self.get_issued(),
            failed: self.get_failed(),
            reused: self.get_reused(),
            idle_reused: self.idle_reused.load(Ordering::Relaxed),
            fresh: self.fresh.load(Ordering::Relaxed),
            total_time: Duration::from_micros(self.total_micros.load(Ordering::Relaxed)),
            max_time: Duration::from_micros(self.max_micros.load(Ordering::Relaxed)),
        }
    }
}

impl Default for ReuseMetrics {
    fn default() -> Self {
        Self::new()
    }
}
