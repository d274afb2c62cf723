use crate::services::http_client_pool::TransportMode;
use serde::Serialize;
use std::time::Duration;

/// Point-in-time copy of the reuse counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub issued: u64,
    pub failed: u64,
    pub reused: u64,
    pub idle_reused: u64,
    pub fresh: u64,
    pub total_time: Duration,
    pub max_time: Duration,
}

impl MetricsSnapshot {
    /// reused / issued
    pub fn reuse_rate(&self) -> f64 {
        ratio(self.reused, self.issued)
    }

    pub fn idle_reuse_rate(&self) -> f64 {
        ratio(self.idle_reused, self.issued)
    }

    /// Mean latency over requests that produced a trace.
    pub fn mean_time(&self) -> Duration {
        match self.reused + self.fresh {
            0 => Duration::ZERO,
            traced => self.total_time / u32::try_from(traced).unwrap_or(u32::MAX),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReuseSummary {
    pub requests: u64,
    pub failed: u64,
    pub reused: u64,
    pub idle_reused: u64,
    pub fresh: u64,
    pub reuse_rate: f64,
    pub idle_reuse_rate: f64,
    pub mean_ms: f64,
    pub max_ms: f64,
    pub elapsed_ms: f64,
}

impl ReuseSummary {
    pub fn new(snapshot: &MetricsSnapshot, elapsed: Duration) -> Self {
        Self {
            requests: snapshot.issued,
            failed: snapshot.failed,
            reused: snapshot.reused,
            idle_reused: snapshot.idle_reused,
            fresh: snapshot.fresh,
            reuse_rate: snapshot.reuse_rate(),
            idle_reuse_rate: snapshot.idle_reuse_rate(),
            mean_ms: millis(snapshot.mean_time()),
            max_ms: millis(snapshot.max_time),
            elapsed_ms: millis(elapsed),
        }
    }
}

fn millis(duration: Duration) -> f64 {
    duration.as_micros() as f64 / 1000.0
}

#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub round: usize,
    #[serde(flatten)]
    pub summary: ReuseSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    pub target: String,
    pub pool_size: usize,
    pub transport_mode: TransportMode,
    pub concurrency: usize,
    pub rounds: Vec<RoundReport>,
    pub total: ReuseSummary,
}
