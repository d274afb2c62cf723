use crate::models::report::{DriverReport, ReuseSummary, RoundReport};
use crate::services::http_client_pool::HttpClientPool;
use crate::services::request_issuer::issue;
use crate::services::reuse_metrics::ReuseMetrics;
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Uri};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

/// How long each task keeps issuing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    Requests(u64),
    Duration(Duration),
}

#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub target: Uri,
    pub method: Method,
    pub concurrency: usize,
    pub pacing: Pacing,
    pub rounds: usize,
    pub round_pause: Duration,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            target: Uri::from_static("http://localhost:8080/"),
            method: Method::GET,
            concurrency: 10,
            pacing: Pacing::Requests(6),
            rounds: 2,
            round_pause: Duration::from_secs(2),
        }
    }
}

/// Runs waves of concurrent tasks against one target. Each task acquires a
/// client once and then issues its requests through it.
pub struct Driver {
    pool: Arc<HttpClientPool>,
    settings: Arc<DriverSettings>,
    metrics: Arc<ReuseMetrics>,
}

impl Driver {
    pub fn new(pool: Arc<HttpClientPool>, settings: DriverSettings) -> Self {
        Self {
            pool,
            settings: Arc::new(settings),
            metrics: Arc::new(ReuseMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &ReuseMetrics {
        &self.metrics
    }

    pub async fn run(&self) -> DriverReport {
        let started = Instant::now();
        let mut rounds = Vec::with_capacity(self.settings.rounds);

        for round in 0..self.settings.rounds {
            if round > 0 && !self.settings.round_pause.is_zero() {
                sleep(self.settings.round_pause).await;
            }
            info!("=================== round {} ===================", round);
            rounds.push(self.run_round(round).await);
        }

        DriverReport {
            target: self.settings.target.to_string(),
            pool_size: self.pool.size(),
            transport_mode: self.pool.mode(),
            concurrency: self.settings.concurrency,
            rounds,
            total: ReuseSummary::new(&self.metrics.snapshot(), started.elapsed()),
        }
    }

    async fn run_round(&self, round: usize) -> RoundReport {
        let started = Instant::now();
        let round_metrics = Arc::new(ReuseMetrics::new());
        let mut tasks = JoinSet::new();

        for task in 0..self.settings.concurrency {
            let pool = self.pool.clone();
            let settings = self.settings.clone();
            let sinks = [round_metrics.clone(), self.metrics.clone()];
            tasks.spawn(async move { run_task(task, &pool, &settings, &sinks).await });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Probe task aborted: {}", e);
            }
        }

        let summary = ReuseSummary::new(&round_metrics.snapshot(), started.elapsed());
        info!(
            round,
            requests = summary.requests,
            reused = summary.reused,
            failed = summary.failed,
            "Round finished, reuse rate {:.2}",
            summary.reuse_rate
        );

        RoundReport { round, summary }
    }
}

async fn run_task(
    task: usize,
    pool: &HttpClientPool,
    settings: &DriverSettings,
    sinks: &[Arc<ReuseMetrics>],
) {
    let client = pool.acquire();
    let deadline = match settings.pacing {
        Pacing::Duration(limit) => Some(Instant::now() + limit),
        Pacing::Requests(_) => None,
    };

    let mut count = 0u64;
    loop {
        match (settings.pacing, deadline) {
            (Pacing::Requests(limit), _) if count >= limit => break,
            (_, Some(deadline)) if Instant::now() >= deadline => break,
            _ => {}
        }

        let outcome = issue(
            client,
            settings.method.clone(),
            &settings.target,
            Bytes::new(),
            HeaderMap::new(),
        )
        .await;

        match outcome {
            Ok((response, trace)) => {
                info!(
                    task,
                    client = client.index(),
                    connection = trace.connection_id,
                    status = response.status().as_u16(),
                    reused = trace.is_conn_reused,
                    was_idle = trace.is_conn_was_idle,
                    total_ms = trace.total_time.as_millis() as u64,
                    "Finished {} request #{}",
                    settings.method,
                    count
                );
                for sink in sinks {
                    sink.record_success(&trace);
                }
            }
            Err(e) => {
                warn!(task, client = client.index(), "Request #{} failed: {}", count, e);
                if let Some(trace) = e.trace() {
                    warn!(
                        reused = trace.is_conn_reused,
                        was_idle = trace.is_conn_was_idle,
                        "Connection trace of failed request #{}",
                        count
                    );
                }
                for sink in sinks {
                    sink.record_failure(e.trace());
                }
            }
        }
        count += 1;
    }
}
