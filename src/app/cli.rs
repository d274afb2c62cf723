use crate::app::config::Config;
use crate::error::ProbeError;
use crate::services::http_client_pool::TransportMode;
use clap::Parser;
use std::env;
use std::path::PathBuf;

#[derive(Debug, Default, Parser)]
#[command(
    name = "conn-reuse-probe",
    version,
    about = "Issue concurrent requests through a round-robin client pool and report connection reuse"
)]
pub struct Cli {
    /// TOML configuration file (falls back to $PROBE_CONFIG)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// URL every task requests
    #[arg(short, long)]
    pub target: Option<String>,

    /// Number of pre-built clients
    #[arg(long)]
    pub pool_size: Option<usize>,

    /// Concurrent tasks per round
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Requests issued by each task
    #[arg(short, long)]
    pub requests_per_task: Option<u64>,

    /// Run each task for this many milliseconds instead of a request count
    #[arg(long)]
    pub duration_ms: Option<i64>,

    #[arg(long)]
    pub rounds: Option<usize>,

    /// Let all clients share one transport
    #[arg(long)]
    pub shared_transport: bool,

    /// Do not start the local demo server
    #[arg(long)]
    pub no_demo_server: bool,
}

impl Cli {
    pub fn load_config(&self) -> Result<Config, ProbeError> {
        let path = self
            .config
            .clone()
            .or_else(|| env::var_os("PROBE_CONFIG").map(PathBuf::from));
        let mut config = Config::load(path.as_deref())?;
        self.apply(&mut config);
        Ok(config)
    }

    /// Flags win over every other configuration layer.
    pub fn apply(&self, config: &mut Config) {
        if let Some(target) = &self.target {
            config.driver.target = target.clone();
        }
        if let Some(size) = self.pool_size {
            config.pool.size = size;
        }
        if let Some(concurrency) = self.concurrency {
            config.driver.concurrency = concurrency;
        }
        if let Some(requests) = self.requests_per_task {
            config.driver.requests_per_task = requests;
        }
        if let Some(duration) = self.duration_ms {
            config.driver.duration_ms = Some(duration);
        }
        if let Some(rounds) = self.rounds {
            config.driver.rounds = rounds;
        }
        if self.shared_transport {
            config.pool.transport_mode = TransportMode::Shared;
        }
        if self.no_demo_server {
            config.demo.enabled = false;
        }
    }
}
