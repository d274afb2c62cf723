use anyhow::Context;
use clap::Parser;
use conn_reuse_probe::app::Cli;
use conn_reuse_probe::services::{DemoServer, Driver, HttpClientPool};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.load_config()?;
    let pool_config = config.pool_config()?;
    let driver_settings = config.driver_settings()?;

    let demo = if config.demo.enabled {
        let server = DemoServer::bind(config.demo.bind, config.demo_delay()?)
            .await
            .with_context(|| format!("binding demo server on {}", config.demo.bind))?;
        Some(server.spawn()?)
    } else {
        None
    };

    info!(
        "Probing {} with {} tasks x {} rounds",
        driver_settings.target, driver_settings.concurrency, driver_settings.rounds
    );

    let pool = Arc::new(HttpClientPool::new(pool_config)?);
    let driver = Driver::new(pool, driver_settings);

    let report = tokio::select! {
        report = driver.run() => Some(report),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, abandoning the run");
            None
        }
    };

    if let Some(report) = report {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if let Some(demo) = demo {
        demo.shutdown().await;
    }

    Ok(())
}
