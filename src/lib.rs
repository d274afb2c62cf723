//! Round-robin HTTP client pool with per-request connection reuse telemetry.

pub mod app;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;
pub mod utils;

pub use error::{NetworkFailure, ProbeError};
pub use models::{DriverReport, RequestTrace};
pub use services::{
    create_transport, issue, DemoServer, Driver, DriverSettings, HttpClientPool,
    Pacing, PoolConfig, PooledClient, Transport, TransportMode, TransportParams,
};
