pub mod connector;
pub mod demo_server;
pub mod driver;
pub mod http_client_pool;
pub mod request_issuer;
pub mod reuse_metrics;
pub mod transport;

pub use demo_server::{DemoServer, DemoServerHandle};
pub use driver::{Driver, DriverSettings, Pacing};
pub use http_client_pool::{HttpClientPool, PoolConfig, PooledClient, TransportMode};
pub use request_issuer::issue;
pub use reuse_metrics::ReuseMetrics;
pub use transport::{create_transport, ProxyMode, Transport, TransportParams};
