use crate::error::ProbeError;
use crate::services::connector::ProbeConnector;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::HeaderValue;
use hyper::Uri;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use serde::Deserialize;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

/// Idle connections kept per host when `max_idle_conns_per_host` is zero.
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 2;

/// Whether transports consult `HTTP_PROXY`/`HTTPS_PROXY`/`NO_PROXY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Environment,
    Disabled,
}

impl FromStr for ProxyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "environment" | "env" => Ok(ProxyMode::Environment),
            "disabled" | "off" | "none" => Ok(ProxyMode::Disabled),
            other => Err(format!("unknown proxy mode {other:?}")),
        }
    }
}

/// Connection-level tuning for one transport.
///
/// A zero duration disables the corresponding limit and a zero connection
/// cap means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    pub dial_timeout: Duration,
    pub keep_alive: Duration,
    pub max_idle_conns: usize,
    pub max_idle_conns_per_host: usize,
    pub max_conns_per_host: usize,
    pub idle_conn_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    /// Accepted for parity with other transports. Request bodies are always
    /// sent eagerly, so the issuer drops `Expect: 100-continue`.
    pub expect_continue_timeout: Duration,
    /// Offer h2 over ALPN on TLS connections.
    pub force_attempt_http2: bool,
    pub proxy: ProxyMode,
}

impl Default for TransportParams {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(30),
            max_idle_conns: 100,
            max_idle_conns_per_host: 100,
            max_conns_per_host: 100,
            idle_conn_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            expect_continue_timeout: Duration::from_secs(1),
            force_attempt_http2: true,
            proxy: ProxyMode::Environment,
        }
    }
}

impl TransportParams {
    pub fn validate(&self) -> Result<(), ProbeError> {
        if self.max_conns_per_host > Semaphore::MAX_PERMITS {
            return Err(ProbeError::config(format!(
                "max_conns_per_host {} exceeds the supported maximum {}",
                self.max_conns_per_host,
                Semaphore::MAX_PERMITS
            )));
        }

        // An idle cap above the live cap is fine: idle connections are a
        // subset of live ones.
        Ok(())
    }

    /// Idle connections the pool may keep per host, with the global idle cap
    /// folded in.
    pub fn effective_idle_per_host(&self) -> usize {
        let per_host = match self.max_idle_conns_per_host {
            0 => DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            n => n,
        };
        match self.max_idle_conns {
            0 => per_host,
            total => per_host.min(total),
        }
    }
}

/// Zero means "no limit".
pub(crate) fn budget(limit: Duration) -> Option<Duration> {
    if limit.is_zero() {
        None
    } else {
        Some(limit)
    }
}

/// A connection-pooling HTTP transport. Clones share the same connections.
#[derive(Clone)]
pub struct Transport {
    http: Client<ProbeConnector, Full<Bytes>>,
    connector: ProbeConnector,
    params: Arc<TransportParams>,
}

impl Transport {
    pub(crate) fn http(&self) -> &Client<ProbeConnector, Full<Bytes>> {
        &self.http
    }

    pub fn params(&self) -> &TransportParams {
        &self.params
    }

    /// Connections dialed by this transport since it was created.
    pub fn connections_opened(&self) -> u64 {
        self.connector.connections_opened()
    }

    /// True when both handles drive the same connection pool.
    pub fn shares_connections_with(&self, other: &Transport) -> bool {
        self.connector.same_as(&other.connector)
    }

    /// `Proxy-Authorization` for plain-HTTP requests sent through a proxy.
    /// HTTPS requests authenticate on the CONNECT tunnel instead.
    pub fn proxy_authorization(&self, uri: &Uri) -> Option<HeaderValue> {
        if uri.scheme_str() == Some("https") {
            return None;
        }
        self.connector
            .proxy_for(uri)
            .and_then(|intercept| intercept.basic_auth().cloned())
    }
}

/// Builds a fresh transport with its own connection pool.
pub fn create_transport(
    local_address: Option<IpAddr>,
    params: &TransportParams,
) -> Result<Transport, ProbeError> {
    params.validate()?;

    let connector = ProbeConnector::new(local_address, params)?;
    let http: Client<ProbeConnector, Full<Bytes>> = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(budget(params.idle_conn_timeout))
        .pool_max_idle_per_host(params.effective_idle_per_host())
        .pool_timer(TokioTimer::new())
        .retry_canceled_requests(false)
        .build(connector.clone());

    debug!(
        local_address = ?local_address,
        idle_per_host = params.effective_idle_per_host(),
        max_conns_per_host = params.max_conns_per_host,
        "Created transport"
    );

    Ok(Transport {
        http,
        connector,
        params: Arc::new(params.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params() {
        let params = TransportParams::default();
        assert_eq!(params.max_idle_conns, 100);
        assert_eq!(params.max_conns_per_host, 100);
        assert_eq!(params.idle_conn_timeout, Duration::from_secs(90));
        assert_eq!(params.expect_continue_timeout, Duration::from_secs(1));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_lowering_conn_cap_alone_is_accepted() {
        let params = TransportParams {
            max_conns_per_host: 10,
            proxy: ProxyMode::Disabled,
            ..TransportParams::default()
        };
        assert_eq!(params.max_idle_conns_per_host, 100);
        assert!(params.validate().is_ok());
        assert!(create_transport(None, &params).is_ok());
    }

    #[test]
    fn test_conn_cap_above_semaphore_limit_is_rejected() {
        let params = TransportParams {
            max_conns_per_host: Semaphore::MAX_PERMITS + 1,
            ..TransportParams::default()
        };
        assert!(matches!(params.validate(), Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_effective_idle_per_host() {
        let mut params = TransportParams::default();
        params.max_idle_conns = 10;
        assert_eq!(params.effective_idle_per_host(), 10);

        params.max_idle_conns = 0;
        params.max_idle_conns_per_host = 0;
        assert_eq!(params.effective_idle_per_host(), DEFAULT_MAX_IDLE_CONNS_PER_HOST);
    }

    #[test]
    fn test_transports_are_independent() {
        let params = TransportParams {
            proxy: ProxyMode::Disabled,
            ..TransportParams::default()
        };
        let a = create_transport(None, &params).unwrap();
        let b = create_transport(None, &params).unwrap();
        assert!(!a.shares_connections_with(&b));
        assert!(a.shares_connections_with(&a.clone()));
    }

    #[test]
    fn test_proxy_mode_parsing() {
        assert_eq!("disabled".parse::<ProxyMode>(), Ok(ProxyMode::Disabled));
        assert_eq!("ENV".parse::<ProxyMode>(), Ok(ProxyMode::Environment));
        assert!("socks".parse::<ProxyMode>().is_err());
    }
}
