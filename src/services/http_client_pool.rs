use crate::error::ProbeError;
use crate::services::transport::{create_transport, Transport, TransportParams};
use crate::utils::auth::Credentials;
use hyper::header::HeaderValue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// How pooled clients map onto transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportMode {
    /// Every client owns its own transport and connection budget.
    #[default]
    PerClient,
    /// All clients drive one transport and share its connection budget.
    Shared,
}

impl FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "per_client" => Ok(TransportMode::PerClient),
            "shared" => Ok(TransportMode::Shared),
            other => Err(format!("unknown transport mode {other:?}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub credentials: Option<Credentials>,
    pub transport: TransportParams,
    pub transport_mode: TransportMode,
    /// Overall budget for one request, body included.
    pub request_timeout: Option<Duration>,
    /// Source address for outgoing connections.
    pub local_address: Option<IpAddr>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 10,
            credentials: None,
            transport: TransportParams::default(),
            transport_mode: TransportMode::PerClient,
            request_timeout: None,
            local_address: None,
        }
    }
}

/// An HTTP client built once at pool construction and handed out by
/// reference for the lifetime of the pool.
pub struct PooledClient {
    index: usize,
    transport: Transport,
    authorization: Option<HeaderValue>,
    request_timeout: Option<Duration>,
}

impl PooledClient {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn default_authorization(&self) -> Option<&HeaderValue> {
        self.authorization.as_ref()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }
}

pub struct HttpClientPool {
    clients: Vec<PooledClient>,
    cursor: Mutex<usize>,
    mode: TransportMode,
}

impl HttpClientPool {
    pub fn new(config: PoolConfig) -> Result<Self, ProbeError> {
        if config.size < 1 {
            return Err(ProbeError::config("pool size must be at least 1"));
        }

        let authorization = config
            .credentials
            .as_ref()
            .map(Credentials::authorization_header)
            .transpose()?;

        let shared = match config.transport_mode {
            TransportMode::Shared => Some(create_transport(config.local_address, &config.transport)?),
            TransportMode::PerClient => None,
        };

        let mut clients = Vec::with_capacity(config.size);
        for index in 0..config.size {
            let transport = match &shared {
                Some(transport) => transport.clone(),
                None => create_transport(config.local_address, &config.transport)?,
            };

            clients.push(PooledClient {
                index,
                transport,
                authorization: authorization.clone(),
                request_timeout: config.request_timeout,
            });
        }

        info!(
            size = config.size,
            mode = ?config.transport_mode,
            authenticated = authorization.is_some(),
            "Client pool ready"
        );

        Ok(Self {
            clients,
            cursor: Mutex::new(0),
            mode: config.transport_mode,
        })
    }

    /// Next client in round-robin order. The lock only covers the index
    /// arithmetic.
    pub fn acquire(&self) -> &PooledClient {
        let index = {
            let mut cursor = self.cursor.lock();
            let index = *cursor % self.clients.len();
            *cursor = (index + 1) % self.clients.len();
            index
        };
        &self.clients[index]
    }

    pub fn size(&self) -> usize {
        self.clients.len()
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn clients(&self) -> &[PooledClient] {
        &self.clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::transport::ProxyMode;

    fn config(size: usize, transport_mode: TransportMode) -> PoolConfig {
        PoolConfig {
            size,
            transport_mode,
            transport: TransportParams {
                proxy: ProxyMode::Disabled,
                ..TransportParams::default()
            },
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_zero_size_is_rejected() {
        let result = HttpClientPool::new(config(0, TransportMode::PerClient));
        assert!(matches!(result, Err(ProbeError::Config(_))));
    }

    #[test]
    fn test_round_robin_wraps() {
        let pool = HttpClientPool::new(config(3, TransportMode::PerClient)).unwrap();
        let order: Vec<usize> = (0..7).map(|_| pool.acquire().index()).collect();
        assert_eq!(order, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn test_single_client_pool() {
        let pool = HttpClientPool::new(config(1, TransportMode::PerClient)).unwrap();
        for _ in 0..5 {
            assert_eq!(pool.acquire().index(), 0);
        }
    }

    #[test]
    fn test_transport_modes() {
        let per_client = HttpClientPool::new(config(3, TransportMode::PerClient)).unwrap();
        let clients = per_client.clients();
        assert!(!clients[0].transport().shares_connections_with(clients[1].transport()));

        let shared = HttpClientPool::new(config(3, TransportMode::Shared)).unwrap();
        let clients = shared.clients();
        assert!(clients[0].transport().shares_connections_with(clients[2].transport()));
        assert_eq!(shared.mode(), TransportMode::Shared);
    }

    #[test]
    fn test_credentials_become_default_authorization() {
        let pool = HttpClientPool::new(PoolConfig {
            credentials: Some(Credentials::new("username", "password")),
            ..config(2, TransportMode::Shared)
        })
        .unwrap();

        for client in pool.clients() {
            assert_eq!(
                client.default_authorization().unwrap(),
                "Basic dXNlcm5hbWU6cGFzc3dvcmQ="
            );
        }
    }

    #[test]
    fn test_transport_mode_parsing() {
        assert_eq!("per-client".parse::<TransportMode>(), Ok(TransportMode::PerClient));
        assert_eq!("Shared".parse::<TransportMode>(), Ok(TransportMode::Shared));
        assert!("pooled".parse::<TransportMode>().is_err());
    }
}
