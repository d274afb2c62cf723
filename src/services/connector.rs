//! Connection-level plumbing underneath each transport.
//!
//! `ProbeConnector` dials TCP (optionally through a proxy), runs the TLS
//! handshake with ALPN, caps live connections per host and stamps every
//! connection with a `ConnectionMeta`. The legacy hyper client copies that
//! meta into the extensions of every response served on the connection,
//! which is how the request issuer tells fresh connections from reused ones.
//!
//! The legacy client puts a finished HTTP/1 connection back into its idle
//! pool from a separately spawned task. A request issued right after the
//! previous one finished can reach the connector before that hand-back, so
//! the connector holds such a dial for a few milliseconds while a connection
//! to the same host is still on its way back.

use crate::error::{BoxError, ProbeError};
use crate::services::transport::{budget, ProxyMode, TransportParams};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::proxy::matcher::{Intercept, Matcher};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::crypto::ring::default_provider;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::collections::HashMap;
use std::future::{poll_fn, Future};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower_service::Service;
use tracing::debug;
use webpki_roots::TLS_SERVER_ROOTS;

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("no host in {0}")]
    MissingHost(String),

    #[error("dial failed: {0}")]
    Dial(#[source] BoxError),

    #[error("connection slots for {0} are closed")]
    HostLimit(String),

    #[error("invalid TLS server name {0}")]
    ServerName(String),

    #[error("TLS handshake timed out after {0:?}")]
    TlsTimeout(Duration),

    #[error("TLS handshake failed: {0}")]
    Tls(#[source] io::Error),

    #[error("unsupported proxy scheme in {0}")]
    ProxyScheme(String),

    #[error("proxy tunnel failed: {0}")]
    Proxy(#[source] BoxError),
}

/// Usage counters shared by every response served on one connection.
#[derive(Debug)]
pub struct ConnectionUsage {
    established: Instant,
    served: AtomicU64,
    in_flight: AtomicUsize,
    // Nanoseconds after `established` at which the connection last went idle.
    idle_mark: AtomicU64,
    // Set when the last exchange finished, cleared by the next write.
    parked: AtomicBool,
    closed: AtomicBool,
}

/// What a connection looked like right before a request started using it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub served_before: u64,
    pub in_flight_before: usize,
    pub idle_for: Option<Duration>,
}

/// Marks a request as in flight on its connection until dropped.
#[derive(Debug)]
pub struct InFlight {
    usage: Arc<ConnectionUsage>,
}

const NOT_IDLE: u64 = u64::MAX;

/// How long a dial waits for a just-finished connection to reach the idle pool.
const HANDBACK_GRACE: Duration = Duration::from_millis(10);
const HANDBACK_POLL: Duration = Duration::from_millis(1);

impl ConnectionUsage {
    fn new() -> Self {
        Self {
            established: Instant::now(),
            served: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            idle_mark: AtomicU64::new(NOT_IDLE),
            parked: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn begin(self: &Arc<Self>) -> (UsageSnapshot, InFlight) {
        let in_flight_before = self.in_flight.fetch_add(1, Ordering::AcqRel);
        let served_before = self.served.fetch_add(1, Ordering::AcqRel);

        let idle_for = if in_flight_before == 0 {
            match self.idle_mark.swap(NOT_IDLE, Ordering::AcqRel) {
                NOT_IDLE => None,
                mark => Some(
                    self.established
                        .elapsed()
                        .saturating_sub(Duration::from_nanos(mark)),
                ),
            }
        } else {
            None
        };

        let snapshot = UsageSnapshot {
            served_before,
            in_flight_before,
            idle_for,
        };
        (snapshot, InFlight { usage: Arc::clone(self) })
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Acquire)
    }

    /// True while the connection is open, has not started another exchange
    /// and went idle less than `window` ago.
    fn just_released(&self, window: Duration) -> bool {
        if !self.parked.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return false;
        }
        match self.idle_mark.load(Ordering::Acquire) {
            NOT_IDLE => false,
            mark => {
                let idle_for = self
                    .established
                    .elapsed()
                    .saturating_sub(Duration::from_nanos(mark));
                idle_for < window
            }
        }
    }

    fn mark_writing(&self) {
        if self.parked.load(Ordering::Relaxed) {
            self.parked.store(false, Ordering::Release);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.usage.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mark = self.usage.established.elapsed().as_nanos();
            let mark = u64::try_from(mark).unwrap_or(NOT_IDLE - 1);
            self.usage.idle_mark.store(mark, Ordering::Release);
            self.usage.parked.store(true, Ordering::Release);
        }
    }
}

/// Attached to every response as an extension.
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    pub id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub connect_time: Duration,
    pub tls_handshake_time: Option<Duration>,
    pub negotiated_h2: bool,
    pub usage: Arc<ConnectionUsage>,
}

enum ProbeStream {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

/// An established connection plus its bookkeeping.
pub struct TrackedStream {
    stream: ProbeStream,
    proxied: bool,
    meta: ConnectionMeta,
    _slot: Option<OwnedSemaphorePermit>,
}

impl Connection for TrackedStream {
    fn connected(&self) -> Connected {
        let connected = match &self.stream {
            ProbeStream::Plain(io) => io.inner().connected(),
            ProbeStream::Tls(io) => io.inner().get_ref().0.connected(),
        };
        let connected = if self.meta.negotiated_h2 {
            connected.negotiated_h2()
        } else {
            connected
        };
        connected.proxy(self.proxied).extra(self.meta.clone())
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        self.meta.usage.closed.store(true, Ordering::Release);
    }
}

impl Read for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ProbeStream::Plain(io) => Pin::new(io).poll_read(cx, buf),
            ProbeStream::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for TrackedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.meta.usage.mark_writing();
        match &mut this.stream {
            ProbeStream::Plain(io) => Pin::new(io).poll_write(cx, buf),
            ProbeStream::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ProbeStream::Plain(io) => Pin::new(io).poll_flush(cx),
            ProbeStream::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().stream {
            ProbeStream::Plain(io) => Pin::new(io).poll_shutdown(cx),
            ProbeStream::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match &self.stream {
            ProbeStream::Plain(io) => io.is_write_vectored(),
            ProbeStream::Tls(io) => io.is_write_vectored(),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.meta.usage.mark_writing();
        match &mut this.stream {
            ProbeStream::Plain(io) => Pin::new(io).poll_write_vectored(cx, bufs),
            ProbeStream::Tls(io) => Pin::new(io).poll_write_vectored(cx, bufs),
        }
    }
}

// Per `host:port` bookkeeping. Entries are dropped once they hold no open
// connection and no dial or permit still refers to their semaphore.
#[derive(Default)]
struct HostState {
    slots: Option<Arc<Semaphore>>,
    connections: Vec<Weak<ConnectionUsage>>,
}

impl HostState {
    fn live(&self) -> impl Iterator<Item = Arc<ConnectionUsage>> + '_ {
        self.connections
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|usage| !usage.is_closed())
    }

    fn in_use(&self) -> bool {
        let slots_shared = self
            .slots
            .as_ref()
            .map_or(false, |slots| Arc::strong_count(slots) > 1);
        slots_shared || self.live().next().is_some()
    }
}

struct ConnectorInner {
    http: HttpConnector,
    tls: TlsConnector,
    proxies: Option<Matcher>,
    tls_handshake_timeout: Duration,
    max_conns_per_host: usize,
    hosts: Mutex<HashMap<String, HostState>>,
    next_id: AtomicU64,
}

/// Dials connections for one transport. Clones share the same slot table
/// and connection counter.
#[derive(Clone)]
pub struct ProbeConnector {
    inner: Arc<ConnectorInner>,
}

impl ProbeConnector {
    pub fn new(local_address: Option<IpAddr>, params: &TransportParams) -> Result<Self, ProbeError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(budget(params.dial_timeout));
        http.set_keepalive(budget(params.keep_alive));
        http.set_local_address(local_address);

        let tls_config = tls_client_config(params)?;

        let proxies = match params.proxy {
            ProxyMode::Environment => Some(Matcher::from_env()),
            ProxyMode::Disabled => None,
        };

        Ok(Self {
            inner: Arc::new(ConnectorInner {
                http,
                tls: TlsConnector::from(Arc::new(tls_config)),
                proxies,
                tls_handshake_timeout: params.tls_handshake_timeout,
                max_conns_per_host: params.max_conns_per_host,
                hosts: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Number of connections this connector has established so far.
    pub fn connections_opened(&self) -> u64 {
        self.inner.next_id.load(Ordering::Acquire)
    }

    pub fn same_as(&self, other: &ProbeConnector) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The proxy that would carry a request to `dst`, if any.
    pub fn proxy_for(&self, dst: &Uri) -> Option<Intercept> {
        let matcher = self.inner.proxies.as_ref()?;
        if is_loopback(dst) {
            return None;
        }
        matcher.intercept(dst)
    }
}

impl Service<Uri> for ProbeConnector {
    type Response = TrackedStream;
    type Error = ConnectError;
    type Future = Pin<Box<dyn Future<Output = Result<TrackedStream, ConnectError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let connector = self.clone();
        Box::pin(async move { connector.connect(dst).await })
    }
}

impl ProbeConnector {
    async fn connect(&self, dst: Uri) -> Result<TrackedStream, ConnectError> {
        let host = dst
            .host()
            .map(strip_brackets)
            .ok_or_else(|| ConnectError::MissingHost(dst.to_string()))?
            .to_owned();
        let is_https = dst.scheme_str() == Some("https");
        let port = dst.port_u16().unwrap_or(if is_https { 443 } else { 80 });

        let key = format!("{host}:{port}");
        self.await_handback(&key).await;
        let slot = self.reserve_host_slot(&key).await?;

        let started = Instant::now();
        let (tcp, proxied) = match self.proxy_for(&dst) {
            Some(intercept) => {
                if intercept.uri().scheme_str() != Some("http") {
                    return Err(ConnectError::ProxyScheme(intercept.uri().to_string()));
                }
                if is_https {
                    (self.tunnel(&intercept, dst.clone()).await?, false)
                } else {
                    (self.dial(intercept.uri().clone()).await?, true)
                }
            }
            None => (self.dial(dst.clone()).await?, false),
        };
        let connect_time = started.elapsed();

        let tcp = tcp.into_inner();
        let remote_addr = tcp.peer_addr().ok();
        let id = self.inner.next_id.fetch_add(1, Ordering::AcqRel) + 1;

        let (stream, tls_handshake_time, negotiated_h2) = if is_https {
            let (tls, elapsed) = self.handshake(&host, tcp).await?;
            let h2 = tls.get_ref().1.alpn_protocol() == Some(b"h2".as_slice());
            (ProbeStream::Tls(TokioIo::new(tls)), Some(elapsed), h2)
        } else {
            (ProbeStream::Plain(TokioIo::new(tcp)), None, false)
        };

        debug!(
            connection = id,
            host = %host,
            port,
            proxied,
            h2 = negotiated_h2,
            connect_ms = connect_time.as_millis() as u64,
            "Established connection"
        );

        let usage = Arc::new(ConnectionUsage::new());
        self.track(&key, &usage);

        Ok(TrackedStream {
            stream,
            proxied,
            meta: ConnectionMeta {
                id,
                remote_addr,
                connect_time,
                tls_handshake_time,
                negotiated_h2,
                usage,
            },
            _slot: slot,
        })
    }

    async fn await_handback(&self, key: &str) {
        let started = Instant::now();
        while started.elapsed() < HANDBACK_GRACE && self.handback_pending(key) {
            sleep(HANDBACK_POLL).await;
        }
    }

    fn handback_pending(&self, key: &str) -> bool {
        let hosts = self.inner.hosts.lock();
        hosts.get(key).map_or(false, |state| {
            state.live().any(|usage| usage.just_released(HANDBACK_GRACE))
        })
    }

    fn track(&self, key: &str, usage: &Arc<ConnectionUsage>) {
        let mut hosts = self.inner.hosts.lock();
        hosts
            .entry(key.to_owned())
            .or_default()
            .connections
            .push(Arc::downgrade(usage));

        hosts.retain(|_, state| {
            state
                .connections
                .retain(|weak| weak.upgrade().map_or(false, |usage| !usage.is_closed()));
            state.in_use()
        });
    }

    async fn reserve_host_slot(&self, key: &str) -> Result<Option<OwnedSemaphorePermit>, ConnectError> {
        if self.inner.max_conns_per_host == 0 {
            return Ok(None);
        }

        let max_conns_per_host = self.inner.max_conns_per_host;
        let semaphore = {
            let mut hosts = self.inner.hosts.lock();
            hosts
                .entry(key.to_owned())
                .or_default()
                .slots
                .get_or_insert_with(|| Arc::new(Semaphore::new(max_conns_per_host)))
                .clone()
        };

        if semaphore.available_permits() == 0 {
            debug!(host = key, "Waiting for a free connection slot");
        }

        semaphore
            .acquire_owned()
            .await
            .map(Some)
            .map_err(|_| ConnectError::HostLimit(key.to_owned()))
    }

    async fn dial(&self, target: Uri) -> Result<TokioIo<TcpStream>, ConnectError> {
        let mut http = self.inner.http.clone();
        http.call(target).await.map_err(|e| ConnectError::Dial(e.into()))
    }

    async fn tunnel(&self, intercept: &Intercept, dst: Uri) -> Result<TokioIo<TcpStream>, ConnectError> {
        let mut tunnel = Tunnel::new(intercept.uri().clone(), self.inner.http.clone());
        if let Some(auth) = intercept.basic_auth() {
            tunnel = tunnel.with_auth(auth.clone());
        }

        poll_fn(|cx| tunnel.poll_ready(cx))
            .await
            .map_err(|e| ConnectError::Proxy(e.into()))?;
        tunnel.call(dst).await.map_err(|e| ConnectError::Proxy(e.into()))
    }

    async fn handshake(
        &self,
        host: &str,
        tcp: TcpStream,
    ) -> Result<(TlsStream<TcpStream>, Duration), ConnectError> {
        let server_name = ServerName::try_from(host.to_owned())
            .map_err(|_| ConnectError::ServerName(host.to_owned()))?;

        let started = Instant::now();
        let handshake = self.inner.tls.connect(server_name, tcp);
        let stream = match budget(self.inner.tls_handshake_timeout) {
            Some(limit) => timeout(limit, handshake)
                .await
                .map_err(|_| ConnectError::TlsTimeout(limit))?,
            None => handshake.await,
        }
        .map_err(ConnectError::Tls)?;

        Ok((stream, started.elapsed()))
    }
}

fn tls_client_config(params: &TransportParams) -> Result<ClientConfig, ProbeError> {
    let mut roots = RootCertStore::empty();
    roots.extend(TLS_SERVER_ROOTS.iter().cloned());

    let mut config = ClientConfig::builder_with_provider(Arc::new(default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| ProbeError::config(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    config.alpn_protocols = if params.force_attempt_http2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };
    Ok(config)
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}

// Loopback targets never go through a proxy.
fn is_loopback(uri: &Uri) -> bool {
    match uri.host().map(strip_brackets) {
        Some(host) if host.eq_ignore_ascii_case("localhost") => true,
        Some(host) => host.parse::<IpAddr>().map(|ip| ip.is_loopback()).unwrap_or(false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback(&"http://localhost:8080/".parse().unwrap()));
        assert!(is_loopback(&"http://127.0.0.1/".parse().unwrap()));
        assert!(is_loopback(&"http://[::1]:9000/x".parse().unwrap()));
        assert!(!is_loopback(&"https://api.example.com/".parse().unwrap()));
        assert!(!is_loopback(&"http://10.0.0.7/".parse().unwrap()));
    }

    #[test]
    fn test_usage_reports_prior_requests() {
        let usage = Arc::new(ConnectionUsage::new());

        let (first, guard) = usage.begin();
        assert_eq!(first.served_before, 0);
        assert_eq!(first.in_flight_before, 0);
        assert_eq!(first.idle_for, None);
        drop(guard);

        let (second, guard) = usage.begin();
        assert_eq!(second.served_before, 1);
        assert_eq!(second.in_flight_before, 0);
        assert!(second.idle_for.is_some());

        // multiplexed request while the second is still running
        let (third, _third_guard) = usage.begin();
        assert_eq!(third.in_flight_before, 1);
        assert_eq!(third.idle_for, None);
        drop(guard);

        assert_eq!(usage.served(), 3);
    }

    #[test]
    fn test_just_released_until_next_write() {
        let usage = Arc::new(ConnectionUsage::new());
        assert!(!usage.just_released(HANDBACK_GRACE));

        let (_, guard) = usage.begin();
        assert!(!usage.just_released(HANDBACK_GRACE));
        drop(guard);
        assert!(usage.just_released(Duration::from_secs(60)));
        assert!(!usage.just_released(Duration::ZERO));

        usage.mark_writing();
        assert!(!usage.just_released(Duration::from_secs(60)));
    }

    #[test]
    fn test_closed_connection_is_never_pending() {
        let usage = Arc::new(ConnectionUsage::new());
        drop(usage.begin().1);
        usage.closed.store(true, Ordering::Release);
        assert!(!usage.just_released(Duration::from_secs(60)));
    }

    #[test]
    fn test_host_state_in_use() {
        let open = Arc::new(ConnectionUsage::new());
        let gone = Arc::new(ConnectionUsage::new());
        let mut state = HostState {
            slots: None,
            connections: vec![Arc::downgrade(&gone)],
        };
        drop(gone);
        assert!(!state.in_use());

        state.connections.push(Arc::downgrade(&open));
        assert!(state.in_use());
        open.closed.store(true, Ordering::Release);
        assert!(!state.in_use());

        state.slots = Some(Arc::new(Semaphore::new(2)));
        assert!(!state.in_use());
        let permit = state.slots.clone().unwrap().try_acquire_owned().unwrap();
        assert!(state.in_use());
        drop(permit);
        assert!(!state.in_use());
    }

    #[test]
    fn test_alpn_follows_http2_setting() {
        let params = TransportParams::default();
        let config = tls_client_config(&params).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let params = TransportParams {
            force_attempt_http2: false,
            ..TransportParams::default()
        };
        let config = tls_client_config(&params).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_connector_starts_with_no_connections() {
        let params = TransportParams {
            proxy: ProxyMode::Disabled,
            ..TransportParams::default()
        };
        let connector = ProbeConnector::new(None, &params).unwrap();
        assert_eq!(connector.connections_opened(), 0);
        assert!(connector.same_as(&connector.clone()));
        assert!(connector.proxy_for(&"http://example.com/".parse().unwrap()).is_none());
    }
}
