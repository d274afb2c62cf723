use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Per-request connection telemetry, read back from the transport after a
/// request completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestTrace {
    /// Wall-clock time of the whole request/response cycle, body included.
    pub total_time: Duration,
    /// The connection existed (and had served a response) before this request.
    pub is_conn_reused: bool,
    /// The reused connection carried no other in-flight request when picked.
    pub is_conn_was_idle: bool,
    /// How long the connection sat idle before this request, when it was idle.
    pub conn_idle_time: Option<Duration>,
    /// Dial time (proxy tunnel included) for freshly established connections.
    pub connect_time: Option<Duration>,
    pub tls_handshake_time: Option<Duration>,
    /// Time from send until the response head arrived.
    pub server_time: Duration,
    /// Time spent reading the response body.
    pub response_time: Duration,
    pub connection_id: u64,
    pub remote_addr: Option<SocketAddr>,
    pub negotiated_h2: bool,
}
