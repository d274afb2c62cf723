use crate::error::{BoxError, NetworkFailure, ProbeError};
use crate::models::trace::RequestTrace;
use crate::services::connector::{ConnectError, ConnectionMeta};
use crate::services::http_client_pool::PooledClient;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, AUTHORIZATION, EXPECT, PROXY_AUTHORIZATION};
use hyper::{Method, Request, Response, Uri};
use std::error::Error as StdError;
use std::io;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::debug;

/// Performs exactly one request through `client` and reports how the
/// connection underneath was obtained.
///
/// The client's default credentials are sent unless `headers` already carry
/// an `Authorization` value. Nothing is retried: a failed dial or send is
/// returned as [`ProbeError::Network`]. A failure while reading the body is
/// returned as [`ProbeError::BodyRead`] and still carries the trace.
pub async fn issue(
    client: &PooledClient,
    method: Method,
    url: &Uri,
    body: Bytes,
    headers: HeaderMap,
) -> Result<(Response<Bytes>, RequestTrace), ProbeError> {
    let started = Instant::now();
    let request = build_request(client, method, url, body, headers)?;

    let send = client.transport().http().request(request);
    let response = match client.request_timeout() {
        Some(limit) => match timeout(limit, send).await {
            Ok(result) => result,
            Err(_) => return Err(timed_out(url, limit)),
        },
        None => send.await,
    }
    .map_err(|e| ProbeError::Network {
        url: url.to_string(),
        kind: classify(&e),
        source: e.into(),
    })?;
    let server_time = started.elapsed();

    let meta = response.extensions().get::<ConnectionMeta>().cloned();
    let (mut trace, in_flight) = match &meta {
        Some(meta) => {
            let (usage, in_flight) = meta.usage.begin();
            let reused = usage.served_before > 0;
            let trace = RequestTrace {
                is_conn_reused: reused,
                is_conn_was_idle: reused && usage.in_flight_before == 0,
                conn_idle_time: usage.idle_for,
                connect_time: (!reused).then_some(meta.connect_time),
                tls_handshake_time: meta.tls_handshake_time.filter(|_| !reused),
                connection_id: meta.id,
                remote_addr: meta.remote_addr,
                negotiated_h2: meta.negotiated_h2,
                ..RequestTrace::default()
            };
            (trace, Some(in_flight))
        }
        None => (RequestTrace::default(), None),
    };
    trace.server_time = server_time;

    let (parts, body) = response.into_parts();
    let read_started = Instant::now();
    let remaining = client
        .request_timeout()
        .map(|limit| limit.saturating_sub(started.elapsed()));
    let collected: Result<Bytes, BoxError> = match remaining {
        Some(limit) => match timeout(limit, body.collect()).await {
            Ok(result) => result.map(|c| c.to_bytes()).map_err(Into::into),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "response body timed out").into()),
        },
        None => body.collect().await.map(|c| c.to_bytes()).map_err(Into::into),
    };
    drop(in_flight);

    trace.response_time = read_started.elapsed();
    trace.total_time = started.elapsed();

    debug!(
        url = %url,
        connection = trace.connection_id,
        reused = trace.is_conn_reused,
        was_idle = trace.is_conn_was_idle,
        "Request finished"
    );

    match collected {
        Ok(bytes) => Ok((Response::from_parts(parts, bytes), trace)),
        Err(source) => Err(ProbeError::BodyRead {
            url: url.to_string(),
            trace,
            source,
        }),
    }
}

fn build_request(
    client: &PooledClient,
    method: Method,
    url: &Uri,
    body: Bytes,
    mut headers: HeaderMap,
) -> Result<Request<Full<Bytes>>, ProbeError> {
    if !headers.contains_key(AUTHORIZATION) {
        if let Some(auth) = client.default_authorization() {
            headers.insert(AUTHORIZATION, auth.clone());
        }
    }
    if !headers.contains_key(PROXY_AUTHORIZATION) {
        if let Some(auth) = client.transport().proxy_authorization(url) {
            headers.insert(PROXY_AUTHORIZATION, auth);
        }
    }
    // bodies are written eagerly, there is no 100-continue handshake
    headers.remove(EXPECT);

    let mut request = Request::builder()
        .method(method)
        .uri(url.clone())
        .body(Full::new(body))
        .map_err(|e| ProbeError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = headers;
    Ok(request)
}

fn timed_out(url: &Uri, limit: Duration) -> ProbeError {
    ProbeError::Network {
        url: url.to_string(),
        kind: NetworkFailure::Timeout,
        source: io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no response within {limit:?}"),
        )
        .into(),
    }
}

fn classify(err: &hyper_util::client::legacy::Error) -> NetworkFailure {
    let mut current = Some(err as &(dyn StdError + 'static));
    while let Some(e) = current {
        if let Some(connect) = e.downcast_ref::<ConnectError>() {
            match connect {
                ConnectError::TlsTimeout(_) => return NetworkFailure::Timeout,
                ConnectError::Tls(_) | ConnectError::ServerName(_) => return NetworkFailure::Tls,
                ConnectError::Proxy(_) | ConnectError::ProxyScheme(_) => return NetworkFailure::Proxy,
                _ => {}
            }
        }
        if let Some(io) = e.downcast_ref::<io::Error>() {
            match io.kind() {
                io::ErrorKind::ConnectionRefused => return NetworkFailure::Refused,
                io::ErrorKind::TimedOut => return NetworkFailure::Timeout,
                _ => {}
            }
        }
        current = e.source();
    }

    if err.is_connect() {
        NetworkFailure::Connect
    } else {
        NetworkFailure::Transport
    }
}
