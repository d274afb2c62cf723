//! Proxy routing taken from `HTTP_PROXY`/`HTTPS_PROXY`.
//!
//! This binary rewrites the process environment, so everything runs inside a
//! single test.

use conn_reuse_probe::services::{
    issue, DemoServer, HttpClientPool, PoolConfig, ProxyMode, TransportMode, TransportParams,
};
use conn_reuse_probe::{NetworkFailure, ProbeError};
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Uri};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

/// Accepts one connection, captures the request head and answers with `reply`.
async fn fake_proxy(reply: &'static [u8]) -> (SocketAddr, oneshot::Receiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
        stream.write_all(reply).await.unwrap();
        let _ = stream.shutdown().await;
    });

    (addr, rx)
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case(name).then(|| value.trim())
    })
}

#[tokio::test]
async fn test_environment_proxy_routing() {
    let (plain_proxy, plain_head) =
        fake_proxy(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok").await;
    let (tunnel_proxy, tunnel_head) =
        fake_proxy(b"HTTP/1.1 200 Connection established\r\n\r\n").await;

    for key in [
        "http_proxy",
        "https_proxy",
        "all_proxy",
        "ALL_PROXY",
        "no_proxy",
        "NO_PROXY",
        "REQUEST_METHOD",
    ] {
        env::remove_var(key);
    }
    env::set_var("HTTP_PROXY", format!("http://user:pass@{plain_proxy}"));
    env::set_var("HTTPS_PROXY", format!("http://user:pass@{tunnel_proxy}"));

    let pool = HttpClientPool::new(PoolConfig {
        size: 1,
        transport_mode: TransportMode::PerClient,
        transport: TransportParams {
            proxy: ProxyMode::Environment,
            ..TransportParams::default()
        },
        ..PoolConfig::default()
    })
    .unwrap();
    let client = pool.acquire();

    // plain HTTP goes to the proxy in absolute form, with the proxy's credentials
    let url: Uri = "http://backend.example.test/items?limit=5".parse().unwrap();
    let (response, trace) = issue(client, Method::GET, &url, Bytes::new(), HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(response.body(), &Bytes::from_static(b"ok"));
    assert!(!trace.is_conn_reused);

    let head = plain_head.await.unwrap();
    assert_eq!(
        head.lines().next(),
        Some("GET http://backend.example.test/items?limit=5 HTTP/1.1")
    );
    assert_eq!(header(&head, "proxy-authorization"), Some("Basic dXNlcjpwYXNz"));
    assert_eq!(header(&head, "host"), Some("backend.example.test"));

    // HTTPS is tunneled with CONNECT; the proxy hangs up after the tunnel is up
    let url: Uri = "https://backend.example.test:8443/secure".parse().unwrap();
    let err = issue(client, Method::GET, &url, Bytes::new(), HeaderMap::new())
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            ProbeError::Network {
                kind: NetworkFailure::Tls,
                ..
            }
        ),
        "{err:?}"
    );

    let head = tunnel_head.await.unwrap();
    assert_eq!(
        head.lines().next(),
        Some("CONNECT backend.example.test:8443 HTTP/1.1")
    );
    assert_eq!(header(&head, "proxy-authorization"), Some("Basic dXNlcjpwYXNz"));

    // loopback targets skip the proxy entirely
    let server = DemoServer::bind("127.0.0.1:0".parse().unwrap(), Duration::ZERO)
        .await
        .unwrap()
        .spawn()
        .unwrap();
    let url: Uri = server.url("/direct").parse().unwrap();
    let (response, _) = issue(client, Method::GET, &url, Bytes::new(), HeaderMap::new())
        .await
        .unwrap();
    assert_eq!(response.body(), &Bytes::from_static(b"Hello, \"/direct\""));
    assert_eq!(client.transport().proxy_authorization(&url), None);

    server.shutdown().await;
}
